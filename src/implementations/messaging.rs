//! Direct-message and group-chat contract calls.
//!
//! Each function works on a fresh `Binding`, so it is agnostic to which wallet
//! signs. Writes wait for the receipt; reads always go back to the contract.

use ethers::{
    abi::{Detokenize, RawLog},
    contract::{ContractCall, EthEvent},
    providers::Middleware,
    types::{Address, TransactionReceipt, U256},
};
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    implementations::contracts::{Binding, group::GroupCreatedFilter},
    types::{
        CreatedGroupOut, FriendOut, GroupOut, GroupRole, MemberRoleOut, MessageOut, TxOut, UserOut,
    },
};

/// Submit a call and wait for it to be mined.
pub async fn confirm<M, D>(call: ContractCall<M, D>, action: &str) -> AppResult<TransactionReceipt>
where
    M: Middleware + 'static,
    D: Detokenize,
{
    let pending = call
        .send()
        .await
        .map_err(|err| AppError::Contract(format!("{action}: {err}")))?;
    let tx_hash = *pending;
    debug!(tx = ?tx_hash, "{action} submitted, waiting for confirmation");
    let receipt = pending
        .await
        .map_err(|err| AppError::Rpc(format!("{action}: {err}")))?
        .ok_or_else(|| AppError::Contract(format!("{action}: transaction was dropped")))?;

    if receipt.status.map(|s| s.is_zero()).unwrap_or(false) {
        return Err(AppError::Contract(format!(
            "{action}: transaction {:#x} reverted",
            receipt.transaction_hash
        )));
    }
    info!(tx = ?receipt.transaction_hash, "{action} confirmed");
    Ok(receipt)
}

fn tx_out<M>(binding: &Binding<M>, receipt: &TransactionReceipt) -> TxOut {
    TxOut {
        tx_hash: format!("{:#x}", receipt.transaction_hash),
        block_number: receipt.block_number.map(|b| b.as_u64()),
        account: format!("{:#x}", binding.account),
        signer: binding.signer,
    }
}

fn saturating_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

fn read_error(action: &str, err: impl std::fmt::Display) -> AppError {
    AppError::Contract(format!("{action}: {err}"))
}

pub async fn create_user<M>(binding: &Binding<M>, name: &str) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.direct()?;
    let receipt = confirm(contract.create_user(name.to_string()), "create user").await?;
    Ok(tx_out(binding, &receipt))
}

pub async fn username<M>(binding: &Binding<M>, account: Address) -> AppResult<String>
where
    M: Middleware + 'static,
{
    binding
        .direct()?
        .get_username(account)
        .call()
        .await
        .map_err(|err| read_error("get username", err))
}

pub async fn send_message<M>(binding: &Binding<M>, to: Address, content: &str) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.direct()?;
    let receipt = confirm(contract.send_message(to, content.to_string()), "send message").await?;
    Ok(tx_out(binding, &receipt))
}

pub async fn read_messages<M>(binding: &Binding<M>, peer: Address) -> AppResult<Vec<MessageOut>>
where
    M: Middleware + 'static,
{
    let messages = binding
        .direct()?
        .read_messages(peer)
        .call()
        .await
        .map_err(|err| read_error("read messages", err))?;

    Ok(messages
        .into_iter()
        .map(|(sender, timestamp, content)| MessageOut {
            sender: format!("{sender:#x}"),
            timestamp: saturating_u64(timestamp),
            content,
        })
        .collect())
}

pub async fn add_friend<M>(binding: &Binding<M>, friend: Address, name: &str) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.direct()?;
    let receipt = confirm(contract.add_friend(friend, name.to_string()), "add friend").await?;
    Ok(tx_out(binding, &receipt))
}

pub async fn block_user<M>(binding: &Binding<M>, account: Address) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.direct()?;
    let receipt = confirm(contract.block_user(account), "block user").await?;
    Ok(tx_out(binding, &receipt))
}

pub async fn unblock_user<M>(binding: &Binding<M>, account: Address) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.direct()?;
    let receipt = confirm(contract.unblock_user(account), "unblock user").await?;
    Ok(tx_out(binding, &receipt))
}

pub async fn friends<M>(binding: &Binding<M>) -> AppResult<Vec<FriendOut>>
where
    M: Middleware + 'static,
{
    let friends = binding
        .direct()?
        .get_friends()
        .call()
        .await
        .map_err(|err| read_error("list friends", err))?;

    Ok(friends
        .into_iter()
        .map(|(pubkey, name)| FriendOut {
            address: format!("{pubkey:#x}"),
            name,
        })
        .collect())
}

pub async fn users<M>(binding: &Binding<M>) -> AppResult<Vec<UserOut>>
where
    M: Middleware + 'static,
{
    let users = binding
        .direct()?
        .get_all_app_users()
        .call()
        .await
        .map_err(|err| read_error("list users", err))?;

    Ok(users
        .into_iter()
        .map(|(name, account)| UserOut {
            name,
            address: format!("{account:#x}"),
        })
        .collect())
}

pub async fn blocked<M>(binding: &Binding<M>) -> AppResult<Vec<String>>
where
    M: Middleware + 'static,
{
    let blocked = binding
        .direct()?
        .get_all_blocked_users()
        .call()
        .await
        .map_err(|err| read_error("list blocked users", err))?;

    Ok(blocked.into_iter().map(|a| format!("{a:#x}")).collect())
}

pub async fn create_group<M>(
    binding: &Binding<M>,
    name: &str,
    description: &str,
    is_private: bool,
) -> AppResult<CreatedGroupOut>
where
    M: Middleware + 'static,
{
    let contract = binding.group()?;
    let call = contract.create_group(name.to_string(), description.to_string(), is_private);
    let receipt = confirm(call, "create group").await?;
    Ok(created_group_out(binding, &receipt))
}

/// The group was mined even when its event is missing, so the id is left empty instead of failing.
fn created_group_out<M>(binding: &Binding<M>, receipt: &TransactionReceipt) -> CreatedGroupOut {
    let group_id = group_created_id(binding.address, receipt);
    if group_id.is_none() {
        warn!(
            tx = %format!("{:#x}", receipt.transaction_hash),
            "create group: no GroupCreated event in receipt"
        );
    }
    CreatedGroupOut {
        group_id,
        tx: tx_out(binding, receipt),
    }
}

/// Group id from the `GroupCreated` event emitted by `contract`.
pub fn group_created_id(contract: Address, receipt: &TransactionReceipt) -> Option<u64> {
    receipt
        .logs
        .iter()
        .filter(|log| log.address == contract)
        .find_map(|log| {
            let raw = RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            };
            GroupCreatedFilter::decode_log(&raw).ok()
        })
        .map(|event| saturating_u64(event.group_id))
}

pub async fn group_info<M>(binding: &Binding<M>, group_id: u64) -> AppResult<GroupOut>
where
    M: Middleware + 'static,
{
    let (name, description, owner, created_at, is_private, member_count) = binding
        .group()?
        .get_group(U256::from(group_id))
        .call()
        .await
        .map_err(|err| read_error("get group", err))?;

    Ok(GroupOut {
        id: group_id,
        name,
        description,
        owner: format!("{owner:#x}"),
        created_at: saturating_u64(created_at),
        is_private,
        member_count: saturating_u64(member_count),
    })
}

pub async fn user_groups<M>(binding: &Binding<M>, account: Address) -> AppResult<Vec<GroupOut>>
where
    M: Middleware + 'static,
{
    let ids = binding
        .group()?
        .get_user_groups(account)
        .call()
        .await
        .map_err(|err| read_error("list groups", err))?;

    let mut groups = Vec::with_capacity(ids.len());
    for id in ids {
        groups.push(group_info(binding, saturating_u64(id)).await?);
    }
    Ok(groups)
}

pub async fn join_group<M>(binding: &Binding<M>, group_id: u64) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.group()?;
    let receipt = confirm(contract.join_group(U256::from(group_id)), "join group").await?;
    Ok(tx_out(binding, &receipt))
}

pub async fn send_group_message<M>(
    binding: &Binding<M>,
    group_id: u64,
    content: &str,
) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.group()?;
    let call = contract.send_message(U256::from(group_id), content.to_string());
    let receipt = confirm(call, "send group message").await?;
    Ok(tx_out(binding, &receipt))
}

pub async fn group_messages<M>(binding: &Binding<M>, group_id: u64) -> AppResult<Vec<MessageOut>>
where
    M: Middleware + 'static,
{
    let messages = binding
        .group()?
        .get_group_messages(U256::from(group_id))
        .call()
        .await
        .map_err(|err| read_error("read group messages", err))?;

    Ok(messages
        .into_iter()
        .map(|(sender, timestamp, content)| MessageOut {
            sender: format!("{sender:#x}"),
            timestamp: saturating_u64(timestamp),
            content,
        })
        .collect())
}

pub async fn member_role<M>(
    binding: &Binding<M>,
    group_id: u64,
    account: Address,
) -> AppResult<MemberRoleOut>
where
    M: Middleware + 'static,
{
    let (_, raw_role, _) = binding
        .group()?
        .get_group_member(U256::from(group_id), account)
        .call()
        .await
        .map_err(|err| read_error("get group member", err))?;

    let role = GroupRole::from_raw(raw_role)
        .ok_or_else(|| AppError::Contract(format!("unknown group role {raw_role}")))?;

    Ok(MemberRoleOut {
        group_id,
        address: format!("{account:#x}"),
        role,
    })
}

pub async fn set_member_role<M>(
    binding: &Binding<M>,
    group_id: u64,
    account: Address,
    role: GroupRole,
) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.group()?;
    let call = contract.update_member_role(U256::from(group_id), account, role.as_raw());
    let receipt = confirm(call, "update member role").await?;
    Ok(tx_out(binding, &receipt))
}

/// Accepting adds the requester as a plain member.
pub async fn respond_join_request<M>(
    binding: &Binding<M>,
    group_id: u64,
    requester: Address,
    accept: bool,
) -> AppResult<TxOut>
where
    M: Middleware + 'static,
{
    let contract = binding.group()?;
    let id = U256::from(group_id);
    let receipt = if accept {
        let call = contract.add_member(id, requester, GroupRole::Member.as_raw());
        confirm(call, "accept join request").await?
    } else {
        confirm(contract.reject_join_request(id, requester), "reject join request").await?
    };
    Ok(tx_out(binding, &receipt))
}

pub async fn pending_join_requests<M>(binding: &Binding<M>, group_id: u64) -> AppResult<Vec<String>>
where
    M: Middleware + 'static,
{
    let pending = binding
        .group()?
        .get_pending_join_requests(U256::from(group_id))
        .call()
        .await
        .map_err(|err| read_error("list join requests", err))?;

    Ok(pending.into_iter().map(|a| format!("{a:#x}")).collect())
}
