use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{implementations::contracts::SignerPath, wallet::SessionState};

#[derive(Debug, Default, Deserialize)]
pub struct NoParams {}

#[derive(Debug, Deserialize)]
pub struct AddressParams {
    pub address: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountParams {
    /// Defaults to the connected account.
    #[serde(default)]
    pub account: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserParams {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageParams {
    pub to: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct AddFriendParams {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApproveSenderParams {
    pub sender: String,
    #[serde(default)]
    pub account: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Deserialize)]
pub struct GroupIdParams {
    pub group_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct GroupMessageParams {
    pub group_id: u64,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct MemberParams {
    pub group_id: u64,
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct SetRoleParams {
    pub group_id: u64,
    pub address: String,
    pub role: GroupRole,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequestParams {
    pub group_id: u64,
    pub requester: String,
    pub accept: bool,
}

#[derive(Debug, Serialize)]
pub struct BalanceOut {
    pub address: String,
    pub symbol: String,
    pub raw: String,
    pub decimals: u32,
    pub formatted: String,
}

#[derive(Debug, Serialize)]
pub struct SessionWalletOut {
    pub address: Option<String>,
    pub state: SessionState,
    pub exists: bool,
    pub verified: bool,
    pub watching: bool,
}

#[derive(Debug, Serialize)]
pub struct SwitchOut {
    pub switched: bool,
}

#[derive(Debug, Serialize)]
pub struct TxOut {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub account: String,
    pub signer: SignerPath,
}

#[derive(Debug, Serialize)]
pub struct MessageOut {
    pub sender: String,
    pub timestamp: u64,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct FriendOut {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct UserOut {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct GroupOut {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub created_at: u64,
    pub is_private: bool,
    pub member_count: u64,
}

#[derive(Debug, Serialize)]
pub struct CreatedGroupOut {
    /// `None` when the receipt carried no `GroupCreated` event.
    pub group_id: Option<u64>,
    pub tx: TxOut,
}

#[derive(Debug, Serialize)]
pub struct MemberRoleOut {
    pub group_id: u64,
    pub address: String,
    pub role: GroupRole,
}

/// Membership role as stored by the group contract.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Member,
    Admin,
    Owner,
}

impl GroupRole {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(GroupRole::Member),
            1 => Some(GroupRole::Admin),
            2 => Some(GroupRole::Owner),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            GroupRole::Member => 0,
            GroupRole::Admin => 1,
            GroupRole::Owner => 2,
        }
    }
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRole::Member => write!(f, "member"),
            GroupRole::Admin => write!(f, "admin"),
            GroupRole::Owner => write!(f, "owner"),
        }
    }
}
