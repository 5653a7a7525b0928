use std::sync::Arc;

use ethers::providers::JsonRpcClient;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Stdout},
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{
    error::{AppError, AppResult},
    layers::service::ServiceLayer,
    types::{
        AccountParams, AddFriendParams, AddressParams, ApproveSenderParams, CreateGroupParams,
        CreateUserParams, GroupIdParams, GroupMessageParams, JoinRequestParams, MemberParams,
        NoParams, SendMessageParams, SetRoleParams,
    },
};

type SharedWriter = Arc<Mutex<BufWriter<Stdout>>>;

/// Runtime that speaks JSON-RPC 2.0 over stdin/stdout.
///
/// Notices and wallet events are pushed to the host as notifications on the
/// same stream as responses.
pub struct McpServer<P, F> {
    service: ServiceLayer<P, F>,
}

impl<P, F> McpServer<P, F>
where
    P: JsonRpcClient + Clone + 'static,
    F: JsonRpcClient + Clone + 'static,
{
    pub fn new(service: ServiceLayer<P, F>) -> Self {
        Self { service }
    }

    /// Start processing JSON-RPC requests until EOF on stdin.
    pub async fn run_stdio(self) -> AppResult<()> {
        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let writer: SharedWriter = Arc::new(Mutex::new(BufWriter::new(io::stdout())));
        let mut line = String::new();

        let mut forwarders = vec![spawn_forwarder(
            self.service.subscribe_notices(),
            writer.clone(),
            "notice",
        )];
        if let Some(events) = self.service.subscribe_wallet_events() {
            forwarders.push(spawn_forwarder(events, writer.clone(), "wallet_event"));
        }

        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                break;
            }

            if line.trim().is_empty() {
                continue;
            }

            let request: Result<RpcRequest, _> = serde_json::from_str(&line);
            let response = match request {
                Ok(req) => self.handle_request(req).await,
                Err(err) => {
                    warn!("failed to parse JSON-RPC request: {err}");
                    RpcResponse::error(Value::Null, -32700, format!("parse error: {err}"))
                }
            };
            write_line(&writer, &response).await?;
        }

        self.service.shutdown();
        for task in forwarders {
            task.abort();
        }
        Ok(())
    }

    async fn handle_request(&self, req: RpcRequest) -> RpcResponse {
        let RpcRequest {
            method, params, id, ..
        } = req;
        let server = self;

        macro_rules! route {
            ($params:ty, |$svc:ident, $p:ident| $call:expr) => {
                server
                    .dispatch::<$params, _, _, _>(id, params, |$svc, $p| async move { $call })
                    .await
            };
        }

        match method.as_str() {
            "get_current_chain" => route!(NoParams, |s, _p| s.current_chain().await),
            "switch_to_testnet" => route!(NoParams, |s, _p| s.switch_to_testnet().await),

            "create_session_wallet" => route!(NoParams, |s, _p| s.create_session_wallet().await),
            "session_wallet_status" => route!(NoParams, |s, _p| Ok(s.session_wallet_status())),
            "check_session_balance" => route!(NoParams, |s, _p| s.check_session_balance().await),
            "start_funding_watch" => route!(NoParams, |s, _p| s.start_funding_watch().await),
            "stop_funding_watch" => route!(NoParams, |s, _p| s.stop_funding_watch().await),
            "clear_session_wallet" => route!(NoParams, |s, _p| s.clear_session_wallet().await),

            "create_user" => route!(CreateUserParams, |s, p| s.create_user(p).await),
            "get_username" => route!(AddressParams, |s, p| s.get_username(p).await),
            "send_message" => route!(SendMessageParams, |s, p| s.send_message(p).await),
            "read_messages" => route!(AddressParams, |s, p| s.read_messages(p).await),
            "add_friend" => route!(AddFriendParams, |s, p| s.add_friend(p).await),
            "block_user" => route!(AddressParams, |s, p| s.block_user(p).await),
            "unblock_user" => route!(AddressParams, |s, p| s.unblock_user(p).await),
            "list_friends" => route!(NoParams, |s, _p| s.list_friends().await),
            "list_users" => route!(NoParams, |s, _p| s.list_users().await),
            "list_blocked" => route!(NoParams, |s, _p| s.list_blocked().await),

            "create_group" => route!(CreateGroupParams, |s, p| s.create_group(p).await),
            "user_groups" => route!(AccountParams, |s, p| s.user_groups(p).await),
            "group_info" => route!(GroupIdParams, |s, p| s.group_info(p).await),
            "join_group" => route!(GroupIdParams, |s, p| s.join_group(p).await),
            "send_group_message" => {
                route!(GroupMessageParams, |s, p| s.send_group_message(p).await)
            }
            "group_messages" => route!(GroupIdParams, |s, p| s.group_messages(p).await),
            "member_role" => route!(MemberParams, |s, p| s.member_role(p).await),
            "set_member_role" => route!(SetRoleParams, |s, p| s.set_member_role(p).await),
            "respond_join_request" => {
                route!(JoinRequestParams, |s, p| s.respond_join_request(p).await)
            }
            "pending_join_requests" => {
                route!(GroupIdParams, |s, p| s.pending_join_requests(p).await)
            }

            "sent_requests" => route!(AccountParams, |s, p| s.sent_requests(p).await),
            "approved_senders" => route!(AccountParams, |s, p| s.approved_senders(p).await),
            "approve_sender" => route!(ApproveSenderParams, |s, p| s.approve_sender(p).await),

            other => {
                warn!("received unknown method {other}");
                RpcResponse::error(id, -32601, format!("method not found: {other}"))
            }
        }
    }

    async fn dispatch<Params, T, H, Fut>(
        &self,
        id: Value,
        params_value: Value,
        handler: H,
    ) -> RpcResponse
    where
        Params: DeserializeOwned,
        T: Serialize,
        H: FnOnce(ServiceLayer<P, F>, Params) -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        match parse_params::<Params>(params_value) {
            Ok(parsed) => match handler(self.service.clone(), parsed).await {
                Ok(result) => match serde_json::to_value(result) {
                    Ok(value) => RpcResponse::success(id, value),
                    Err(err) => {
                        error!("serialization error: {err}");
                        RpcResponse::error(id, -32603, format!("serialization error: {err}"))
                    }
                },
                Err(err) => {
                    error!("handler error: {err}");
                    let payload = err.to_json_rpc();
                    RpcResponse::error_with_data(id, payload.code, payload.message, payload.data)
                }
            },
            Err(err) => {
                warn!("invalid params: {err}");
                RpcResponse::error(id, -32602, err.to_string())
            }
        }
    }
}

fn spawn_forwarder<T, W>(
    mut rx: broadcast::Receiver<T>,
    writer: Arc<Mutex<W>>,
    method: &'static str,
) -> JoinHandle<()>
where
    T: Serialize + Clone + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    // Encode before awaiting so no borrow of `item` lives across the write.
                    let payload = match encode_line(&RpcNotification::new(method, &item)) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!("failed to encode {method}: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = write_payload(&writer, &payload).await {
                        warn!("failed to forward {method}: {err}");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "{method} forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn encode_line<T: Serialize>(message: &T) -> AppResult<Vec<u8>> {
    let mut payload = serde_json::to_vec(message).map_err(AppError::from)?;
    payload.push(b'\n');
    Ok(payload)
}

async fn write_payload<W>(writer: &Arc<Mutex<W>>, payload: &[u8]) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn write_line<T: Serialize>(writer: &SharedWriter, message: &T) -> AppResult<()> {
    let payload = encode_line(message)?;
    write_payload(writer, &payload).await
}

fn parse_params<T: DeserializeOwned>(value: Value) -> Result<T, AppError> {
    // Hosts send `null` or omit params for argument-less methods.
    let value = if value.is_null() { json!({}) } else { value };
    serde_json::from_value(value)
        .map_err(|err| AppError::InvalidInput(format!("invalid params: {err}")))
}

fn default_null() -> Value {
    Value::Null
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default = "default_null")]
    params: Value,
    #[serde(default = "default_null")]
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Value,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: Value, code: i32, message: String) -> Self {
        Self::error_with_data(id, code, message, json!({}))
    }

    fn error_with_data(id: Value, code: i32, message: String, data: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError {
                code,
                message,
                data,
            }),
            id,
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
    data: Value,
}

#[derive(Debug, Serialize)]
struct RpcNotification<'a, T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: &'a T,
}

impl<'a, T> RpcNotification<'a, T> {
    fn new(method: &'static str, params: &'a T) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_params_parse_as_empty_object() {
        let parsed: AccountParams = parse_params(Value::Null).unwrap();
        assert!(parsed.account.is_none());
    }

    #[test]
    fn missing_fields_are_invalid_input() {
        let err = parse_params::<SendMessageParams>(json!({ "to": "0x1" })).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn notification_shape() {
        let notice = crate::notice::Notice::info("Hello", "world");
        let value = serde_json::to_value(RpcNotification::new("notice", &notice)).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "notice");
        assert_eq!(value["params"]["title"], "Hello");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn error_response_omits_result() {
        let value = serde_json::to_value(RpcResponse::error(json!(7), -32601, "nope".into()))
            .unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], -32601);
        assert!(value.get("result").is_none());
    }

    #[tokio::test]
    async fn forwarder_writes_one_notification_per_line() {
        let (tx, rx) = broadcast::channel(4);
        let sink = Arc::new(Mutex::new(Vec::<u8>::new()));
        let task = spawn_forwarder(rx, sink.clone(), "notice");

        tx.send(crate::notice::Notice::info("Hello", "world")).unwrap();
        tx.send(crate::notice::Notice::success("Done", "ok")).unwrap();
        drop(tx);
        task.await.unwrap();

        let written = String::from_utf8(sink.lock().await.clone()).unwrap();
        let lines: Vec<Value> = written
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["method"], "notice");
        assert_eq!(lines[1]["params"]["title"], "Done");
    }
}
