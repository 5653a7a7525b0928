use ethers::providers::ProviderError;
use serde_json::{Value, json};
use std::{fmt, io};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("wallet error: {0}")]
    Wallet(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("no browser wallet available: {0}")]
    ProviderAbsent(String),
    #[error("wrong network: {0}")]
    WrongNetwork(String),
    #[error("request rejected by user: {0}")]
    UserRejected(String),
    #[error("contract error: {0}")]
    Contract(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug)]
pub struct JsonRpcErrorPayload {
    pub code: i32,
    pub message: String,
    pub data: Value,
}

impl JsonRpcErrorPayload {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: json!({}),
        }
    }
}

impl AppError {
    pub fn to_json_rpc(&self) -> JsonRpcErrorPayload {
        match self {
            AppError::Config(msg) => JsonRpcErrorPayload::new(-32001, msg.clone()),
            AppError::InvalidInput(msg) => JsonRpcErrorPayload::new(-32602, msg.clone()),
            AppError::Rpc(msg) => JsonRpcErrorPayload::new(-32002, msg.clone()),
            AppError::Wallet(msg) => JsonRpcErrorPayload::new(-32030, msg.clone()),
            AppError::Storage(msg) => JsonRpcErrorPayload::new(-32031, msg.clone()),
            AppError::ProviderAbsent(msg) => JsonRpcErrorPayload::new(-32032, msg.clone()),
            AppError::WrongNetwork(msg) => JsonRpcErrorPayload::new(-32033, msg.clone()),
            // EIP-1193 "user rejected request"
            AppError::UserRejected(msg) => JsonRpcErrorPayload::new(4001, msg.clone()),
            AppError::Contract(msg) => JsonRpcErrorPayload::new(-32050, msg.clone()),
            AppError::Io(msg) => JsonRpcErrorPayload::new(-32040, msg.clone()),
            AppError::Serialization(msg) => JsonRpcErrorPayload::new(-32700, msg.clone()),
            AppError::Internal(msg) => JsonRpcErrorPayload::new(-32603, msg.clone()),
        }
    }

    /// Short title used when the error is surfaced as a notice.
    pub fn title(&self) -> &'static str {
        match self {
            AppError::ProviderAbsent(_) => "Wallet Error",
            AppError::WrongNetwork(_) => "Network Error",
            AppError::UserRejected(_) => "Request Rejected",
            AppError::Contract(_) => "Transaction Error",
            AppError::Wallet(_) => "Session Wallet Error",
            AppError::Rpc(_) => "Connection Error",
            _ => "Error",
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        AppError::Rpc(err.to_string())
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl fmt::Display for JsonRpcErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}
