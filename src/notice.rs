use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::error::AppError;

const NOTICE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// A single user-visible message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn from_error(err: &AppError) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: err.title().to_string(),
            message: err.to_string(),
        }
    }
}

/// Fan-out for notices. Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => error!(title = %notice.title, "{}", notice.message),
            _ => info!(title = %notice.title, "{}", notice.message),
        }
        let _ = self.tx.send(notice);
    }

    pub fn error(&self, err: &AppError) {
        self.publish(Notice::from_error(err));
    }
}
