//! Chat capability used by the pipeline and the command handlers.
//!
//! [`ChatApi`] is the raw protocol surface. [`Messenger`] layers the
//! process-wide behaviour on top: one retry after a rate-limit signal with a
//! shared wait hint, and a render cache that turns repeated identical edits
//! into no-ops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::util::lock_mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Inline buttons attached to a message, row by row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Keyboard {
    pub inline_keyboard: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(button: Button) -> Self {
        Self::new().row(vec![button])
    }

    pub fn row(mut self, buttons: Vec<Button>) -> Self {
        if !buttons.is_empty() {
            self.inline_keyboard.push(buttons);
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    #[error("message is not modified")]
    NotModified,
    #[error("chat api error: {0}")]
    Api(String),
    #[error("chat transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError>;

    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError>;

    async fn reply_to(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError>;

    async fn delete_message(&self, message: MessageRef) -> Result<(), ChatError>;
}

#[derive(Debug, Clone, Copy)]
struct FloodWait {
    until: Instant,
    delay: Duration,
}

pub struct Messenger {
    api: Arc<dyn ChatApi>,
    flood_wait: Mutex<Option<FloodWait>>,
    rendered: Mutex<HashMap<MessageRef, (String, Option<Keyboard>)>>,
}

impl Messenger {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self {
            api,
            flood_wait: Mutex::new(None),
            rendered: Mutex::new(HashMap::new()),
        }
    }

    pub async fn send(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError> {
        match self.api.send_message(chat_id, text, keyboard).await {
            Err(ChatError::RateLimited(delay)) => {
                self.wait_out(delay, "send_message").await;
                self.api.send_message(chat_id, text, keyboard).await
            }
            other => other,
        }
    }

    pub async fn reply(
        &self,
        to: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError> {
        match self.api.reply_to(to, text, keyboard).await {
            Err(ChatError::RateLimited(delay)) => {
                self.wait_out(delay, "reply_message").await;
                self.api.reply_to(to, text, keyboard).await
            }
            other => other,
        }
    }

    /// Edits `message` unless it already shows exactly this text and keyboard.
    pub async fn edit(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, ChatError> {
        let content = (text.to_string(), keyboard.cloned());
        if self.with_rendered(|r| r.get(&message) == Some(&content)) {
            return Ok(message);
        }

        let result = match self.api.edit_message(message, text, keyboard).await {
            Err(ChatError::RateLimited(delay)) => {
                self.wait_out(delay, "edit_message").await;
                self.api.edit_message(message, text, keyboard).await
            }
            other => other,
        };

        match result {
            Ok(()) | Err(ChatError::NotModified) => {
                self.with_rendered(|r| r.insert(message, content));
                Ok(message)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes a message; failures are logged, never returned.
    pub async fn delete(&self, message: MessageRef) {
        let result = match self.api.delete_message(message).await {
            Err(ChatError::RateLimited(delay)) => {
                self.wait_out(delay, "delete_message").await;
                self.api.delete_message(message).await
            }
            other => other,
        };
        if let Err(e) = result {
            warn!("failed to delete message {}: {e}", message.message_id);
        }
        self.forget(message);
    }

    pub fn forget(&self, message: MessageRef) {
        self.with_rendered(|r| r.remove(&message));
    }

    pub fn clear(&self) {
        self.with_rendered(|r| r.clear());
        *lock_mutex(&self.flood_wait) = None;
    }

    fn with_rendered<R>(
        &self,
        f: impl FnOnce(&mut HashMap<MessageRef, (String, Option<Keyboard>)>) -> R,
    ) -> R {
        f(&mut lock_mutex(&self.rendered))
    }

    /// Sleeps out a rate-limit signal. When another caller is already waiting
    /// out an equal or longer window, only the rest of that window is slept.
    async fn wait_out(&self, delay: Duration, action: &str) {
        let now = Instant::now();
        let sleep_for = {
            let mut hint = lock_mutex(&self.flood_wait);
            match *hint {
                Some(current) if current.until >= now && current.delay >= delay => {
                    let remaining = current.until - now;
                    debug!("{action}: joining pending flood wait, {remaining:?} left");
                    remaining + Duration::from_secs(1)
                }
                _ => {
                    *hint = Some(FloodWait {
                        until: now + delay,
                        delay,
                    });
                    warn!("{action}: rate limited, waiting {delay:?}");
                    delay
                }
            }
        };
        tokio::time::sleep(sleep_for).await;
    }
}
