//! Message types flowing through the core.
//!
//! Transports hand the dispatcher an `InboundMessage`; the coalescer batches
//! them and `combine` folds a batch into one `CombinedMessage` for the
//! worker. The core never inspects message content beyond trimming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::Priority;

/// A message received from a transport channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Unique message ID.
    pub id: Uuid,
    /// Session the message belongs to.
    pub session_key: String,
    /// Transport channel this message came from.
    pub channel: String,
    /// Optional sender display name.
    pub sender: Option<String>,
    /// Message text.
    pub text: String,
    /// Attached images, in order.
    pub images: Vec<ImageAttachment>,
    /// Scheduling hints derived by the transport.
    pub hints: DispatchHints,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Channel-specific metadata, opaque to the core.
    pub metadata: serde_json::Value,
}

impl InboundMessage {
    pub fn new(session_key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_key: session_key.into(),
            channel: "unknown".to_string(),
            sender: None,
            text: text.into(),
            images: Vec::new(),
            hints: DispatchHints::default(),
            received_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }

    pub fn with_hints(mut self, hints: DispatchHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An image reference attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub url: String,
    pub media_type: Option<String>,
}

impl ImageAttachment {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            media_type: None,
        }
    }
}

/// Flags a transport sets so the dispatcher can pick a priority and a
/// provider without understanding the transport itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchHints {
    pub mention: bool,
    pub reply: bool,
    pub urgent: bool,
    pub heartbeat: bool,
    pub cron: bool,
    pub subagent: bool,
    /// Explicit priority, overriding flag-based resolution.
    pub priority: Option<Priority>,
    /// Provider override for this message.
    pub provider: Option<String>,
    /// Preferred auth profile for this message.
    pub profile: Option<String>,
}

/// A coalesced batch folded into a single worker input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombinedMessage {
    pub text: String,
    pub images: Vec<ImageAttachment>,
}
