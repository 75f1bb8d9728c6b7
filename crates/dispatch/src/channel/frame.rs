//! JSON frames exchanged with a remote agent.
//!
//! Every frame is an object tagged by `"type"`. Commands go out, responses
//! and unsolicited notifications come in:
//!
//! ```json
//! {"type":"command","requestId":"…","command":"read_note","params":{"path":"a.md"}}
//! {"type":"response","requestId":"…","success":true,"data":{"content":"…"}}
//! {"type":"file_changed","data":{"path":"a.md"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelFrame {
    Command {
        #[serde(rename = "requestId")]
        request_id: String,
        command: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default)]
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
        #[serde(default)]
        message: String,
    },
    Handshake {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    FileChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl ChannelFrame {
    pub fn command(
        request_id: impl Into<String>,
        command: impl Into<String>,
        params: Value,
    ) -> Self {
        ChannelFrame::Command {
            request_id: request_id.into(),
            command: command.into(),
            params,
        }
    }

    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        ChannelFrame::Response {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        ChannelFrame::Response {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Wire name of the frame type
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelFrame::Command { .. } => "command",
            ChannelFrame::Response { .. } => "response",
            ChannelFrame::Heartbeat { .. } => "heartbeat",
            ChannelFrame::Log { .. } => "log",
            ChannelFrame::Handshake { .. } => "handshake",
            ChannelFrame::FileChanged { .. } => "file_changed",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
