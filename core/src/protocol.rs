//! Wire protocol: binary frame prefixes and the JSON control-plane taxonomy.
//! Binary frames carry terminal bytes unless the first byte is a known prefix;
//! text frames are JSON objects discriminated by a `type` field.

use serde::{Deserialize, Serialize};

/// Client binary frame: `[0x00, rows_hi, rows_lo, cols_hi, cols_lo]`.
pub const FRAME_RESIZE: u8 = 0x00;
/// Client binary frame: `[0x01, len_hi, len_lo, name..., file bytes...]`.
pub const FRAME_FILE_UPLOAD: u8 = 0x01;
/// Server binary frame: `[0x02, index, total, payload...]`, one slice of a
/// larger gzip-compressed message.
pub const FRAME_CHUNK: u8 = 0x02;

/// Longest accepted session display name, after trimming.
pub const MAX_SESSION_NAME: usize = 32;

/// Text messages accepted from clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientText {
    Ping { data: serde_json::Value },
    Chat { user_name: String, text: String },
    RenameSession { name: String },
    /// Recognized JSON with an unknown `type`; logged and dropped upstream.
    Unknown(String),
}

/// Parse a client text frame. Returns None for anything that is not a JSON
/// object with a string `type` (protocol violation, drop without disconnect).
pub fn parse_client_text(raw: &str) -> Option<ClientText> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let kind = value.get("type")?.as_str()?;
    match kind {
        "ping" => Some(ClientText::Ping {
            data: value.get("data").cloned().unwrap_or(serde_json::Value::Null),
        }),
        "chat" => {
            let user_name = value.get("userName")?.as_str()?.to_string();
            let text = value.get("text")?.as_str()?.to_string();
            Some(ClientText::Chat { user_name, text })
        }
        "rename_session" => {
            let name = value.get("name")?.as_str()?.to_string();
            Some(ClientText::RenameSession { name })
        }
        other => Some(ClientText::Unknown(other.to_string())),
    }
}

/// Worktree summary attached to an `exit` message when the session ran on a
/// branch managed by the worktree integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: String,
    #[serde(rename = "targetBranch")]
    pub target_branch: String,
}

/// Text messages sent to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong {
        data: serde_json::Value,
    },
    Status {
        viewers: usize,
        cols: u16,
        rows: u16,
        assistant: String,
        #[serde(rename = "sessionName")]
        session_name: String,
        #[serde(rename = "uuidShort")]
        uuid_short: String,
        #[serde(rename = "workDir")]
        work_dir: String,
    },
    Chat {
        #[serde(rename = "userName")]
        user_name: String,
        text: String,
        timestamp: String,
    },
    FileUpload {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        worktree: Option<WorktreeInfo>,
    },
}

impl ServerMessage {
    /// Serialize for a text frame. The taxonomy contains no non-string keys,
    /// so serialization cannot fail; fall back to an empty object regardless.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Parse a `[0x00, ...]` resize frame into (rows, cols). Zero dimensions are
/// out of range and rejected.
pub fn parse_resize(frame: &[u8]) -> Option<(u16, u16)> {
    if frame.len() != 5 || frame[0] != FRAME_RESIZE {
        return None;
    }
    let rows = u16::from_be_bytes([frame[1], frame[2]]);
    let cols = u16::from_be_bytes([frame[3], frame[4]]);
    if rows == 0 || cols == 0 {
        return None;
    }
    Some((rows, cols))
}

/// Parse a `[0x01, ...]` upload frame into (filename, file bytes).
pub fn parse_file_upload(frame: &[u8]) -> Option<(String, &[u8])> {
    if frame.len() < 3 || frame[0] != FRAME_FILE_UPLOAD {
        return None;
    }
    let name_len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
    if name_len == 0 || frame.len() < 3 + name_len {
        return None;
    }
    let name = std::str::from_utf8(&frame[3..3 + name_len]).ok()?.to_string();
    Some((name, &frame[3 + name_len..]))
}

/// Validate a `rename_session` name: trimmed, at most 32 characters, ASCII
/// alphanumeric plus space, hyphen and underscore. Returns the trimmed name,
/// or None when the rename must be silently ignored.
pub fn validate_session_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_SESSION_NAME {
        return None;
    }
    let allowed = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_');
    if allowed {
        Some(trimmed.to_string())
    } else {
        None
    }
}
