//! JSON messages exchanged over the terminal WebSocket.

use serde::{Deserialize, Deserializer, Serialize};

pub const PROMPT: &str = "$ ";
pub const GREETING: &str = "Welcome to CLI Quest Terminal!";

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Any JSON number, clamped into `1..=u16::MAX`. Resizing is cosmetic, so an
/// odd value must not fail the whole frame.
fn dimension<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    let value = f64::deserialize(deserializer)?;
    Ok(value.clamp(1.0, f64::from(u16::MAX)) as u16)
}

/// Inbound frame, discriminated by `type`. Unknown types decode to
/// [`ClientMessage::Unknown`] so newer clients keep working.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Command {
        data: String,
    },
    Resize {
        #[serde(default = "default_cols", deserialize_with = "dimension")]
        cols: u16,
        #[serde(default = "default_rows", deserialize_with = "dimension")]
        rows: u16,
    },
    #[serde(other)]
    Unknown,
}

/// Outbound frame: `{"type":"output"|"error","data":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    Output(String),
    Error(String),
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","data":"encoding failed: {}"}}"#, e)
        })
    }
}

pub fn decode(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Terminate `text` with a prompt on its own line.
pub fn with_prompt(text: &str) -> String {
    if text.is_empty() {
        PROMPT.to_string()
    } else if text.ends_with('\n') {
        format!("{}{}", text, PROMPT)
    } else {
        format!("{}\n{}", text, PROMPT)
    }
}
