use serde::{Deserialize, Deserializer};

use crate::error::{RelayError, Result};

/// Event tags the chat engine is known to send on `event:` lines
pub const KNOWN_EVENTS: [&str; 5] = ["reply", "error", "token_stat", "reference", "thought"];

/// Reference ids arrive as strings from some engine versions and as numbers from others
fn deserialize_flexible_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FlexibleString {
        String(String),
        Int(i64),
        Float(f64),
    }

    Ok(match FlexibleString::deserialize(deserializer)? {
        FlexibleString::String(s) => s,
        FlexibleString::Int(i) => i.to_string(),
        FlexibleString::Float(f) => f.to_string(),
    })
}

/// One decoded `data:` line of the engine's event stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    TokenStat {
        #[serde(default)]
        payload: ProcedurePayload,
    },
    Thought {
        #[serde(default)]
        payload: ProcedurePayload,
    },
    Reply {
        #[serde(default)]
        payload: ReplyPayload,
    },
    Reference {
        #[serde(default)]
        payload: ReferencePayload,
    },
    Error {
        #[serde(default)]
        error: EngineError,
    },
    /// Frame types this relay does not act on
    #[serde(other)]
    Unknown,
}

impl StreamFrame {
    pub fn decode(data: &str) -> Result<Self> {
        serde_json::from_str(data.trim())
            .map_err(|e| RelayError::MalformedFrame(format!("{e} in {data:?}")))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenStat { .. } => "token_stat",
            Self::Thought { .. } => "thought",
            Self::Reply { .. } => "reply",
            Self::Reference { .. } => "reference",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProcedurePayload {
    #[serde(default)]
    pub procedures: Vec<Procedure>,
}

/// A step the engine is running, e.g. a reasoning or retrieval phase
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Procedure {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    /// Milliseconds
    #[serde(default)]
    pub elapsed: u64,
    #[serde(default)]
    pub debugging: Debugging,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Debugging {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReplyPayload {
    /// Full answer so far, not a delta
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_final: bool,
    /// Echo of the user's own input
    #[serde(default)]
    pub is_from_self: bool,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub record_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReferencePayload {
    #[serde(default)]
    pub references: Vec<Reference>,
}

/// A citation the answer may point at with `[id]`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Reference {
    #[serde(deserialize_with = "deserialize_flexible_string", default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub doc_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EngineError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}
