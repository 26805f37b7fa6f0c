use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Length in bytes of a generated chat request id before hex encoding
const REQUEST_ID_LEN: usize = 24;

// ===== WeCom callback =====

/// Query parameters WeCom appends to every callback URL
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub msg_signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub echostr: String,
}

impl CallbackParams {
    /// Signature, timestamp and nonce must all be present
    pub fn is_valid(&self) -> bool {
        !self.msg_signature.is_empty() && !self.timestamp.is_empty() && !self.nonce.is_empty()
    }

    /// A non-empty `echostr` marks the URL verification handshake
    pub fn is_handshake(&self) -> bool {
        !self.echostr.is_empty()
    }
}

/// Message kinds a WeCom self-built app can receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Text,
    Image,
    Voice,
    Video,
    Location,
    Link,
    Event,
    Other,
}

impl MsgKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "text" => Self::Text,
            "image" => Self::Image,
            "voice" => Self::Voice,
            "video" => Self::Video,
            "location" => Self::Location,
            "link" => Self::Link,
            "event" => Self::Event,
            _ => Self::Other,
        }
    }
}

/// Decrypted user message delivered to the callback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: String,
    #[serde(rename = "FromUserName", default)]
    pub from_user_name: String,
    #[serde(rename = "CreateTime", default)]
    pub create_time: i64,
    #[serde(rename = "MsgType", default)]
    pub msg_type: String,
    #[serde(rename = "MsgId", default)]
    pub msg_id: String,
    #[serde(rename = "AgentID", default)]
    pub agent_id: i64,
    #[serde(rename = "Content", default)]
    pub content: String,
}

impl InboundMessage {
    pub fn from_xml(xml: &str) -> Result<Self> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    pub fn kind(&self) -> MsgKind {
        MsgKind::parse(&self.msg_type)
    }

    pub fn reply_target(&self) -> ReplyTarget {
        ReplyTarget {
            user_id: self.from_user_name.clone(),
            agent_id: self.agent_id,
            msg_id: self.msg_id.clone(),
        }
    }
}

/// Where the replies for one inbound message go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub user_id: String,
    pub agent_id: i64,
    /// Inbound message id, kept for log correlation
    pub msg_id: String,
}

// ===== WeCom outbound =====

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextBody {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msgtype", rename_all = "lowercase")]
pub enum MessageBody {
    Text { text: TextBody },
    Markdown { markdown: TextBody },
}

/// Application message for `cgi-bin/message/send`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub touser: String,
    pub agentid: i64,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_id_trans: Option<u8>,
    pub enable_duplicate_check: u8,
    pub duplicate_check_interval: u32,
}

impl OutboundMessage {
    pub fn text(target: &ReplyTarget, content: impl Into<String>, dup_interval: u32) -> Self {
        Self {
            touser: target.user_id.clone(),
            agentid: target.agent_id,
            body: MessageBody::Text {
                text: TextBody {
                    content: content.into(),
                },
            },
            safe: Some(0),
            enable_id_trans: Some(0),
            enable_duplicate_check: 0,
            duplicate_check_interval: dup_interval,
        }
    }

    pub fn markdown(target: &ReplyTarget, content: impl Into<String>, dup_interval: u32) -> Self {
        Self {
            touser: target.user_id.clone(),
            agentid: target.agent_id,
            body: MessageBody::Markdown {
                markdown: TextBody {
                    content: content.into(),
                },
            },
            safe: None,
            enable_id_trans: None,
            enable_duplicate_check: 0,
            duplicate_check_interval: dup_interval,
        }
    }

    pub fn content(&self) -> &str {
        match &self.body {
            MessageBody::Text { text } => &text.content,
            MessageBody::Markdown { markdown } => &markdown.content,
        }
    }
}

/// Response of the WeCom send API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub invaliduser: String,
    #[serde(default)]
    pub msgid: String,
}

/// Response of `cgi-bin/gettoken`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessTokenResponse {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

/// Turn a non-zero vendor `errcode` into an error
pub fn check_errcode(errcode: i64, errmsg: &str) -> Result<()> {
    if errcode == 0 {
        Ok(())
    } else {
        Err(RelayError::WeCom {
            code: errcode,
            message: errmsg.to_string(),
        })
    }
}

// ===== Chat engine =====

/// Body of the streaming chat request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    pub content: String,
    pub bot_app_key: String,
    pub visitor_biz_id: String,
    pub session_id: String,
    pub streaming_throttle: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_role: Option<String>,
    pub is_evaluate_test: bool,
}

impl ChatRequest {
    /// New request with a fresh session id and request id
    pub fn new(content: &str, app_key: &str, visitor: &str) -> Self {
        Self {
            req_id: Some(new_request_id()),
            content: content.to_string(),
            bot_app_key: app_key.to_string(),
            visitor_biz_id: visitor.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            streaming_throttle: 1,
            timeout: None,
            system_role: None,
            is_evaluate_test: false,
        }
    }
}

fn new_request_id() -> String {
    let mut bytes = [0u8; REQUEST_ID_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
