use std::sync::Arc;

use crate::models::{OutboundMessage, ReplyTarget};
use crate::stream::SessionChannels;
use crate::transport::MessageSender;

pub const APOLOGY_TEXT: &str = "抱歉，调用大模型知识引擎出现了一点问题，请稍后再试 :-<";

/// Counters for one finished relay, mostly for logs and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub sent: usize,
    pub failed: usize,
    pub apologized: bool,
}

/// Forwards one session's segments to the WeCom user, in order.
pub async fn relay_replies(
    sender: Arc<dyn MessageSender>,
    target: ReplyTarget,
    duplicate_check_interval: u32,
    mut channels: SessionChannels,
) -> RelayOutcome {
    let mut outcome = RelayOutcome::default();

    while let Some(segment) = channels.segments.recv().await {
        if segment.trim().is_empty() {
            continue;
        }
        let message = OutboundMessage::markdown(&target, segment, duplicate_check_interval);
        match sender.send(&message).await {
            Ok(response) => {
                outcome.sent += 1;
                tracing::debug!(
                    touser = %target.user_id,
                    msgid = %response.msgid,
                    "Segment delivered"
                );
            }
            Err(e) => {
                outcome.failed += 1;
                tracing::warn!(touser = %target.user_id, "Failed to deliver segment: {}", e);
            }
        }
    }

    // The session closes both channels together, so one read settles it.
    if let Some(error) = channels.errors.recv().await {
        tracing::error!(
            touser = %target.user_id,
            msg_id = %target.msg_id,
            "Chat session failed: {}",
            error
        );
        outcome.apologized = true;
        let apology = OutboundMessage::text(&target, APOLOGY_TEXT, duplicate_check_interval);
        if let Err(e) = sender.send(&apology).await {
            tracing::warn!(touser = %target.user_id, "Failed to deliver apology: {}", e);
        }
    }

    tracing::info!(
        touser = %target.user_id,
        msg_id = %target.msg_id,
        sent = outcome.sent,
        failed = outcome.failed,
        apologized = outcome.apologized,
        "Relay finished"
    );
    outcome
}

/// Run `relay_replies` on its own task; the caller does not wait for it.
pub fn spawn_relay(
    sender: Arc<dyn MessageSender>,
    target: ReplyTarget,
    duplicate_check_interval: u32,
    channels: SessionChannels,
) -> tokio::task::JoinHandle<RelayOutcome> {
    tokio::spawn(relay_replies(sender, target, duplicate_check_interval, channels))
}
