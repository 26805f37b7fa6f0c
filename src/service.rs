use axum::{
    Router,
    routing::{any, get},
};
use std::sync::Arc;

use crate::config::Config;
use crate::crypto::{MessageCrypto, WxBizMsgCrypt};
use crate::error::Result;
use crate::handlers::callback::{callback, health};
use crate::models::{ChatRequest, InboundMessage};
use crate::stream::ChatEngineClient;
use crate::token::TokenCache;
use crate::transport::{MessageSender, WeComTransport};

/// Everything a callback needs to verify, answer and relay one message
pub struct RelayService {
    pub(crate) config: Arc<Config>,
    pub(crate) crypto: Arc<dyn MessageCrypto>,
    pub(crate) sender: Arc<dyn MessageSender>,
    pub(crate) engine: ChatEngineClient,
}

impl RelayService {
    pub fn new(
        config: Arc<Config>,
        crypto: Arc<dyn MessageCrypto>,
        sender: Arc<dyn MessageSender>,
        engine: ChatEngineClient,
    ) -> Self {
        Self {
            config,
            crypto,
            sender,
            engine,
        }
    }

    /// Wire up the production collaborators from configuration
    pub fn from_config(config: Arc<Config>, tokens: Arc<TokenCache>) -> Result<Self> {
        tracing::info!("RelayService::from_config() - Building collaborators");
        let crypto = WxBizMsgCrypt::new(
            &config.wecom.token,
            &config.wecom.encoding_aes_key,
            &config.wecom.corp_id,
        )?;
        let sender = WeComTransport::new(&config.wecom.api_base_url, tokens)?;
        let engine = ChatEngineClient::new(
            &config.engine.sse_url,
            config.session_timeout(),
            config.engine.segment_buffer,
        );
        tracing::info!(
            sse_url = %config.engine.sse_url,
            session_timeout_secs = config.engine.session_timeout_secs,
            "RelayService::from_config() - Ready"
        );

        Ok(Self::new(config, Arc::new(crypto), Arc::new(sender), engine))
    }

    pub fn router(self: Arc<Self>) -> Router {
        let path = self.config.server.callback_path.clone();
        Router::new()
            .route("/health", get(health))
            .route(&path, any(callback))
            .with_state(self)
    }

    /// Chat request for one inbound text message, the sender acting as visitor
    pub fn chat_request(&self, message: &InboundMessage) -> ChatRequest {
        let engine = &self.config.engine;
        let mut request = ChatRequest::new(
            &message.content,
            &engine.app_key,
            &message.from_user_name,
        );
        request.streaming_throttle = engine.streaming_throttle;
        request.system_role = engine.system_role.clone();
        request.timeout = engine.request_timeout_secs;
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MockMessageCrypto;
    use crate::transport::MockMessageSender;
    use std::time::Duration;

    #[test]
    fn test_chat_request_forwards_content_and_engine_settings() {
        let mut config = Config::default();
        config.engine.app_key = "app-key".into();
        config.engine.streaming_throttle = 5;
        config.engine.system_role = Some("客服助手".into());
        config.engine.request_timeout_secs = Some(120);

        let service = RelayService::new(
            Arc::new(config),
            Arc::new(MockMessageCrypto::new()),
            Arc::new(MockMessageSender::new()),
            ChatEngineClient::new("http://127.0.0.1:9", Duration::from_secs(1), 1),
        );
        let message = InboundMessage {
            from_user_name: "lisi".into(),
            msg_type: "text".into(),
            content: "  你好  ".into(),
            ..Default::default()
        };

        let request = service.chat_request(&message);
        assert_eq!(request.content, "  你好  ");
        assert_eq!(request.bot_app_key, "app-key");
        assert_eq!(request.visitor_biz_id, "lisi");
        assert_eq!(request.streaming_throttle, 5);
        assert_eq!(request.system_role.as_deref(), Some("客服助手"));
        assert_eq!(request.timeout, Some(120));

        let other = service.chat_request(&message);
        assert_ne!(request.session_id, other.session_id);
    }

    #[test]
    fn test_from_config_rejects_bad_key() {
        let mut config = Config::default();
        config.wecom.encoding_aes_key = "short".into();
        let tokens = TokenCache::new(
            Arc::new(crate::token::MockTokenSource::new()),
            Duration::from_secs(10),
            crate::retry::RetryPolicy::ExponentialBackoff(Default::default()),
        );
        assert!(RelayService::from_config(Arc::new(config), tokens).is_err());
    }
}
