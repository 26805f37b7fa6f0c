use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::models::{AccessTokenResponse, MessageResponse, OutboundMessage, check_errcode};
use crate::token::{TokenCache, TokenGrant, TokenSource};

const SEND_PATH: &str = "/cgi-bin/message/send";
const TOKEN_PATH: &str = "/cgi-bin/gettoken";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound path back to the WeCom user.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<MessageResponse>;
}

fn http_client() -> Result<Client> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// WeCom application message API, authorized by the shared token cache.
pub struct WeComTransport {
    client: Client,
    base_url: String,
    tokens: Arc<TokenCache>,
}

impl WeComTransport {
    pub fn new(base_url: &str, tokens: Arc<TokenCache>) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }
}

#[async_trait]
impl MessageSender for WeComTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<MessageResponse> {
        let access_token = self.tokens.access_token();
        if access_token.is_empty() {
            tracing::warn!("Sending message before the first access token was fetched");
        }

        let response: MessageResponse = self
            .client
            .post(format!("{}{}", self.base_url, SEND_PATH))
            .query(&[("access_token", access_token.as_str())])
            .json(message)
            .send()
            .await?
            .json()
            .await?;

        if let Err(e) = check_errcode(response.errcode, &response.errmsg) {
            tracing::warn!(
                code = response.errcode,
                touser = %message.touser,
                "Message sending failed with error: {}",
                response.errmsg
            );
            return Err(e);
        }

        Ok(response)
    }
}

/// Fetches access tokens from `cgi-bin/gettoken`.
pub struct WeComTokenSource {
    client: Client,
    base_url: String,
    corp_id: String,
    corp_secret: String,
}

impl WeComTokenSource {
    pub fn new(base_url: &str, corp_id: &str, corp_secret: &str) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            corp_id: corp_id.to_string(),
            corp_secret: corp_secret.to_string(),
        })
    }
}

#[async_trait]
impl TokenSource for WeComTokenSource {
    async fn fetch_token(&self) -> Result<TokenGrant> {
        let response: AccessTokenResponse = self
            .client
            .get(format!("{}{}", self.base_url, TOKEN_PATH))
            .query(&[
                ("corpid", self.corp_id.as_str()),
                ("corpsecret", self.corp_secret.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        check_errcode(response.errcode, &response.errmsg)?;

        Ok(TokenGrant {
            access_token: response.access_token,
            expires_in: Duration::from_secs(response.expires_in),
        })
    }
}
