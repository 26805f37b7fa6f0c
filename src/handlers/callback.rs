//! The WeCom callback endpoint.
//!
//! A GET carrying `echostr` is the URL verification handshake. A POST carries
//! an encrypted user message: text messages start a chat session whose
//! replies are relayed in the background, anything else gets a notice.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::handlers::relay::spawn_relay;
use crate::models::{CallbackParams, InboundMessage, MsgKind, OutboundMessage};
use crate::service::RelayService;

pub const TEXT_ONLY_NOTICE: &str = "抱歉，目前仅支持文本输入，请尝试用文字与我交流 :-/";

pub async fn health() -> &'static str {
    "ok"
}

fn method_not_allowed(allowed: Method) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, allowed.as_str().to_string())],
        "Method Not Allowed",
    )
        .into_response()
}

pub async fn callback(
    State(service): State<Arc<RelayService>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    if uri.query().is_none_or(str::is_empty) {
        tracing::warn!(path = %uri.path(), "Callback without query string");
        return StatusCode::NOT_FOUND.into_response();
    }

    let params = match Query::<CallbackParams>::try_from_uri(&uri) {
        Ok(Query(params)) => params,
        Err(e) => {
            tracing::warn!("Failed to parse callback query: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if !params.is_valid() {
        tracing::warn!("Callback is missing msg_signature, timestamp or nonce");
        return StatusCode::BAD_REQUEST.into_response();
    }

    if params.is_handshake() {
        return verify_url(&service, &method, &params);
    }

    if method != Method::POST {
        tracing::warn!(%method, "Message callback must be POST");
        return method_not_allowed(Method::POST);
    }

    let plaintext = match service.crypto.decrypt_message(
        &params.msg_signature,
        &params.timestamp,
        &params.nonce,
        &body,
    ) {
        Ok(plaintext) => plaintext,
        Err(e) if e.is_crypto() => {
            tracing::error!("Failed to decrypt callback message: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(e) => {
            tracing::warn!("Malformed encrypted envelope: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let message = match InboundMessage::from_xml(&plaintext) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!("Failed to parse decrypted message: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tracing::info!(
        from = %message.from_user_name,
        msg_type = %message.msg_type,
        msg_id = %message.msg_id,
        "Received message"
    );

    match message.kind() {
        MsgKind::Text => start_session(&service, &message),
        _ => send_text_only_notice(&service, &message).await,
    }
    StatusCode::OK.into_response()
}

fn verify_url(service: &RelayService, method: &Method, params: &CallbackParams) -> Response {
    if method != Method::GET {
        tracing::warn!(%method, "URL verification must be GET");
        return method_not_allowed(Method::GET);
    }
    match service.crypto.verify_url(
        &params.msg_signature,
        &params.timestamp,
        &params.nonce,
        &params.echostr,
    ) {
        Ok(echo) => {
            tracing::info!("Callback URL verified");
            (StatusCode::OK, echo).into_response()
        }
        Err(e) => {
            tracing::error!("URL verification failed: {}", e);
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

fn start_session(service: &RelayService, message: &InboundMessage) {
    if message.content.trim().is_empty() {
        tracing::info!(from = %message.from_user_name, "Ignoring blank text message");
        return;
    }
    let request = service.chat_request(message);
    tracing::debug!(session_id = %request.session_id, "Opening chat session");
    let channels = service.engine.open_session(request);
    spawn_relay(
        service.sender.clone(),
        message.reply_target(),
        service.config.wecom.duplicate_check_interval,
        channels,
    );
}

async fn send_text_only_notice(service: &RelayService, message: &InboundMessage) {
    let notice = OutboundMessage::text(
        &message.reply_target(),
        TEXT_ONLY_NOTICE,
        service.config.wecom.duplicate_check_interval,
    );
    if let Err(e) = service.sender.send(&notice).await {
        tracing::warn!(touser = %notice.touser, "Failed to send text-only notice: {}", e);
    }
}
