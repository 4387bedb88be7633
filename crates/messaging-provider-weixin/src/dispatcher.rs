use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};
use tracing::{debug, error, warn};

use crate::cipher::MessageCipher;
use crate::config::WeixinConfig;
use crate::envelope::{EnvelopeCodec, WebhookQuery};
use crate::error::WeixinError;
use crate::message::NormalizedMessage;
use crate::reply::{ReplySpec, encode_reply};

pub const CONTENT_TYPE_XML: &str = "application/xml";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Largest POST body accepted from the platform.
pub const BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub query: WebhookQuery,
    /// Raw body as received, before any decoding.
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(method: Method, query: WebhookQuery, body: impl Into<Vec<u8>>) -> Self {
        WebhookRequest {
            method,
            query,
            body: body.into(),
        }
    }

    pub fn get(query: WebhookQuery) -> Self {
        Self::new(Method::GET, query, Vec::new())
    }

    pub fn post(query: WebhookQuery, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::POST, query, body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: String,
}

impl WebhookResponse {
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        WebhookResponse {
            status,
            content_type: Some(CONTENT_TYPE_TEXT),
            body: body.into(),
        }
    }

    pub fn xml(body: String) -> Self {
        WebhookResponse {
            status: StatusCode::OK,
            content_type: Some(CONTENT_TYPE_XML),
            body,
        }
    }

    /// Timely acknowledgement that sends no message.
    pub fn empty() -> Self {
        WebhookResponse {
            status: StatusCode::OK,
            content_type: None,
            body: String::new(),
        }
    }
}

/// Business logic answering inbound messages.
#[async_trait]
pub trait WeixinApplication: Send + Sync {
    async fn reply(&self, message: &NormalizedMessage) -> Result<ReplySpec, WeixinError>;
}

/// Adapts a synchronous closure into a [`WeixinApplication`].
pub struct ReplyFn<F>(pub F);

#[async_trait]
impl<F> WeixinApplication for ReplyFn<F>
where
    F: Fn(&NormalizedMessage) -> Result<ReplySpec, WeixinError> + Send + Sync,
{
    async fn reply(&self, message: &NormalizedMessage) -> Result<ReplySpec, WeixinError> {
        (self.0)(message)
    }
}

#[async_trait]
impl<A: WeixinApplication + ?Sized> WeixinApplication for Arc<A> {
    async fn reply(&self, message: &NormalizedMessage) -> Result<ReplySpec, WeixinError> {
        self.as_ref().reply(message).await
    }
}

/// Request dispatcher for one configured webhook endpoint. Cheap to clone
/// and safe to share between concurrent requests.
#[derive(Clone)]
pub struct WeixinWebhook {
    config: Arc<WeixinConfig>,
    codec: EnvelopeCodec,
}

impl fmt::Debug for WeixinWebhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeixinWebhook")
            .field("app_id", &self.config.app_id())
            .field("encrypted", &self.codec.has_cipher())
            .finish_non_exhaustive()
    }
}

impl WeixinWebhook {
    pub fn new(config: WeixinConfig) -> Result<Self, WeixinError> {
        let cipher = config
            .build_cipher()?
            .map(|cipher| Arc::new(cipher) as Arc<dyn MessageCipher>);
        Ok(Self::assemble(config, cipher))
    }

    /// Uses `cipher` instead of the one derived from the configured key.
    pub fn with_cipher(
        config: WeixinConfig,
        cipher: Arc<dyn MessageCipher>,
    ) -> Result<Self, WeixinError> {
        config.validate()?;
        Ok(Self::assemble(config, Some(cipher)))
    }

    fn assemble(config: WeixinConfig, cipher: Option<Arc<dyn MessageCipher>>) -> Self {
        let codec = EnvelopeCodec::new(config.token.clone(), cipher);
        WeixinWebhook {
            config: Arc::new(config),
            codec,
        }
    }

    pub fn config(&self) -> &WeixinConfig {
        &self.config
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    pub async fn handle<A>(
        &self,
        request: &WebhookRequest,
        app: &A,
    ) -> Result<WebhookResponse, WeixinError>
    where
        A: WeixinApplication + ?Sized,
    {
        match request.method {
            Method::GET => {
                let echostr = self.codec.handshake(&request.query)?;
                Ok(WebhookResponse::text(StatusCode::OK, echostr))
            }
            Method::POST => self.exchange(request, app).await,
            ref other => {
                debug!(method = %other, "weixin webhook method not implemented");
                Err(WeixinError::MethodNotAllowed(other.clone()))
            }
        }
    }

    /// Like [`handle`](Self::handle) but always yields a response, mapping
    /// failures onto their fixed status and body.
    pub async fn respond<A>(&self, request: &WebhookRequest, app: &A) -> WebhookResponse
    where
        A: WeixinApplication + ?Sized,
    {
        match self.handle(request, app).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_terminal() {
                    debug!(status = %err.status(), "weixin webhook request refused");
                } else {
                    error!(error = %err, "weixin webhook request failed");
                }
                err.into_response()
            }
        }
    }

    async fn exchange<A>(
        &self,
        request: &WebhookRequest,
        app: &A,
    ) -> Result<WebhookResponse, WeixinError>
    where
        A: WeixinApplication + ?Sized,
    {
        if request.body.len() > BODY_LIMIT {
            warn!(size = request.body.len(), "weixin webhook body too large");
            return Err(WeixinError::PayloadTooLarge {
                size: request.body.len(),
                limit: BODY_LIMIT,
            });
        }

        let message = self.codec.decode(&request.query, &request.body)?;
        let reply = app.reply(&message).await?;
        let Some(outgoing) = encode_reply(&reply, &message) else {
            debug!("weixin reply is empty, acknowledging without a message");
            return Ok(WebhookResponse::empty());
        };
        debug!(msg_type = outgoing.msg_type(), "weixin reply encoded");

        let body = self.codec.encode(&request.query, outgoing.render()?)?;
        Ok(WebhookResponse::xml(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::handshake_signature;

    fn webhook() -> WeixinWebhook {
        WeixinWebhook::new(WeixinConfig::from_token("some token")).unwrap()
    }

    fn echo() -> ReplyFn<impl Fn(&NormalizedMessage) -> Result<ReplySpec, WeixinError>> {
        ReplyFn(|message: &NormalizedMessage| {
            Ok(ReplySpec::text(message.content().unwrap_or_default()))
        })
    }

    #[test]
    fn construction_requires_token() {
        assert!(matches!(
            WeixinWebhook::new(WeixinConfig::default()),
            Err(WeixinError::Config(_))
        ));
    }

    #[tokio::test]
    async fn get_echoes_challenge() {
        let mut query = WebhookQuery::default();
        query.insert("timestamp", "1409304348");
        query.insert("nonce", "1634398466");
        query.insert(
            "signature",
            handshake_signature("some token", "1409304348", "1634398466"),
        );
        query.insert("echostr", "pong");
        let response = webhook()
            .respond(&WebhookRequest::get(query), &echo())
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, "pong");
    }

    #[tokio::test]
    async fn other_methods_are_not_implemented() {
        for method in [Method::HEAD, Method::PUT, Method::DELETE] {
            let request = WebhookRequest::new(method, WebhookQuery::default(), Vec::new());
            let response = webhook().respond(&request, &echo()).await;
            assert_eq!(response.status, StatusCode::NOT_IMPLEMENTED);
            assert_eq!(response.body, "Not Implemented");
        }
    }

    #[tokio::test]
    async fn oversized_body_is_refused_before_parsing() {
        let request = WebhookRequest::post(WebhookQuery::default(), vec![b'x'; BODY_LIMIT + 1]);
        let err = webhook().handle(&request, &echo()).await.unwrap_err();
        assert!(matches!(err, WeixinError::PayloadTooLarge { .. }));
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn malformed_body_propagates() {
        let request = WebhookRequest::post(WebhookQuery::default(), "<xml><Content>");
        let err = webhook().handle(&request, &echo()).await.unwrap_err();
        assert!(matches!(err, WeixinError::MalformedXml(_)));
    }

    #[test]
    fn debug_hides_token() {
        let rendered = format!("{:?}", webhook());
        assert!(!rendered.contains("some token"));
        assert!(rendered.contains("encrypted: false"));
    }
}
