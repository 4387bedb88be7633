use http::StatusCode;

use crate::cipher::CipherError;
use crate::dispatcher::WebhookResponse;

pub const INVALID_SIGNATURE: &str = "Invalid signature";
pub const NOT_IMPLEMENTED: &str = "Not Implemented";
pub const PAYLOAD_TOO_LARGE: &str = "Payload Too Large";
pub const INTERNAL_ERROR: &str = "Internal Server Error";

#[derive(thiserror::Error, Debug)]
pub enum WeixinError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("method {0} not implemented")]
    MethodNotAllowed(http::Method),
    #[error("request body of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("malformed xml: {0}")]
    MalformedXml(String),
    #[error("failed to render xml: {0}")]
    Render(String),
    #[error("cipher failure: {0}")]
    Cipher(#[from] CipherError),
    #[error("encrypted exchange requested but no encoding key is configured")]
    CipherUnavailable,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("application failed: {0}")]
    Application(#[from] anyhow::Error),
}

impl WeixinError {
    pub fn rejected(status: StatusCode, message: impl Into<String>) -> Self {
        WeixinError::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            WeixinError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WeixinError::MethodNotAllowed(_) => StatusCode::NOT_IMPLEMENTED,
            WeixinError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            WeixinError::Rejected { status, .. } => *status,
            WeixinError::MalformedXml(_)
            | WeixinError::Render(_)
            | WeixinError::Cipher(_)
            | WeixinError::CipherUnavailable
            | WeixinError::Config(_)
            | WeixinError::Application(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure is a terminal protocol answer (401/413/501/app
    /// rejection) rather than an unexpected fault the host should report.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WeixinError::InvalidSignature
                | WeixinError::MethodNotAllowed(_)
                | WeixinError::PayloadTooLarge { .. }
                | WeixinError::Rejected { .. }
        )
    }

    /// Fixed-body response for the failure. Internal faults never expose
    /// their cause to the remote platform.
    pub fn into_response(self) -> WebhookResponse {
        let status = self.status();
        let body = match self {
            WeixinError::InvalidSignature => INVALID_SIGNATURE.to_string(),
            WeixinError::MethodNotAllowed(_) => NOT_IMPLEMENTED.to_string(),
            WeixinError::PayloadTooLarge { .. } => PAYLOAD_TOO_LARGE.to_string(),
            WeixinError::Rejected { message, .. } => message,
            _ => INTERNAL_ERROR.to_string(),
        };
        WebhookResponse::text(status, body)
    }
}

impl From<xml::reader::Error> for WeixinError {
    fn from(err: xml::reader::Error) -> Self {
        WeixinError::MalformedXml(err.to_string())
    }
}

impl From<xml::writer::Error> for WeixinError {
    fn from(err: xml::writer::Error) -> Self {
        WeixinError::Render(err.to_string())
    }
}
