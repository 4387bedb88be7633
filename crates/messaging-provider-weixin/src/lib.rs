//! Server side of the Weixin official-account callback protocol.
//!
//! [`WeixinWebhook`] verifies callback signatures, unwraps plain or
//! AES-encrypted `<xml>` messages into a [`NormalizedMessage`], asks a
//! [`WeixinApplication`] for a [`ReplySpec`] and encodes the answer the way
//! the platform expects it.

pub mod cipher;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod envelope;
pub mod error;
pub mod message;
pub mod reply;
pub mod signature;

pub use cipher::{CipherError, Decrypted, MessageCipher, WxBizMsgCrypt};
pub use config::WeixinConfig;
pub use dispatcher::{
    BODY_LIMIT, ReplyFn, WebhookRequest, WebhookResponse, WeixinApplication, WeixinWebhook,
};
pub use envelope::{Envelope, EnvelopeCodec, Mode, WebhookQuery};
pub use error::WeixinError;
pub use message::{Field, NormalizedMessage};
pub use reply::{Article, Music, OutgoingContent, OutgoingMessage, ReplySpec, encode_reply};
