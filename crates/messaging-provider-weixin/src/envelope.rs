//! Plain and encrypted exchange modes: handshake verification, inbound
//! decoding and outbound wrapping.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, warn};

use crate::cipher::MessageCipher;
use crate::document::XmlBuilder;
use crate::error::WeixinError;
use crate::message::NormalizedMessage;
use crate::signature::{handshake_signature, verify};

pub const ENCRYPT_TYPE_AES: &str = "aes";
pub const ENCRYPT_TYPE_RAW: &str = "raw";

/// Upper bound (exclusive) of generated envelope nonces.
const NONCE_RANGE: u64 = 100_000_000_000;

/// Decoded query string of a callback request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookQuery {
    params: BTreeMap<String, String>,
}

impl WebhookQuery {
    pub fn parse(raw: &str) -> Self {
        let params = raw
            .trim_start_matches('?')
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(key), decode_component(value))
            })
            .collect();
        WebhookQuery { params }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Missing parameters read as empty strings.
    pub fn value(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WebhookQuery {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        WebhookQuery {
            params: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(spaced)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Plain,
    Encrypted,
}

impl Mode {
    /// Requests are encrypted only when flagged `aes` and carrying a
    /// `msg_signature`.
    pub fn inbound(query: &WebhookQuery) -> Self {
        let flagged = query.get("encrypt_type") == Some(ENCRYPT_TYPE_AES);
        let signed = query.get("msg_signature").is_some_and(|sig| !sig.is_empty());
        if flagged && signed {
            Mode::Encrypted
        } else {
            Mode::Plain
        }
    }

    /// Replies are plain when `encrypt_type` is absent or `raw`, whatever
    /// the inbound mode was.
    pub fn outbound(query: &WebhookQuery) -> Self {
        match query.get("encrypt_type") {
            None | Some("") | Some(ENCRYPT_TYPE_RAW) => Mode::Plain,
            Some(_) => Mode::Encrypted,
        }
    }
}

/// Outer wrapper of an encrypted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub encrypt: String,
    pub signature: String,
    pub timestamp: i64,
    pub nonce: u64,
}

impl Envelope {
    /// Encrypts `inner_xml` and signs the ciphertext with a fresh timestamp
    /// (milliseconds) and nonce.
    pub fn seal(cipher: &dyn MessageCipher, inner_xml: &str) -> Result<Self, WeixinError> {
        let timestamp = Utc::now().timestamp_millis();
        let nonce = rand::thread_rng().gen_range(0..NONCE_RANGE);
        Self::seal_with(cipher, inner_xml, timestamp, nonce)
    }

    pub fn seal_with(
        cipher: &dyn MessageCipher,
        inner_xml: &str,
        timestamp: i64,
        nonce: u64,
    ) -> Result<Self, WeixinError> {
        let encrypt = cipher.encrypt(inner_xml)?;
        let signature = cipher.sign(&timestamp.to_string(), &nonce.to_string(), &encrypt);
        Ok(Envelope {
            encrypt,
            signature,
            timestamp,
            nonce,
        })
    }

    pub fn render(&self) -> Result<String, WeixinError> {
        let mut xml = XmlBuilder::new()?;
        xml.cdata("Encrypt", &self.encrypt)?
            .cdata("MsgSignature", &self.signature)?
            .text("TimeStamp", &self.timestamp.to_string())?
            .text("Nonce", &self.nonce.to_string())?;
        xml.finish()
    }
}

/// Protocol codec bound to one webhook's token and optional cipher.
#[derive(Clone)]
pub struct EnvelopeCodec {
    token: String,
    cipher: Option<Arc<dyn MessageCipher>>,
}

impl EnvelopeCodec {
    pub fn new(token: impl Into<String>, cipher: Option<Arc<dyn MessageCipher>>) -> Self {
        EnvelopeCodec {
            token: token.into(),
            cipher,
        }
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    fn cipher(&self) -> Result<&dyn MessageCipher, WeixinError> {
        self.cipher.as_deref().ok_or(WeixinError::CipherUnavailable)
    }

    /// GET handshake: returns the `echostr` to send back when the signature
    /// checks out.
    pub fn handshake<'q>(&self, query: &'q WebhookQuery) -> Result<&'q str, WeixinError> {
        let computed = handshake_signature(
            &self.token,
            query.value("timestamp"),
            query.value("nonce"),
        );
        if !verify(query.value("signature"), &computed) {
            warn!("weixin handshake rejected: signature mismatch");
            return Err(WeixinError::InvalidSignature);
        }
        Ok(query.value("echostr"))
    }

    /// Decodes a POST body into the message handed to the application.
    pub fn decode(
        &self,
        query: &WebhookQuery,
        body: &[u8],
    ) -> Result<NormalizedMessage, WeixinError> {
        let outer = NormalizedMessage::parse(body)?;
        match Mode::inbound(query) {
            Mode::Plain => {
                debug!("weixin inbound message is plain");
                Ok(outer)
            }
            Mode::Encrypted => {
                debug!("weixin inbound message is encrypted");
                let cipher = self.cipher()?;
                let encrypted = outer.encrypt().unwrap_or_default();
                let expected =
                    cipher.sign(query.value("timestamp"), query.value("nonce"), encrypted);
                if !verify(query.value("msg_signature"), &expected) {
                    warn!("weixin envelope rejected: msg_signature mismatch");
                    return Err(WeixinError::InvalidSignature);
                }
                let decrypted = cipher.decrypt(encrypted)?;
                if decrypted.message.is_empty() {
                    warn!("weixin envelope rejected: empty plaintext");
                    return Err(WeixinError::InvalidSignature);
                }
                NormalizedMessage::parse(decrypted.message.as_bytes())
            }
        }
    }

    /// Wraps rendered reply XML for the response, encrypting when the query
    /// asks for it.
    pub fn encode(&self, query: &WebhookQuery, reply_xml: String) -> Result<String, WeixinError> {
        match Mode::outbound(query) {
            Mode::Plain => Ok(reply_xml),
            Mode::Encrypted => {
                let envelope = Envelope::seal(self.cipher()?, &reply_xml)?;
                debug!(nonce = envelope.nonce, "weixin reply sealed");
                envelope.render()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::WxBizMsgCrypt;

    const TOKEN: &str = "some token";
    const APP_ID: &str = "wxc107bb57144a5test";
    const KEY: &str = "J5ii3dwYpHNGkKfHgucfnc28S3UjZK9gmp3viUFJGCV";
    const INNER: &str = "<xml><ToUserName><![CDATA[nvshen]]></ToUserName><FromUserName><![CDATA[diaosi]]></FromUserName><Content><![CDATA[测试中]]></Content></xml>";

    fn cipher() -> Arc<dyn MessageCipher> {
        Arc::new(WxBizMsgCrypt::new(TOKEN, KEY, APP_ID).unwrap())
    }

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(TOKEN, Some(cipher()))
    }

    fn query(pairs: &[(&str, &str)]) -> WebhookQuery {
        pairs.iter().copied().collect()
    }

    #[test]
    fn query_parsing_decodes_components() {
        let parsed = WebhookQuery::parse("?echostr=a%20b&nonce=12&flag&label=x+y");
        assert_eq!(parsed.get("echostr"), Some("a b"));
        assert_eq!(parsed.get("nonce"), Some("12"));
        assert_eq!(parsed.get("flag"), Some(""));
        assert_eq!(parsed.get("label"), Some("x y"));
        assert_eq!(parsed.value("missing"), "");
        assert_eq!(WebhookQuery::parse(&parsed.to_query_string()), parsed);
    }

    #[test]
    fn modes_are_selected_independently() {
        let signed = query(&[("encrypt_type", "aes"), ("msg_signature", "abc")]);
        assert_eq!(Mode::inbound(&signed), Mode::Encrypted);
        assert_eq!(Mode::outbound(&signed), Mode::Encrypted);

        let unsigned = query(&[("encrypt_type", "aes"), ("signature", "abc")]);
        assert_eq!(Mode::inbound(&unsigned), Mode::Plain);
        assert_eq!(Mode::outbound(&unsigned), Mode::Encrypted);

        let raw = query(&[("encrypt_type", "raw"), ("msg_signature", "abc")]);
        assert_eq!(Mode::inbound(&raw), Mode::Plain);
        assert_eq!(Mode::outbound(&raw), Mode::Plain);

        assert_eq!(Mode::outbound(&WebhookQuery::default()), Mode::Plain);
    }

    #[test]
    fn handshake_echoes_on_valid_signature() {
        let signature = handshake_signature(TOKEN, "1409304348", "1634398466");
        let q = query(&[
            ("signature", signature.as_str()),
            ("timestamp", "1409304348"),
            ("nonce", "1634398466"),
            ("echostr", "pong"),
        ]);
        assert_eq!(codec().handshake(&q).unwrap(), "pong");
    }

    #[test]
    fn handshake_rejects_missing_or_wrong_signature() {
        assert!(matches!(
            codec().handshake(&WebhookQuery::default()),
            Err(WeixinError::InvalidSignature)
        ));
        let q = query(&[
            ("signature", "invalid_signature"),
            ("timestamp", "1"),
            ("nonce", "2"),
            ("echostr", "pong"),
        ]);
        assert!(matches!(
            codec().handshake(&q),
            Err(WeixinError::InvalidSignature)
        ));
    }

    #[test]
    fn decodes_signed_envelope() {
        let cipher = cipher();
        let envelope = Envelope::seal_with(cipher.as_ref(), INNER, 1409304348, 1634398466).unwrap();
        let q = query(&[
            ("encrypt_type", "aes"),
            ("msg_signature", envelope.signature.as_str()),
            ("timestamp", "1409304348"),
            ("nonce", "1634398466"),
        ]);
        let message = codec()
            .decode(&q, envelope.render().unwrap().as_bytes())
            .unwrap();
        assert_eq!(message.from_user_name(), Some("diaosi"));
        assert_eq!(message.content(), Some("测试中"));
        assert!(message.encrypt().is_none());
    }

    #[test]
    fn rejects_envelope_with_forged_signature() {
        let envelope = Envelope::seal_with(cipher().as_ref(), INNER, 1, 2).unwrap();
        let q = query(&[
            ("encrypt_type", "aes"),
            ("msg_signature", "0000"),
            ("timestamp", "1"),
            ("nonce", "2"),
        ]);
        assert!(matches!(
            codec().decode(&q, envelope.render().unwrap().as_bytes()),
            Err(WeixinError::InvalidSignature)
        ));
    }

    #[test]
    fn empty_plaintext_is_an_authentication_failure() {
        let cipher = cipher();
        let signature = cipher.sign("1", "2", "");
        let q = query(&[
            ("encrypt_type", "aes"),
            ("msg_signature", signature.as_str()),
            ("timestamp", "1"),
            ("nonce", "2"),
        ]);
        assert!(matches!(
            codec().decode(&q, b"<xml><Encrypt><![CDATA[]]></Encrypt></xml>"),
            Err(WeixinError::InvalidSignature)
        ));
    }

    #[test]
    fn encrypted_request_without_cipher_fails() {
        let codec = EnvelopeCodec::new(TOKEN, None);
        let q = query(&[("encrypt_type", "aes"), ("msg_signature", "abc")]);
        assert!(matches!(
            codec.decode(&q, b"<xml><Encrypt>x</Encrypt></xml>"),
            Err(WeixinError::CipherUnavailable)
        ));
        assert!(matches!(
            codec.encode(&q, INNER.to_string()),
            Err(WeixinError::CipherUnavailable)
        ));
    }

    #[test]
    fn plain_reply_passes_through() {
        let q = query(&[("encrypt_type", "raw")]);
        assert_eq!(codec().encode(&q, INNER.to_string()).unwrap(), INNER);
    }

    #[test]
    fn encrypted_reply_is_signed_and_decryptable() {
        let q = query(&[("encrypt_type", "aes")]);
        let wrapped = codec().encode(&q, INNER.to_string()).unwrap();
        let outer = NormalizedMessage::parse(wrapped.as_bytes()).unwrap();
        let encrypted = outer.encrypt().unwrap();
        let cipher = cipher();
        assert_eq!(
            outer.text("MsgSignature").unwrap(),
            cipher.sign(
                outer.text("TimeStamp").unwrap(),
                outer.text("Nonce").unwrap(),
                encrypted
            )
        );
        assert_eq!(cipher.decrypt(encrypted).unwrap().message, INNER);
        let nonce: u64 = outer.text("Nonce").unwrap().parse().unwrap();
        assert!(nonce < NONCE_RANGE);
    }
}
