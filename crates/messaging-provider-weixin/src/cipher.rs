//! Cipher capability for encrypted exchanges: envelope signing plus the
//! platform's AES-256-CBC framing of message payloads.

use std::fmt;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::{DecodePaddingMode, Engine};
use rand::RngCore;

use crate::signature::compute_signature;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
/// The platform pads to 32-byte blocks, not the AES block size.
const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_PREFIX_LEN: usize = 4;

/// Encoding keys are 43 characters of unpadded base64 whose trailing bits
/// are not necessarily zero.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(thiserror::Error, Debug)]
pub enum CipherError {
    #[error("encoding key must decode to {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext is not a whole number of blocks")]
    Unaligned,
    #[error("payload of {0} bytes cannot be framed")]
    Oversized(usize),
}

/// Result of opening an encrypted payload. An empty `message` means the
/// frame did not hold a usable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub message: String,
    pub app_id: String,
}

pub trait MessageCipher: Send + Sync {
    fn sign(&self, timestamp: &str, nonce: &str, payload: &str) -> String;
    fn encrypt(&self, payload: &str) -> Result<String, CipherError>;
    fn decrypt(&self, payload: &str) -> Result<Decrypted, CipherError>;
}

pub struct WxBizMsgCrypt {
    token: String,
    app_id: String,
    key: [u8; KEY_LEN],
}

impl WxBizMsgCrypt {
    pub fn new(
        token: impl Into<String>,
        encoding_aes_key: &str,
        app_id: impl Into<String>,
    ) -> Result<Self, CipherError> {
        let decoded = LENIENT.decode(encoding_aes_key.trim())?;
        let key: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength(decoded.len()))?;
        Ok(WxBizMsgCrypt {
            token: token.into(),
            app_id: app_id.into(),
            key,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    fn iv(&self) -> &[u8] {
        &self.key[..IV_LEN]
    }
}

impl fmt::Debug for WxBizMsgCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WxBizMsgCrypt")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl MessageCipher for WxBizMsgCrypt {
    fn sign(&self, timestamp: &str, nonce: &str, payload: &str) -> String {
        compute_signature(&[&self.token, timestamp, nonce, payload])
    }

    fn encrypt(&self, payload: &str) -> Result<String, CipherError> {
        let message = payload.as_bytes();
        let length =
            u32::try_from(message.len()).map_err(|_| CipherError::Oversized(message.len()))?;

        let mut frame = Vec::with_capacity(
            RANDOM_PREFIX_LEN + LENGTH_PREFIX_LEN + message.len() + self.app_id.len() + PAD_BLOCK,
        );
        let mut prefix = [0u8; RANDOM_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut prefix);
        frame.extend_from_slice(&prefix);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(message);
        frame.extend_from_slice(self.app_id.as_bytes());
        let pad = PAD_BLOCK - frame.len() % PAD_BLOCK;
        frame.resize(frame.len() + pad, pad as u8);

        let encryptor = Aes256CbcEnc::new_from_slices(&self.key, self.iv())
            .map_err(|_| CipherError::InvalidKeyLength(self.key.len()))?;
        let sealed = encryptor.encrypt_padded_vec_mut::<NoPadding>(&frame);
        Ok(STANDARD.encode(sealed))
    }

    fn decrypt(&self, payload: &str) -> Result<Decrypted, CipherError> {
        let sealed = LENIENT.decode(payload.trim())?;
        let decryptor = Aes256CbcDec::new_from_slices(&self.key, self.iv())
            .map_err(|_| CipherError::InvalidKeyLength(self.key.len()))?;
        let mut frame = decryptor
            .decrypt_padded_vec_mut::<NoPadding>(&sealed)
            .map_err(|_| CipherError::Unaligned)?;

        let pad = frame.last().copied().map(usize::from).unwrap_or(0);
        let pad = if (1..=PAD_BLOCK).contains(&pad) { pad } else { 0 };
        frame.truncate(frame.len().saturating_sub(pad));
        Ok(unframe(&frame))
    }
}

fn unframe(frame: &[u8]) -> Decrypted {
    let empty = Decrypted {
        message: String::new(),
        app_id: String::new(),
    };
    let Some(content) = frame.get(RANDOM_PREFIX_LEN..) else {
        return empty;
    };
    let Some(length) = content.get(..LENGTH_PREFIX_LEN) else {
        return empty;
    };
    let length = u32::from_be_bytes([length[0], length[1], length[2], length[3]]) as usize;
    let Some(message) = content.get(LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN.saturating_add(length))
    else {
        return empty;
    };
    let app_id = &content[LENGTH_PREFIX_LEN + length..];
    Decrypted {
        message: String::from_utf8_lossy(message).into_owned(),
        app_id: String::from_utf8_lossy(app_id).into_owned(),
    }
}
