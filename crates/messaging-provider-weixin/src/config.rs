use serde::{Deserialize, Serialize};

use crate::cipher::WxBizMsgCrypt;
use crate::error::WeixinError;

/// Fixed per-webhook settings. Encrypted exchanges require both
/// `encoding_aes_key` and (by convention) `app_id`.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct WeixinConfig {
    pub token: String,
    #[serde(default, alias = "appid", alias = "appId")]
    pub app_id: Option<String>,
    #[serde(default, alias = "encodingAESKey", alias = "encodingAesKey")]
    pub encoding_aes_key: Option<String>,
}

impl WeixinConfig {
    pub fn from_token(token: impl Into<String>) -> Self {
        WeixinConfig {
            token: token.into(),
            app_id: None,
            encoding_aes_key: None,
        }
    }

    pub fn with_encryption(
        mut self,
        app_id: impl Into<String>,
        encoding_aes_key: impl Into<String>,
    ) -> Self {
        self.app_id = Some(app_id.into());
        self.encoding_aes_key = Some(encoding_aes_key.into());
        self
    }

    pub fn app_id(&self) -> &str {
        self.app_id.as_deref().unwrap_or("")
    }

    pub fn encoding_aes_key(&self) -> Option<&str> {
        self.encoding_aes_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn validate(&self) -> Result<(), WeixinError> {
        if self.token.trim().is_empty() {
            return Err(WeixinError::Config("token is required".into()));
        }
        Ok(())
    }

    /// Validates the settings and builds the cipher when a key is present.
    pub fn build_cipher(&self) -> Result<Option<WxBizMsgCrypt>, WeixinError> {
        self.validate()?;
        match self.encoding_aes_key() {
            Some(key) => WxBizMsgCrypt::new(self.token.clone(), key, self.app_id())
                .map(Some)
                .map_err(|err| WeixinError::Config(format!("encoding_aes_key: {err}"))),
            None => Ok(None),
        }
    }
}
