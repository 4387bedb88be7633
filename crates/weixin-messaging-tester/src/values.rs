use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use messaging_provider_weixin::WeixinConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Values file split the same way as the hosted provider settings: plain
/// `config` next to `secrets` (token and encoding key).
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct Values {
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub secrets: Map<String, Value>,
}

impl Values {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read values file {}", path.as_ref().display()))?;
        let values: Values = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.as_ref().display()))?;
        Ok(values)
    }

    /// Merges `config` and `secrets` into the webhook settings; secrets win.
    pub fn weixin_config(&self) -> Result<WeixinConfig> {
        let merged: Map<String, Value> = self
            .config
            .iter()
            .chain(self.secrets.iter())
            .map(|(key, value)| (canonical_key(key).to_string(), value.clone()))
            .collect();
        serde_json::from_value(Value::Object(merged)).context("invalid weixin settings in values")
    }
}

/// Folds the accepted spellings of a setting onto one key so that merging
/// cannot produce duplicate fields.
fn canonical_key(key: &str) -> &str {
    match key {
        "appid" | "appId" => "app_id",
        "encodingAESKey" | "encodingAesKey" => "encoding_aes_key",
        other => other,
    }
}

pub fn load_reply(path: impl AsRef<Path>) -> Result<Value> {
    let bytes = fs::read(&path)
        .with_context(|| format!("failed to read reply file {}", path.as_ref().display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse {}", path.as_ref().display()))
}
