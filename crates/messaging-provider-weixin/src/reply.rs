//! Reply encoding: the application's [`ReplySpec`] becomes an
//! [`OutgoingMessage`] addressed back to the sender, rendered as `<xml>`.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::document::XmlBuilder;
use crate::error::WeixinError;
use crate::message::NormalizedMessage;

pub const MSG_TYPE_TEXT: &str = "text";
pub const MSG_TYPE_NEWS: &str = "news";
pub const MSG_TYPE_MUSIC: &str = "music";
pub const MSG_TYPE_IMAGE: &str = "image";
pub const MSG_TYPE_VOICE: &str = "voice";
pub const MSG_TYPE_VIDEO: &str = "video";
pub const MSG_TYPE_TRANSFER: &str = "transfer_customer_service";

/// `type` value an application uses to hand the user over to a human agent.
const CUSTOMER_SERVICE: &str = "customerService";

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Article {
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(
        default,
        rename = "picUrl",
        alias = "picurl",
        alias = "pic",
        alias = "thumb_url",
        deserialize_with = "lenient_string"
    )]
    pub pic_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Music {
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(
        default,
        rename = "musicUrl",
        alias = "url",
        deserialize_with = "lenient_string"
    )]
    pub music_url: Option<String>,
    #[serde(
        default,
        rename = "hqMusicUrl",
        alias = "hqUrl",
        deserialize_with = "lenient_string"
    )]
    pub hq_music_url: Option<String>,
    #[serde(
        default,
        rename = "thumbMediaId",
        alias = "mediaId",
        deserialize_with = "lenient_string"
    )]
    pub thumb_media_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
struct Media {
    #[serde(default, rename = "mediaId", deserialize_with = "lenient_string")]
    media_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    description: Option<String>,
}

/// What the application wants sent back for one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplySpec {
    /// Acknowledge without sending a message.
    Empty,
    Text(String),
    News(Vec<Article>),
    Music(Music),
    /// Explicit `MsgType` with content interpreted per type.
    Typed { msg_type: String, content: Value },
    CustomerServiceTransfer { kf_account: Option<String> },
}

impl ReplySpec {
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        if content.is_empty() {
            ReplySpec::Empty
        } else {
            ReplySpec::Text(content)
        }
    }

    pub fn typed(msg_type: impl Into<String>, content: Value) -> Self {
        ReplySpec::Typed {
            msg_type: msg_type.into(),
            content,
        }
    }

    /// Interprets a loosely shaped JSON reply. Precedence: empty string,
    /// array (news), `type: "customerService"`, any other `type`, plain
    /// object (music), then any scalar as text.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) if text.is_empty() => ReplySpec::Empty,
            Value::Array(items) => ReplySpec::News(articles(items)),
            Value::Object(fields) => match fields.get("type") {
                Some(Value::String(kind)) if kind == CUSTOMER_SERVICE => {
                    ReplySpec::CustomerServiceTransfer {
                        kf_account: fields
                            .get("kfAccount")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    }
                }
                Some(kind) => ReplySpec::Typed {
                    msg_type: scalar_string(kind).unwrap_or_default(),
                    content: fields.get("content").cloned().unwrap_or(Value::Null),
                },
                None => ReplySpec::Music(Music::deserialize(value).unwrap_or_default()),
            },
            other => ReplySpec::Text(falsy_to_empty(other)),
        }
    }
}

impl From<&str> for ReplySpec {
    fn from(content: &str) -> Self {
        ReplySpec::text(content)
    }
}

impl From<String> for ReplySpec {
    fn from(content: String) -> Self {
        ReplySpec::text(content)
    }
}

impl From<Vec<Article>> for ReplySpec {
    fn from(articles: Vec<Article>) -> Self {
        ReplySpec::News(articles)
    }
}

impl From<Music> for ReplySpec {
    fn from(music: Music) -> Self {
        ReplySpec::Music(music)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingContent {
    Text(String),
    News(Vec<Article>),
    Music(Music),
    Image { media_id: String },
    Voice { media_id: String },
    Video {
        media_id: String,
        title: String,
        description: String,
    },
    Transfer { kf_account: Option<String> },
    Other { msg_type: String, content: String },
}

/// Fully resolved reply, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub to_user_name: String,
    pub from_user_name: String,
    /// Milliseconds since the Unix epoch.
    pub create_time: i64,
    pub content: OutgoingContent,
}

impl OutgoingMessage {
    pub fn msg_type(&self) -> &str {
        match &self.content {
            OutgoingContent::Text(_) => MSG_TYPE_TEXT,
            OutgoingContent::News(_) => MSG_TYPE_NEWS,
            OutgoingContent::Music(_) => MSG_TYPE_MUSIC,
            OutgoingContent::Image { .. } => MSG_TYPE_IMAGE,
            OutgoingContent::Voice { .. } => MSG_TYPE_VOICE,
            OutgoingContent::Video { .. } => MSG_TYPE_VIDEO,
            OutgoingContent::Transfer { .. } => MSG_TYPE_TRANSFER,
            OutgoingContent::Other { msg_type, .. } => msg_type,
        }
    }

    pub fn render(&self) -> Result<String, WeixinError> {
        let mut xml = XmlBuilder::new()?;
        xml.cdata("ToUserName", &self.to_user_name)?
            .cdata("FromUserName", &self.from_user_name)?
            .text("CreateTime", &self.create_time.to_string())?
            .cdata("MsgType", self.msg_type())?;

        match &self.content {
            OutgoingContent::Text(content) | OutgoingContent::Other { content, .. } => {
                xml.cdata("Content", content)?;
            }
            OutgoingContent::News(articles) => {
                xml.text("ArticleCount", &articles.len().to_string())?
                    .start("Articles")?;
                for article in articles {
                    xml.start("item")?
                        .cdata("Title", or_empty(&article.title))?
                        .cdata("Description", or_empty(&article.description))?
                        .cdata("PicUrl", or_empty(&article.pic_url))?
                        .cdata("Url", or_empty(&article.url))?
                        .end()?;
                }
                xml.end()?;
            }
            OutgoingContent::Music(music) => {
                xml.start("Music")?
                    .cdata("Title", or_empty(&music.title))?
                    .cdata("Description", or_empty(&music.description))?
                    .cdata("MusicUrl", or_empty(&music.music_url))?
                    .cdata("HQMusicUrl", or_empty(&music.hq_music_url))?;
                if let Some(thumb) = music.thumb_media_id.as_deref().filter(|id| !id.is_empty()) {
                    xml.cdata("ThumbMediaId", thumb)?;
                }
                xml.end()?;
            }
            OutgoingContent::Image { media_id } => {
                xml.start("Image")?.cdata("MediaId", media_id)?.end()?;
            }
            OutgoingContent::Voice { media_id } => {
                xml.start("Voice")?.cdata("MediaId", media_id)?.end()?;
            }
            OutgoingContent::Video {
                media_id,
                title,
                description,
            } => {
                xml.start("Video")?
                    .cdata("MediaId", media_id)?
                    .cdata("Title", title)?
                    .cdata("Description", description)?
                    .end()?;
            }
            OutgoingContent::Transfer { kf_account } => {
                if let Some(account) = kf_account.as_deref().filter(|a| !a.is_empty()) {
                    xml.start("TransInfo")?
                        .cdata("KfAccount", account)?
                        .end()?;
                }
            }
        }
        xml.finish()
    }
}

/// Resolves `reply` against the inbound message. `None` means nothing is to
/// be sent. Sender and receiver swap roles on the way back.
pub fn encode_reply(reply: &ReplySpec, inbound: &NormalizedMessage) -> Option<OutgoingMessage> {
    let content = match reply {
        ReplySpec::Empty => return None,
        ReplySpec::Text(text) => OutgoingContent::Text(text.clone()),
        ReplySpec::News(articles) => OutgoingContent::News(articles.clone()),
        ReplySpec::Music(music) => OutgoingContent::Music(music.clone()),
        ReplySpec::CustomerServiceTransfer { kf_account } => OutgoingContent::Transfer {
            kf_account: kf_account.clone(),
        },
        ReplySpec::Typed { msg_type, content } => typed_content(msg_type, content),
    };
    Some(OutgoingMessage {
        to_user_name: inbound.from_user_name().unwrap_or_default().to_string(),
        from_user_name: inbound.to_user_name().unwrap_or_default().to_string(),
        create_time: Utc::now().timestamp_millis(),
        content,
    })
}

fn typed_content(msg_type: &str, content: &Value) -> OutgoingContent {
    match msg_type {
        MSG_TYPE_TEXT => OutgoingContent::Text(display_string(content)),
        MSG_TYPE_NEWS => OutgoingContent::News(
            content
                .as_array()
                .map(Vec::as_slice)
                .map(articles)
                .unwrap_or_default(),
        ),
        MSG_TYPE_MUSIC => OutgoingContent::Music(Music::deserialize(content).unwrap_or_default()),
        MSG_TYPE_IMAGE => OutgoingContent::Image {
            media_id: media(content).media_id.unwrap_or_default(),
        },
        MSG_TYPE_VOICE => OutgoingContent::Voice {
            media_id: media(content).media_id.unwrap_or_default(),
        },
        MSG_TYPE_VIDEO => {
            let media = media(content);
            OutgoingContent::Video {
                media_id: media.media_id.unwrap_or_default(),
                title: media.title.unwrap_or_default(),
                description: media.description.unwrap_or_default(),
            }
        }
        MSG_TYPE_TRANSFER => OutgoingContent::Transfer {
            kf_account: content
                .get("kfAccount")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        other => OutgoingContent::Other {
            msg_type: other.to_string(),
            content: display_string(content),
        },
    }
}

fn articles(items: &[Value]) -> Vec<Article> {
    items
        .iter()
        .map(|item| Article::deserialize(item).unwrap_or_default())
        .collect()
}

fn media(content: &Value) -> Media {
    Media::deserialize(content).unwrap_or_default()
}

fn or_empty(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn display_string(value: &Value) -> String {
    match value {
        Value::Array(_) | Value::Object(_) => value.to_string(),
        other => scalar_string(other).unwrap_or_default(),
    }
}

/// Scalar coercion where falsy values (`null`, `false`, `0`) render empty.
fn falsy_to_empty(value: &Value) -> String {
    match value {
        Value::Bool(false) | Value::Null => String::new(),
        Value::Number(number) if number.as_f64() == Some(0.0) => String::new(),
        other => display_string(other),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_string))
}
