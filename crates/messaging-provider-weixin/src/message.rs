use std::collections::BTreeMap;

use serde::Serialize;

use crate::document::{XmlNode, XmlTree, parse_document};
use crate::error::WeixinError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Field {
    Text(String),
    Nested(NormalizedMessage),
    List(Vec<Field>),
}

impl Field {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&NormalizedMessage> {
        match self {
            Field::Nested(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Field]> {
        match self {
            Field::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Flat view of an inbound `<xml>` document, keyed by tag name.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct NormalizedMessage {
    fields: BTreeMap<String, Field>,
}

impl NormalizedMessage {
    pub fn parse(input: &[u8]) -> Result<Self, WeixinError> {
        let tree = parse_document(input)?;
        Ok(Self::from_tree(&tree))
    }

    pub fn from_tree(tree: &XmlTree) -> Self {
        let mut fields = BTreeMap::new();
        for (name, nodes) in tree.children() {
            let field = match nodes {
                [] => continue,
                [single] => normalize_node(single),
                many => Field::List(many.iter().map(normalize_node).collect()),
            };
            fields.insert(name.to_string(), field);
        }
        NormalizedMessage { fields }
    }

    pub fn get(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Field::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(key, field)| (key.as_str(), field))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_user_name(&self) -> Option<&str> {
        self.text("ToUserName")
    }

    pub fn from_user_name(&self) -> Option<&str> {
        self.text("FromUserName")
    }

    pub fn create_time(&self) -> Option<&str> {
        self.text("CreateTime")
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.text("MsgType")
    }

    pub fn content(&self) -> Option<&str> {
        self.text("Content")
    }

    pub fn event(&self) -> Option<&str> {
        self.text("Event")
    }

    pub fn event_key(&self) -> Option<&str> {
        self.text("EventKey")
    }

    /// Ciphertext of an encrypted envelope; absent on plain messages.
    pub fn encrypt(&self) -> Option<&str> {
        self.text("Encrypt")
    }
}

fn normalize_node(node: &XmlNode) -> Field {
    match node {
        XmlNode::Text(value) => Field::Text(value.trim().to_string()),
        XmlNode::Element(tree) => Field::Nested(NormalizedMessage::from_tree(tree)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOCATION: &str = "<xml><ToUserName><![CDATA[gh_d3e07d51b513]]></ToUserName>
      <FromUserName><![CDATA[diaosi]]></FromUserName>
      <CreateTime>1362161914</CreateTime>
      <MsgType><![CDATA[location]]></MsgType>
      <Location_X>30.283878</Location_X>
      <Location_Y>120.063370</Location_Y>
      <Scale>15</Scale>
      <Label><![CDATA[]]></Label>
      <MsgId>5850440872586764820</MsgId>
      </xml>";

    #[test]
    fn flattens_location_message() {
        let message = NormalizedMessage::parse(LOCATION.as_bytes()).unwrap();
        assert_eq!(message.to_user_name(), Some("gh_d3e07d51b513"));
        assert_eq!(message.from_user_name(), Some("diaosi"));
        assert_eq!(message.create_time(), Some("1362161914"));
        assert_eq!(message.msg_type(), Some("location"));
        assert_eq!(message.text("Location_X"), Some("30.283878"));
        assert_eq!(message.text("Label"), Some(""));
        assert_eq!(message.len(), 9);
        assert!(message.encrypt().is_none());
    }

    #[test]
    fn trims_leaf_whitespace() {
        let message =
            NormalizedMessage::parse(b"<xml><Content><![CDATA[  hi there \n]]></Content></xml>")
                .unwrap();
        assert_eq!(message.content(), Some("hi there"));
    }

    #[test]
    fn single_branch_becomes_nested_message() {
        let message = NormalizedMessage::parse(
            b"<xml><MsgType><![CDATA[event]]></MsgType><Event><![CDATA[location_select]]></Event>\
              <SendLocationInfo><Location_X><![CDATA[80]]></Location_X><Label><![CDATA[alibaba]]></Label>\
              <EventKey><![CDATA[sendLocation]]></EventKey></SendLocationInfo></xml>",
        )
        .unwrap();
        let info = message
            .get("SendLocationInfo")
            .and_then(Field::as_nested)
            .expect("nested info");
        assert_eq!(info.event_key(), Some("sendLocation"));
        assert_eq!(info.text("Label"), Some("alibaba"));
        assert_eq!(message.event(), Some("location_select"));
    }

    #[test]
    fn repeated_children_become_ordered_list() {
        let message = NormalizedMessage::parse(
            b"<xml><SendPicsInfo><Count>2</Count><PicList>\
              <item><PicMd5Sum><![CDATA[aaa]]></PicMd5Sum></item>\
              <item><PicMd5Sum><![CDATA[bbb]]></PicMd5Sum></item>\
              </PicList></SendPicsInfo></xml>",
        )
        .unwrap();
        let info = message.get("SendPicsInfo").and_then(Field::as_nested).unwrap();
        assert_eq!(info.text("Count"), Some("2"));
        let pic_list = info.get("PicList").and_then(Field::as_nested).unwrap();
        let items = pic_list.get("item").and_then(Field::as_list).unwrap();
        let sums: Vec<_> = items
            .iter()
            .filter_map(Field::as_nested)
            .filter_map(|item| item.text("PicMd5Sum"))
            .collect();
        assert_eq!(sums, vec!["aaa", "bbb"]);
    }

    #[test]
    fn repeated_leaves_stay_text() {
        let message = NormalizedMessage::parse(b"<xml><Tag> a </Tag><Tag>b</Tag></xml>").unwrap();
        assert_eq!(
            message.get("Tag"),
            Some(&Field::List(vec![
                Field::Text("a".into()),
                Field::Text("b".into())
            ]))
        );
    }

    #[test]
    fn serializes_as_plain_json() {
        let message = NormalizedMessage::parse(
            b"<xml><Content>hi</Content><Info><Key>k</Key></Info><Tag>a</Tag><Tag>b</Tag></xml>",
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"Content": "hi", "Info": {"Key": "k"}, "Tag": ["a", "b"]})
        );
    }
}
