//! The message record routed through the pipeline.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::topic::normalize;

/// Which side of the router a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Emitted by a broker adapter; fans out to clients.
    FromBroker,
    /// Emitted by a client adapter; fans out to brokers.
    FromClient,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FromBroker => "broker",
            Self::FromClient => "client",
        })
    }
}

/// Route information attached by the first matched layer that binds parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// The normalized pattern of the layer that created this route.
    pub path: String,
    /// Parameters bound by the most recent matching layer.
    pub params: HashMap<String, String>,
}

/// A message travelling through the router.
///
/// `topic` and `payload` are free for handlers to rewrite. `original_topic`
/// and `origin` are managed by the dispatcher and the application shell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Slash-delimited subject of the message.
    pub topic: String,
    /// Route data from the last matched layer with parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    /// Arbitrary fields opaque to the router.
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<Origin>,
}

impl Message {
    /// Creates a message with an empty payload.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Builder-style payload insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Tags the side this message came from.
    pub fn tagged(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Returns the side this message came from, if tagged.
    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }

    /// Returns the topic as it was when the message first entered a pipeline.
    pub fn original_topic(&self) -> Option<&str> {
        self.original_topic.as_deref()
    }

    /// Reads a payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Writes a payload field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.payload.insert(key.into(), value.into())
    }

    /// Returns a bound route parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.route
            .as_ref()
            .and_then(|route| route.params.get(name))
            .map(String::as_str)
    }

    pub(crate) fn normalize_topic(&mut self) {
        let normalized = normalize(&self.topic);
        if normalized.len() != self.topic.len() {
            self.topic = normalized.to_string();
        }
    }

    pub(crate) fn capture_original_topic(&mut self) {
        if self.original_topic.is_none() {
            self.original_topic = Some(self.topic.clone());
        }
    }

    /// Creates the route once, then only replaces its parameters.
    pub(crate) fn bind_params(&mut self, path: &str, params: HashMap<String, String>) {
        match &mut self.route {
            Some(route) => route.params = params,
            None => {
                self.route = Some(Route {
                    path: path.to_string(),
                    params,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_original_topic_captured_once() {
        let mut msg = Message::new("/a/b/");
        msg.normalize_topic();
        msg.capture_original_topic();
        msg.topic = "c".into();
        msg.capture_original_topic();
        assert_eq!(msg.original_topic(), Some("a/b"));
    }

    #[test]
    fn test_bind_params_keeps_route_path() {
        let mut msg = Message::new("users/1");
        msg.bind_params("users/:id", HashMap::from([("id".into(), "1".into())]));
        msg.bind_params("users/:uid", HashMap::from([("uid".into(), "1".into())]));

        let route = msg.route.as_ref().unwrap();
        assert_eq!(route.path, "users/:id");
        assert_eq!(msg.param("uid"), Some("1"));
        assert_eq!(msg.param("id"), None);
    }

    #[test]
    fn test_payload_helpers_and_serde() {
        let msg = Message::new("t")
            .with("seen", true)
            .tagged(Origin::FromClient);
        assert_eq!(msg.get("seen"), Some(&json!(true)));

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["origin"], json!("from_client"));

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
