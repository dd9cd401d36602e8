//! Logical event type → physical topic resolution.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid topic mapping entry: {0:?} (expected `event.type=topic`)")]
pub struct TopicMapParseError(pub String);

/// Static mapping from event type to topic.
///
/// Unmapped event types publish to a topic named after the type itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMap {
    routes: HashMap<String, String>,
}

impl TopicMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.routes.insert(event_type.into(), topic.into());
        self
    }

    pub fn insert(&mut self, event_type: impl Into<String>, topic: impl Into<String>) {
        self.routes.insert(event_type.into(), topic.into());
    }

    pub fn resolve<'a>(&'a self, event_type: &'a str) -> &'a str {
        self.routes.get(event_type).map(String::as_str).unwrap_or(event_type)
    }

    /// Distinct topics named by explicit routes.
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.routes.values().map(String::as_str).collect();
        topics.sort_unstable();
        topics.dedup();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for TopicMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            routes: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Parses `user.created=user-events,order.placed=order-events`.
impl FromStr for TopicMap {
    type Err = TopicMapParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = TopicMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (event_type, topic) = entry
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| TopicMapParseError(entry.to_string()))?;
            map.insert(event_type, topic);
        }
        Ok(map)
    }
}
