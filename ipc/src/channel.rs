//! Channel identity on the discovery conversation

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Identifier that discovery requests and their responses are correlated by
///
/// Keys are compared exactly. Two processes looking up the same key are
/// asking about the same channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Creates a new channel key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ChannelKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl Borrow<str> for ChannelKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Where a discovered channel can be reached
///
/// The contents are owned by the transport: a socket address, a URI, a
/// shared-memory path. Discovery only carries it from responder to requester.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelLocation(String);

impl ChannelLocation {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_channel_key_equality() {
        assert_eq!(ChannelKey::new("build-events"), ChannelKey::from("build-events"));
        assert_ne!(ChannelKey::new("build-events"), ChannelKey::new("build-Events"));
    }

    #[test]
    fn test_channel_key_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(ChannelKey::new("x"), 1);
        assert_eq!(map.get("x"), Some(&1));
        assert_eq!(map.get("y"), None);
    }

    #[test]
    fn test_channel_key_serializes_as_plain_string() {
        let json = serde_json::to_string(&ChannelKey::new("daemon")).unwrap();
        assert_eq!(json, "\"daemon\"");
    }

    #[test]
    fn test_location_display() {
        let location = ChannelLocation::new("tcp://127.0.0.1:4040");
        assert_eq!(location.to_string(), "tcp://127.0.0.1:4040");
    }
}
