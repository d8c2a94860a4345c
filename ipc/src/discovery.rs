//! The discovery message union

use crate::channel::{ChannelKey, ChannelLocation};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// "Is channel X available?"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LookupRequest {
    pub channel_key: ChannelKey,
}

impl LookupRequest {
    pub fn new(channel_key: impl Into<ChannelKey>) -> Self {
        Self {
            channel_key: channel_key.into(),
        }
    }
}

/// Affirmative answer to a lookup: the channel lives at `location`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAvailable {
    pub channel_key: ChannelKey,
    pub location: ChannelLocation,
}

impl ChannelAvailable {
    pub fn new(channel_key: impl Into<ChannelKey>, location: ChannelLocation) -> Self {
        Self {
            channel_key: channel_key.into(),
            location,
        }
    }
}

/// Explicit negative answer to a lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelUnavailable {
    pub channel_key: ChannelKey,
}

impl ChannelUnavailable {
    pub fn new(channel_key: impl Into<ChannelKey>) -> Self {
        Self {
            channel_key: channel_key.into(),
        }
    }
}

/// A message on the discovery conversation
///
/// The set is closed. A transport that decodes something it has no variant
/// for hands it up as [`DiscoveryMessage::Unrecognized`] with whatever kind
/// tag it saw, so consumers must name that case when they match.
///
/// Encoded as an object whose `type` field names the kind. Decoding an
/// object with a `type` this side does not know yields `Unrecognized` with
/// that tag; the rest of the object is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DiscoveryMessage {
    LookupRequest(LookupRequest),
    ChannelAvailable(ChannelAvailable),
    ChannelUnavailable(ChannelUnavailable),
    /// A message kind this side does not understand
    Unrecognized { kind: String },
}

/// The variants with a fixed wire shape, by reference for encoding
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownRef<'a> {
    LookupRequest(&'a LookupRequest),
    ChannelAvailable(&'a ChannelAvailable),
    ChannelUnavailable(&'a ChannelUnavailable),
}

/// The variants with a fixed wire shape, owned for decoding
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Known {
    LookupRequest(LookupRequest),
    ChannelAvailable(ChannelAvailable),
    ChannelUnavailable(ChannelUnavailable),
}

const KNOWN_KINDS: [&str; 3] = ["lookup_request", "channel_available", "channel_unavailable"];

impl Serialize for DiscoveryMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DiscoveryMessage::LookupRequest(m) => KnownRef::LookupRequest(m).serialize(serializer),
            DiscoveryMessage::ChannelAvailable(m) => {
                KnownRef::ChannelAvailable(m).serialize(serializer)
            }
            DiscoveryMessage::ChannelUnavailable(m) => {
                KnownRef::ChannelUnavailable(m).serialize(serializer)
            }
            DiscoveryMessage::Unrecognized { kind } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("type", kind)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for DiscoveryMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| <D::Error as de::Error>::missing_field("type"))?
            .to_string();

        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Ok(DiscoveryMessage::Unrecognized { kind });
        }

        let known = Known::deserialize(value).map_err(<D::Error as de::Error>::custom)?;
        Ok(match known {
            Known::LookupRequest(m) => DiscoveryMessage::LookupRequest(m),
            Known::ChannelAvailable(m) => DiscoveryMessage::ChannelAvailable(m),
            Known::ChannelUnavailable(m) => DiscoveryMessage::ChannelUnavailable(m),
        })
    }
}

impl DiscoveryMessage {
    /// Short kind name for diagnostics
    pub fn kind(&self) -> &str {
        match self {
            DiscoveryMessage::LookupRequest(_) => "lookup_request",
            DiscoveryMessage::ChannelAvailable(_) => "channel_available",
            DiscoveryMessage::ChannelUnavailable(_) => "channel_unavailable",
            DiscoveryMessage::Unrecognized { kind } => kind,
        }
    }

    /// The channel the message is about, if it is about one
    pub fn channel_key(&self) -> Option<&ChannelKey> {
        match self {
            DiscoveryMessage::LookupRequest(m) => Some(&m.channel_key),
            DiscoveryMessage::ChannelAvailable(m) => Some(&m.channel_key),
            DiscoveryMessage::ChannelUnavailable(m) => Some(&m.channel_key),
            DiscoveryMessage::Unrecognized { .. } => None,
        }
    }
}

impl From<LookupRequest> for DiscoveryMessage {
    fn from(message: LookupRequest) -> Self {
        DiscoveryMessage::LookupRequest(message)
    }
}

impl From<ChannelAvailable> for DiscoveryMessage {
    fn from(message: ChannelAvailable) -> Self {
        DiscoveryMessage::ChannelAvailable(message)
    }
}

impl From<ChannelUnavailable> for DiscoveryMessage {
    fn from(message: ChannelUnavailable) -> Self {
        DiscoveryMessage::ChannelUnavailable(message)
    }
}

impl fmt::Display for DiscoveryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMessage::LookupRequest(m) => write!(f, "LookupRequest({})", m.channel_key),
            DiscoveryMessage::ChannelAvailable(m) => {
                write!(f, "ChannelAvailable({} @ {})", m.channel_key, m.location)
            }
            DiscoveryMessage::ChannelUnavailable(m) => {
                write!(f, "ChannelUnavailable({})", m.channel_key)
            }
            DiscoveryMessage::Unrecognized { kind } => write!(f, "Unrecognized({})", kind),
        }
    }
}
