//! Boundary types: display names, service types, discovery info, invitation context.
//! Each is validated once on construction (and on decode), never re-checked downstream.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Max display name length in UTF-8 bytes.
pub const MAX_DISPLAY_NAME_LEN: usize = 63;
/// Max length of a single `key=value` discovery pair in UTF-8 bytes.
pub const MAX_DISCOVERY_PAIR_LEN: usize = 255;
/// Max aggregate length of all `key=value` discovery pairs.
pub const MAX_DISCOVERY_INFO_LEN: usize = 400;
/// Max service type length (DNS-SD service name rules).
pub const MAX_SERVICE_TYPE_LEN: usize = 15;
/// Max invitation context payload, bounded by the handshake envelope.
pub const MAX_CONTEXT_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("display name is empty")]
    DisplayNameEmpty,
    #[error("display name is {0} bytes, max {MAX_DISPLAY_NAME_LEN}")]
    DisplayNameTooLong(usize),
    #[error("invalid service type {0:?}: {1}")]
    ServiceType(String, &'static str),
    #[error("discovery info key is empty")]
    DiscoveryKeyEmpty,
    #[error("discovery info key {0:?} contains '='")]
    DiscoveryKeyHasEquals(String),
    #[error("discovery info pair {key:?} is {len} bytes, max {MAX_DISCOVERY_PAIR_LEN}")]
    DiscoveryPairTooLong { key: String, len: usize },
    #[error("discovery info is {0} bytes, max {MAX_DISCOVERY_INFO_LEN}")]
    DiscoveryInfoTooLarge(usize),
    #[error("discovery info pair {0:?} is not key=value")]
    DiscoveryPairMalformed(String),
    #[error("discovery info record is truncated or not UTF-8")]
    DiscoveryRecordMalformed,
    #[error("invitation context is {0} bytes, max {MAX_CONTEXT_LEN}")]
    ContextTooLarge(usize),
}

/// Human-readable peer name shown to browsers. Non-empty, at most 63 UTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayName(String);

impl DisplayName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::DisplayNameEmpty);
        }
        if name.len() > MAX_DISPLAY_NAME_LEN {
            return Err(ValidationError::DisplayNameTooLong(name.len()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DisplayName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DisplayName> for String {
    fn from(value: DisplayName) -> Self {
        value.0
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service type shared by advertisers and browsers of one application, e.g. `chat-room`.
///
/// Follows DNS-SD service name rules: 1-15 characters of lowercase ASCII letters,
/// digits and hyphens, at least one letter, no leading, trailing or doubled hyphen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceType(String);

impl ServiceType {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        let reject = |why| Err(ValidationError::ServiceType(name.clone(), why));
        if name.is_empty() || name.len() > MAX_SERVICE_TYPE_LEN {
            return reject("must be 1-15 characters");
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return reject("only lowercase letters, digits and '-' allowed");
        }
        if !name.bytes().any(|b| b.is_ascii_lowercase()) {
            return reject("must contain a letter");
        }
        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return reject("hyphens must separate alphanumerics");
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceType {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceType> for String {
    fn from(value: ServiceType) -> Self {
        value.0
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discovery info advertised alongside a peer: string keys to string values.
///
/// Keys are non-empty and contain no `=`; each pair, encoded as `key=value`, is at most
/// 255 bytes and all pairs together at most 400 bytes.
///
/// On the wire the pairs travel as one TXT-style record: each pair is a length byte
/// followed by `key=value`, so a full set costs at most 600 bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct DiscoveryInfo(BTreeMap<String, String>);

impl DiscoveryInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs, validating the whole set.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, ValidationError>
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::try_from(map)
    }

    /// Parse `key=value` strings (split at the first `=`).
    pub fn parse_pairs<'a, I>(pairs: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut map = BTreeMap::new();
        for pair in pairs {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| ValidationError::DiscoveryPairMalformed(pair.to_string()))?;
            map.insert(k.to_string(), v.to_string());
        }
        Self::try_from(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Aggregate size of all pairs encoded as `key=value`.
    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(|(k, v)| pair_len(k, v)).sum()
    }
}

fn pair_len(key: &str, value: &str) -> usize {
    key.len() + 1 + value.len()
}

impl TryFrom<BTreeMap<String, String>> for DiscoveryInfo {
    type Error = ValidationError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut total = 0usize;
        for (key, value) in &map {
            if key.is_empty() {
                return Err(ValidationError::DiscoveryKeyEmpty);
            }
            if key.contains('=') {
                return Err(ValidationError::DiscoveryKeyHasEquals(key.clone()));
            }
            let len = pair_len(key, value);
            if len > MAX_DISCOVERY_PAIR_LEN {
                return Err(ValidationError::DiscoveryPairTooLong {
                    key: key.clone(),
                    len,
                });
            }
            total += len;
        }
        if total > MAX_DISCOVERY_INFO_LEN {
            return Err(ValidationError::DiscoveryInfoTooLarge(total));
        }
        Ok(Self(map))
    }
}

impl TryFrom<Vec<u8>> for DiscoveryInfo {
    type Error = ValidationError;

    fn try_from(record: Vec<u8>) -> Result<Self, Self::Error> {
        let mut map = BTreeMap::new();
        let mut rest = record.as_slice();
        while let Some((&len, tail)) = rest.split_first() {
            let len = usize::from(len);
            if tail.len() < len {
                return Err(ValidationError::DiscoveryRecordMalformed);
            }
            let (pair, tail) = tail.split_at(len);
            let pair = std::str::from_utf8(pair)
                .map_err(|_| ValidationError::DiscoveryRecordMalformed)?;
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| ValidationError::DiscoveryPairMalformed(pair.to_string()))?;
            map.insert(k.to_string(), v.to_string());
            rest = tail;
        }
        Self::try_from(map)
    }
}

impl From<DiscoveryInfo> for Vec<u8> {
    fn from(info: DiscoveryInfo) -> Self {
        let mut record = Vec::with_capacity(info.0.len() + info.encoded_len());
        for (k, v) in &info.0 {
            // Validation caps each pair at MAX_DISCOVERY_PAIR_LEN, which fits the length byte.
            record.push(pair_len(k, v) as u8);
            record.extend_from_slice(k.as_bytes());
            record.push(b'=');
            record.extend_from_slice(v.as_bytes());
        }
        record
    }
}

impl From<DiscoveryInfo> for BTreeMap<String, String> {
    fn from(value: DiscoveryInfo) -> Self {
        value.0
    }
}

/// Opaque application payload attached to an invitation. Carried byte-for-byte.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct InvitationContext(Vec<u8>);

impl InvitationContext {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ValidationError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_CONTEXT_LEN {
            return Err(ValidationError::ContextTooLarge(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<u8>> for InvitationContext {
    type Error = ValidationError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<InvitationContext> for Vec<u8> {
    fn from(value: InvitationContext) -> Self {
        value.0
    }
}

impl fmt::Debug for InvitationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvitationContext({} bytes)", self.0.len())
    }
}
