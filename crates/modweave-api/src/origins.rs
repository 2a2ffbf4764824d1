use regex::Regex;
use serde::{Deserialize, Serialize};

/// One entry of a mod's origin allowlist.
///
/// Metadata carries origins as strings: `"*"` matches everything, a
/// `/slash-delimited/` entry is a regular expression, anything else is a
/// substring match against the origin.
#[derive(Debug, Clone)]
pub enum OriginPattern {
    Any,
    Substring(String),
    Regex(Regex),
}

impl OriginPattern {
    /// Parses one allowlist entry. Returns `None` for an empty entry or
    /// an unparsable regex.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(Self::Any);
        }
        if raw.len() > 1 && raw.starts_with('/') && raw.ends_with('/') {
            let pattern = &raw[1..raw.len() - 1];
            return Regex::new(pattern).ok().map(Self::Regex);
        }
        Some(Self::Substring(raw.to_string()))
    }

    pub fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Substring(needle) => origin.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(origin),
        }
    }

    fn as_source(&self) -> String {
        match self {
            Self::Any => "*".to_string(),
            Self::Substring(s) => s.clone(),
            Self::Regex(re) => format!("/{}/", re.as_str()),
        }
    }
}

impl PartialEq for OriginPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_source() == other.as_source()
    }
}

impl Serialize for OriginPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_source())
    }
}

impl<'de> Deserialize<'de> for OriginPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid origin pattern `{raw}`")))
    }
}
