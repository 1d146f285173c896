use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the correlation identifier on every stage hop
pub const CORRELATION_HEADER: &str = "x-request-id";

const PREFIX: &str = "epd-";
const MAX_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CorrelationIdError {
    #[error("correlation id is empty")]
    Empty,

    #[error("correlation id exceeds {MAX_LEN} characters")]
    TooLong,

    #[error("correlation id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Opaque per-request key shared by every stage hop and cache artifact.
///
/// Minted once by the proxy. Stages parse it back from the
/// [`CORRELATION_HEADER`]; parsing only admits `[A-Za-z0-9_-]` so the value
/// can be used verbatim as a filesystem path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh identifier.
    pub fn mint() -> Self {
        Self(format!("{}{}", PREFIX, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = CorrelationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CorrelationIdError::Empty);
        }
        if s.len() > MAX_LEN {
            return Err(CorrelationIdError::TooLong);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(CorrelationIdError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = CorrelationIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_mint_is_prefixed_and_parseable() {
        let id = CorrelationId::mint();
        assert!(id.as_str().starts_with("epd-"));
        assert_eq!(id.as_str().len(), 4 + 32);

        let parsed: CorrelationId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_mint_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| CorrelationId::mint()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_rejects_path_traversal() {
        assert_eq!(
            "../etc".parse::<CorrelationId>(),
            Err(CorrelationIdError::InvalidChar('.'))
        );
        assert_eq!(
            "a/b".parse::<CorrelationId>(),
            Err(CorrelationIdError::InvalidChar('/'))
        );
    }

    #[test]
    fn test_rejects_empty_and_long() {
        assert_eq!("".parse::<CorrelationId>(), Err(CorrelationIdError::Empty));
        let long = "a".repeat(129);
        assert_eq!(long.parse::<CorrelationId>(), Err(CorrelationIdError::TooLong));
    }

    #[test]
    fn test_serde_validates() {
        let ok: CorrelationId = serde_json::from_str("\"req_1-a\"").unwrap();
        assert_eq!(ok.as_str(), "req_1-a");
        assert!(serde_json::from_str::<CorrelationId>("\"bad id\"").is_err());
    }
}
