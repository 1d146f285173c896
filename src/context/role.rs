use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One tier of the disaggregated pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageRole {
    Encode,
    Prefill,
    Decode,
}

impl StageRole {
    pub const ALL: [StageRole; 3] = [StageRole::Encode, StageRole::Prefill, StageRole::Decode];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageRole::Encode => "encode",
            StageRole::Prefill => "prefill",
            StageRole::Decode => "decode",
        }
    }

    /// The role that consumes artifacts produced by this one.
    pub fn consumer(&self) -> Option<StageRole> {
        match self {
            StageRole::Encode => Some(StageRole::Prefill),
            StageRole::Prefill => Some(StageRole::Decode),
            StageRole::Decode => None,
        }
    }

    /// The role whose artifacts this one consumes.
    pub fn producer(&self) -> Option<StageRole> {
        match self {
            StageRole::Encode => None,
            StageRole::Prefill => Some(StageRole::Encode),
            StageRole::Decode => Some(StageRole::Prefill),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageRole::Decode)
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "encode" => Ok(StageRole::Encode),
            "prefill" => Ok(StageRole::Prefill),
            "decode" => Ok(StageRole::Decode),
            other => Err(format!("unknown stage role '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_consumer_chain() {
        assert_eq!(StageRole::Encode.consumer(), Some(StageRole::Prefill));
        assert_eq!(StageRole::Prefill.consumer(), Some(StageRole::Decode));
        assert_eq!(StageRole::Decode.consumer(), None);
        assert_eq!(StageRole::Decode.producer(), Some(StageRole::Prefill));
        assert_eq!(StageRole::Encode.producer(), None);
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("Prefill".parse::<StageRole>().unwrap(), StageRole::Prefill);
        assert!("verify".parse::<StageRole>().is_err());
        assert_eq!(serde_json::to_string(&StageRole::Encode).unwrap(), "\"encode\"");
    }
}
