use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::HubError;

pub const PRICE_PREFIX: &str = "price:";
pub const SIGNAL_PREFIX: &str = "signal:";
pub const MARKET_STATUS: &str = "market-status";

const MAX_INSTRUMENT_LEN: usize = 24;
const MAX_KIND_LEN: usize = 32;

/// A named channel that connections subscribe to.
///
/// Instrument ids are normalised to upper case and signal kinds to lower case,
/// so `price:aapl` and `price:AAPL` are the same topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Price(String),
    MarketStatus,
    Signal(String),
}

impl Topic {
    pub fn price(instrument_id: &str) -> Result<Self, HubError> {
        let id = instrument_id.trim().to_ascii_uppercase();
        if id.is_empty() || id.len() > MAX_INSTRUMENT_LEN {
            return Err(HubError::InvalidTopicRequest(format!(
                "instrument id must be 1-{} characters",
                MAX_INSTRUMENT_LEN
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '/' | '_'))
        {
            return Err(HubError::InvalidTopicRequest(format!(
                "instrument id '{}' contains unsupported characters",
                id
            )));
        }
        Ok(Topic::Price(id))
    }

    pub fn signal(kind: &str) -> Result<Self, HubError> {
        let kind = kind.trim().to_ascii_lowercase();
        if kind.is_empty() || kind.len() > MAX_KIND_LEN {
            return Err(HubError::InvalidTopicRequest(format!(
                "signal kind must be 1-{} characters",
                MAX_KIND_LEN
            )));
        }
        if !kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        {
            return Err(HubError::InvalidTopicRequest(format!(
                "signal kind '{}' contains unsupported characters",
                kind
            )));
        }
        Ok(Topic::Signal(kind))
    }

    pub fn parse(raw: &str) -> Result<Self, HubError> {
        let raw = raw.trim();
        if raw == MARKET_STATUS {
            return Ok(Topic::MarketStatus);
        }
        if let Some(id) = raw.strip_prefix(PRICE_PREFIX) {
            return Topic::price(id);
        }
        if let Some(kind) = raw.strip_prefix(SIGNAL_PREFIX) {
            return Topic::signal(kind);
        }
        Err(HubError::InvalidTopicRequest(format!("unknown topic '{}'", raw)))
    }

    /// Instrument id for `price:` topics.
    pub fn instrument(&self) -> Option<&str> {
        match self {
            Topic::Price(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_price(&self) -> bool {
        matches!(self, Topic::Price(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Price(id) => write!(f, "{}{}", PRICE_PREFIX, id),
            Topic::MarketStatus => f.write_str(MARKET_STATUS),
            Topic::Signal(kind) => write!(f, "{}{}", SIGNAL_PREFIX, kind),
        }
    }
}

impl FromStr for Topic {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Splits a connect-time `topics=a,b,c` list, skipping blanks.
pub fn split_topic_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic_families() {
        assert_eq!(Topic::parse("price:AAA").unwrap(), Topic::Price("AAA".to_string()));
        assert_eq!(Topic::parse("market-status").unwrap(), Topic::MarketStatus);
        assert_eq!(
            Topic::parse("signal:momentum").unwrap(),
            Topic::Signal("momentum".to_string())
        );
    }

    #[test]
    fn test_parse_normalises_case() {
        assert_eq!(Topic::parse("price:brk.b").unwrap().to_string(), "price:BRK.B");
        assert_eq!(Topic::parse("signal:Breakout").unwrap().to_string(), "signal:breakout");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in ["", "price:", "price:A A", "signal:", "signal:x!y", "orders", "market_status"] {
            assert!(
                matches!(Topic::parse(raw), Err(HubError::InvalidTopicRequest(_))),
                "expected '{}' to be rejected",
                raw
            );
        }
        let too_long = format!("price:{}", "A".repeat(MAX_INSTRUMENT_LEN + 1));
        assert!(Topic::parse(&too_long).is_err());
    }

    #[test]
    fn test_instrument_accessor() {
        assert_eq!(Topic::parse("price:xyz").unwrap().instrument(), Some("XYZ"));
        assert_eq!(Topic::MarketStatus.instrument(), None);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Topic::Price("AAA".to_string())).unwrap();
        assert_eq!(json, "\"price:AAA\"");
        let topic: Topic = serde_json::from_str("\"market-status\"").unwrap();
        assert_eq!(topic, Topic::MarketStatus);
        assert!(serde_json::from_str::<Topic>("\"nope\"").is_err());
    }

    #[test]
    fn test_split_topic_list() {
        assert_eq!(
            split_topic_list("price:AAA, market-status,,signal:x "),
            vec!["price:AAA", "market-status", "signal:x"]
        );
        assert!(split_topic_list("").is_empty());
    }
}
