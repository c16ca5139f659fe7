//! Protocol identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Application protocols the balancer knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Unknown,
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "MySQL")]
    MySql,
    #[serde(rename = "PostgreSQL")]
    PostgreSql,
    #[serde(rename = "MongoDB")]
    MongoDb,
    Redis,
    #[serde(rename = "RTMP")]
    Rtmp,
}

impl Protocol {
    /// Every routable protocol (excludes `Unknown`).
    pub const ALL: [Protocol; 6] = [
        Protocol::Http,
        Protocol::MySql,
        Protocol::PostgreSql,
        Protocol::MongoDb,
        Protocol::Redis,
        Protocol::Rtmp,
    ];

    /// Display name, also used as the `protocol` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Unknown => "Unknown",
            Protocol::Http => "HTTP",
            Protocol::MySql => "MySQL",
            Protocol::PostgreSql => "PostgreSQL",
            Protocol::MongoDb => "MongoDB",
            Protocol::Redis => "Redis",
            Protocol::Rtmp => "RTMP",
        }
    }

    /// Lowercase key used for default rate-limit bucket names.
    pub fn bucket_key(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    pub fn is_known(&self) -> bool {
        *self != Protocol::Unknown
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = std::convert::Infallible;

    /// Case-insensitive. Anything unrecognised parses as `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let protocol = match s.trim().to_ascii_lowercase().as_str() {
            "http" => Protocol::Http,
            "mysql" => Protocol::MySql,
            "postgresql" | "postgres" => Protocol::PostgreSql,
            "mongodb" | "mongo" => Protocol::MongoDb,
            "redis" => Protocol::Redis,
            "rtmp" => Protocol::Rtmp,
            _ => Protocol::Unknown,
        };
        Ok(protocol)
    }
}

/// Parse a protocol name, mapping anything unrecognised to `Unknown`.
pub fn parse_protocol(s: &str) -> Protocol {
    s.parse().unwrap_or(Protocol::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(parse_protocol("http"), Protocol::Http);
        assert_eq!(parse_protocol("HTTP"), Protocol::Http);
        assert_eq!(parse_protocol("MySQL"), Protocol::MySql);
        assert_eq!(parse_protocol("postgresql"), Protocol::PostgreSql);
        assert_eq!(parse_protocol("MongoDB"), Protocol::MongoDb);
        assert_eq!(parse_protocol(" redis "), Protocol::Redis);
        assert_eq!(parse_protocol("rtmp"), Protocol::Rtmp);
        assert_eq!(parse_protocol("smtp"), Protocol::Unknown);
    }

    #[test]
    fn test_display_round_trips() {
        for protocol in Protocol::ALL {
            assert_eq!(parse_protocol(&protocol.to_string()), protocol);
        }
        assert_eq!(Protocol::PostgreSql.bucket_key(), "postgresql");
    }
}
