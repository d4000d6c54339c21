use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Stream keys owned by the backend role besides the core four and `delayed`.
const BACKEND_DOMAIN_STREAMS: &[&str] = &["guild", "auth", "club"];

/// The deployment role a process runs as.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// Game logic, persistence and scoring.
    Backend,

    /// The Discord-facing bot.
    Discord,
}

impl AppType {
    /// The wire name used in durable consumer names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Discord => "discord",
        }
    }

    /// Stream keys this role provisions at startup.
    #[must_use]
    pub fn streams(self) -> Vec<&'static str> {
        match self {
            Self::Backend => {
                let mut streams = vec!["user", "leaderboard", "round", "score"];
                streams.extend_from_slice(BACKEND_DOMAIN_STREAMS);
                streams.push(crate::delayed::DELAYED_STREAM);
                streams
            }
            Self::Discord => vec!["discord"],
        }
    }

    /// Topic prefixes this role may not publish to or subscribe on, unless configured otherwise.
    #[must_use]
    pub fn default_forbidden_prefixes(self) -> Vec<String> {
        match self {
            Self::Backend => vec!["discord.".to_string()],
            Self::Discord => Vec::new(),
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backend" => Ok(Self::Backend),
            "discord" => Ok(Self::Discord),
            other => Err(Error::UnknownAppType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_owns_domain_and_delayed_streams() {
        let streams = AppType::Backend.streams();

        for key in ["user", "leaderboard", "round", "score", "guild", "auth", "club", "delayed"] {
            assert!(streams.contains(&key), "missing {key}");
        }
        assert!(!streams.contains(&"discord"));
    }

    #[test]
    fn discord_owns_only_discord_stream() {
        assert_eq!(AppType::Discord.streams(), vec!["discord"]);
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!("backend".parse::<AppType>().unwrap(), AppType::Backend);
        assert_eq!("discord".parse::<AppType>().unwrap(), AppType::Discord);
        assert!("worker".parse::<AppType>().is_err());
    }
}
