use teloxide::types::{ChatId, UserId};
use thiserror::Error;

use crate::gate::MAX_CHANNELS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {0} has an invalid value")]
    Invalid(&'static str),
}

/// Process configuration, read once at startup. The owner force-sub list is
/// immutable from here on; the gate receives it by value.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub owner_id: UserId,
    pub force_sub: Vec<ChatId>,
    pub database_url: String,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let owner_id = std::env::var("OWNER_ID")
            .map_err(|_| ConfigError::Missing("OWNER_ID"))?
            .trim()
            .parse::<u64>()
            .map(UserId)
            .map_err(|_| ConfigError::Invalid("OWNER_ID"))?;

        let force_sub = match std::env::var("FSUB") {
            Ok(raw) => parse_force_sub(&raw).ok_or(ConfigError::Invalid("FSUB"))?,
            Err(_) => Vec::new(),
        };

        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            owner_id,
            force_sub,
            database_url,
        })
    }
}

/// Space-separated channel ids; anything past the fourth is dropped.
fn parse_force_sub(raw: &str) -> Option<Vec<ChatId>> {
    let mut ids = Vec::new();
    for token in raw.split_whitespace() {
        ids.push(ChatId(token.parse::<i64>().ok()?));
    }
    if ids.len() > MAX_CHANNELS {
        log::warn!(
            "FSUB lists {} channels, only the first {MAX_CHANNELS} are used",
            ids.len()
        );
        ids.truncate(MAX_CHANNELS);
    }
    Some(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_id_list() {
        assert_eq!(
            parse_force_sub("-1001 -1002"),
            Some(vec![ChatId(-1001), ChatId(-1002)])
        );
        assert_eq!(parse_force_sub(""), Some(vec![]));
        assert_eq!(parse_force_sub("  "), Some(vec![]));
    }

    #[test]
    fn caps_the_list_at_four() {
        let ids = parse_force_sub("-1 -2 -3 -4 -5").unwrap();
        assert_eq!(ids.len(), MAX_CHANNELS);
        assert_eq!(ids.last(), Some(&ChatId(-4)));
    }

    #[test]
    fn rejects_non_numeric_entries() {
        assert_eq!(parse_force_sub("@channel"), None);
        assert_eq!(parse_force_sub("-1001 nope"), None);
    }
}
