//! Environment-driven configuration.

use std::path::PathBuf;

use thiserror::Error;

pub const TOKEN_VAR: &str = "DISCORD_TOKEN";
pub const MEDIA_ROOT_VAR: &str = "MEDIA_ROOT";
pub const RESPONSES_FILE_VAR: &str = "RESPONSES_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DISCORD_TOKEN environment variable not set")]
    MissingToken,
}

#[derive(Clone)]
pub struct BotConfig {
    pub token: String,
    /// Parent of the `images/` and `videos/` directories.
    pub media_root: PathBuf,
    /// Trigger table to use instead of the built-in one.
    pub responses_file: Option<PathBuf>,
}

impl BotConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let token = get(TOKEN_VAR).ok_or(ConfigError::MissingToken)?;
        let media_root = get(MEDIA_ROOT_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let responses_file = get(RESPONSES_FILE_VAR).map(PathBuf::from);

        Ok(Self {
            token,
            media_root,
            responses_file,
        })
    }
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("token", &"<redacted>")
            .field("media_root", &self.media_root)
            .field("responses_file", &self.responses_file)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn token_is_required() {
        let err = BotConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingToken));
        assert_eq!(err.to_string(), "DISCORD_TOKEN environment variable not set");
    }

    #[test]
    fn blank_token_counts_as_missing() {
        assert!(BotConfig::from_lookup(lookup(&[(TOKEN_VAR, "  ")])).is_err());
    }

    #[test]
    fn defaults_to_current_directory() {
        let config = BotConfig::from_lookup(lookup(&[(TOKEN_VAR, "abc")])).unwrap();
        assert_eq!(config.token, "abc");
        assert_eq!(config.media_root, PathBuf::from("."));
        assert!(config.responses_file.is_none());
    }

    #[test]
    fn optional_paths_are_read() {
        let config = BotConfig::from_lookup(lookup(&[
            (TOKEN_VAR, "abc"),
            (MEDIA_ROOT_VAR, "/srv/media"),
            (RESPONSES_FILE_VAR, "/etc/bot/responses.json"),
        ]))
        .unwrap();
        assert_eq!(config.media_root, PathBuf::from("/srv/media"));
        assert_eq!(
            config.responses_file,
            Some(PathBuf::from("/etc/bot/responses.json"))
        );
    }

    #[test]
    fn debug_output_redacts_token() {
        let config = BotConfig::from_lookup(lookup(&[(TOKEN_VAR, "hunter2")])).unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
