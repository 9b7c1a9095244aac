//! Trigger keywords and what the bot answers with.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid responses table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("trigger #{index} has an empty keyword")]
    EmptyTrigger { index: usize },
}

/// What a trigger answers with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    /// One of these lines, chosen at random.
    Text {
        #[serde(default)]
        content: Vec<String>,
    },
    /// One file from the media pool, chosen at random.
    Random {
        /// Optional caption sent with the file.
        #[serde(default)]
        content: Option<String>,
        /// Filled by refresh, never by configuration.
        #[serde(skip)]
        files: Vec<PathBuf>,
    },
}

impl Response {
    pub fn text<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Response::Text {
            content: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn random() -> Self {
        Response::Random {
            content: None,
            files: Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Response::Text { .. } => "text",
            Response::Random { .. } => "random",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Trigger {
    /// Lowercase substring looked for in incoming messages.
    pub trigger: String,
    #[serde(flatten)]
    pub response: Response,
}

/// Ordered trigger table. Earlier entries win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseRegistry {
    triggers: Vec<Trigger>,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table the bot ships with.
    pub fn builtin() -> Self {
        Self::new()
            .with("osaka", Response::text(Vec::<String>::new()))
            .with("elded", Response::random())
    }

    /// Append a trigger. Keywords are lowercased since matching is done
    /// against lowercased text.
    pub fn with(mut self, keyword: impl Into<String>, response: Response) -> Self {
        self.triggers.push(Trigger {
            trigger: keyword.into().to_lowercase(),
            response,
        });
        self
    }

    /// Load a JSON array of triggers.
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse a JSON array of triggers.
    pub fn from_json(raw: &str) -> Result<Self, RegistryError> {
        let triggers: Vec<Trigger> = serde_json::from_str(raw)?;
        let mut registry = Self::new();
        for (index, entry) in triggers.into_iter().enumerate() {
            if entry.trigger.trim().is_empty() {
                return Err(RegistryError::EmptyTrigger { index });
            }
            registry = registry.with(entry.trigger, entry.response);
        }
        Ok(registry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Replace the file list of every `random` entry with `files`.
    pub fn set_media_files(&mut self, files: Vec<PathBuf>) {
        for entry in &mut self.triggers {
            if let Response::Random { files: current, .. } = &mut entry.response {
                *current = files.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_keeps_insertion_order() {
        let registry = ResponseRegistry::builtin();
        let keywords: Vec<_> = registry.iter().map(|t| t.trigger.as_str()).collect();
        assert_eq!(keywords, vec!["osaka", "elded"]);
    }

    #[test]
    fn keywords_are_lowercased() {
        let registry = ResponseRegistry::new().with("OsAkA", Response::text(["a"]));
        assert_eq!(registry.iter().next().unwrap().trigger, "osaka");
    }

    #[test]
    fn set_media_files_replaces_wholesale() {
        let mut registry = ResponseRegistry::new()
            .with("hi", Response::text(["hello"]))
            .with("pic", Response::random());
        registry.set_media_files(vec![PathBuf::from("images/image1.png")]);
        registry.set_media_files(vec![PathBuf::from("videos/video1.mp4")]);

        let pic = registry.iter().nth(1).unwrap();
        match &pic.response {
            Response::Random { files, .. } => {
                assert_eq!(files, &vec![PathBuf::from("videos/video1.mp4")]);
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(
            registry.iter().next().unwrap().response,
            Response::text(["hello"])
        );
    }

    #[test]
    fn parses_json_table() {
        let registry = ResponseRegistry::from_json(
            r#"[
                { "trigger": "Osaka", "type": "text", "content": ["a", "b"] },
                { "trigger": "elded", "type": "random", "content": "look" }
            ]"#,
        )
        .expect("valid table");

        let entries: Vec<_> = registry.iter().collect();
        assert_eq!(entries[0].trigger, "osaka");
        assert_eq!(entries[0].response, Response::text(["a", "b"]));
        assert_eq!(
            entries[1].response,
            Response::Random {
                content: Some("look".into()),
                files: Vec::new()
            }
        );
    }

    #[test]
    fn rejects_unknown_kind() {
        let result = ResponseRegistry::from_json(r#"[{ "trigger": "x", "type": "audio" }]"#);
        assert!(matches!(result, Err(RegistryError::Parse(_))));
    }

    #[test]
    fn rejects_blank_keyword() {
        let result =
            ResponseRegistry::from_json(r#"[{ "trigger": " ", "type": "text", "content": [] }]"#);
        assert!(matches!(
            result,
            Err(RegistryError::EmptyTrigger { index: 0 })
        ));
    }

    #[test]
    fn from_file_reports_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = ResponseRegistry::from_file(&tmp.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, RegistryError::Read { .. }));
    }

    #[test]
    fn from_file_reads_table() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("responses.json");
        std::fs::write(
            &path,
            r#"[{ "trigger": "gm", "type": "text", "content": ["gm!"] }]"#,
        )
        .unwrap();
        let registry = ResponseRegistry::from_file(&path).unwrap();
        assert_eq!(registry.len(), 1);
    }
}
