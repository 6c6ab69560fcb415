//! JSON descriptor appended as the last line of an artifact.

use std::path::{Component, Path};

use serde::Deserialize;

use crate::error::ImageError;


#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Namespaces the cache directory. May contain `/` separated segments.
    pub identifier: String,
    /// Launch template; `{{caxa}}` markers are replaced at launch time.
    pub command: Vec<String>,
    #[serde(default)]
    pub uncompression_message: Option<String>,
}

impl Config {
    pub fn parse(footer: &[u8]) -> Result<Self, ImageError> {
        let config: Config = serde_json::from_slice(footer)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ImageError> {
        if self.identifier.is_empty() {
            return Err(ImageError::EmptyIdentifier)
        }
        let invalid = Path::new(&self.identifier)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        // components() silently folds "a/./b", so catch explicit dot segments too
        let dotted = self.identifier.split(['/', '\\']).any(|s| s == "." || s == "..");
        if invalid || dotted {
            return Err(ImageError::InvalidIdentifier(self.identifier.clone()))
        }
        Ok(())
    }

    pub fn message(&self) -> Option<&str> {
        self.uncompression_message.as_deref().filter(|m| !m.is_empty())
    }
}
