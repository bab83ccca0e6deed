use std::{fs, path::Path, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of the manifest file in every engine directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Name of the build descriptor in every engine directory.
pub const DOCKERFILE: &str = "Dockerfile";

/// Build argument whose declaration marks an image as built from fetched source.
pub const SOURCE_BUILD_ARG: &str = "srcPath";

/// Declarative configuration of an engine, read from its `manifest.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineManifest {
    /// Display name.
    pub name: String,
    /// Source repository in `owner/repo` form.
    pub repository: String,
    /// Tag or branch to build.
    pub version: String,
    /// Pinned commit, skips resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Clone the repository instead of downloading an archive.
    #[serde(default, rename = "clone", skip_serializing_if = "Option::is_none")]
    pub clone_repository: Option<bool>,
    /// Direct download URL, bypasses the source host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EngineManifest {
    /// Reads and validates the manifest of engine `id` from `path`.
    ///
    /// # Errors
    ///
    /// [`Error::Manifest`] if the file is missing, not valid JSON, or lacks a required field.
    pub fn load(id: &str, path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|err| Error::engine(id, err))?;
        let manifest: Self = serde_json::from_str(&data).map_err(|err| Error::engine(id, err))?;
        manifest.validate(id)?;
        Ok(manifest)
    }

    fn validate(&self, id: &str) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("repository", &self.repository),
            ("version", &self.version),
        ] {
            if value.trim().is_empty() {
                return Err(Error::engine(id, format!("manifest field `{field}` is empty")));
            }
        }
        if self.source.is_none() && !self.repository.contains('/') {
            return Err(Error::engine(
                id,
                format!(
                    "repository `{}` is not in owner/repo form",
                    self.repository
                ),
            ));
        }
        Ok(())
    }
}

/// Facts scraped from an engine's Dockerfile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFacts {
    /// Binary declared by the single-argument `ENTRYPOINT` directive.
    pub entrypoint: String,
    /// Whether the image is built from fetched source (declares `ARG srcPath`).
    pub builds_from_source: bool,
}

impl EngineFacts {
    /// Scrapes the facts from the text of a Dockerfile.
    ///
    /// # Errors
    ///
    /// [`Error::Manifest`] unless exactly one recognizable `ENTRYPOINT` is declared.
    ///
    /// # Examples
    ///
    /// ```
    /// use mjsuite::engines::EngineFacts;
    ///
    /// let facts = EngineFacts::parse("qjs", "FROM alpine\nARG srcPath\nENTRYPOINT [\"qjs\"]\n").unwrap();
    ///
    /// assert_eq!(facts.entrypoint, "qjs");
    /// assert!(facts.builds_from_source);
    /// ```
    pub fn parse(id: &str, dockerfile: &str) -> Result<Self> {
        static ENTRYPOINT: OnceLock<Regex> = OnceLock::new();
        static SOURCE_ARG: OnceLock<Regex> = OnceLock::new();
        let entrypoint_pattern = ENTRYPOINT.get_or_init(|| {
            Regex::new(r#"(?im)^[ \t]*ENTRYPOINT[ \t]+(?:\[[ \t]*"([^"]+)"[ \t]*\]|([^\s\[]\S*))[ \t]*\r?$"#)
                .expect("entrypoint pattern is valid")
        });
        let source_pattern = SOURCE_ARG.get_or_init(|| {
            Regex::new(&format!(r"(?m)^[ \t]*(?i:ARG)[ \t]+{SOURCE_BUILD_ARG}\b"))
                .expect("source argument pattern is valid")
        });

        let entrypoints: Vec<String> = entrypoint_pattern
            .captures_iter(dockerfile)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|m| m.as_str().to_string())
            .collect();
        let entrypoint = match entrypoints.as_slice() {
            [entrypoint] => entrypoint.clone(),
            [] => {
                return Err(Error::engine(
                    id,
                    "Dockerfile does not declare a single-argument ENTRYPOINT",
                ))
            }
            _ => {
                return Err(Error::engine(
                    id,
                    format!(
                        "Dockerfile declares {} ENTRYPOINT directives, expected exactly one",
                        entrypoints.len()
                    ),
                ))
            }
        };

        Ok(Self {
            entrypoint,
            builds_from_source: source_pattern.is_match(dockerfile),
        })
    }

    /// Reads and scrapes the Dockerfile at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::Manifest`] if the file cannot be read or is not recognizable.
    pub fn load(id: &str, path: &Path) -> Result<Self> {
        let dockerfile = fs::read_to_string(path).map_err(|err| Error::engine(id, err))?;
        Self::parse(id, &dockerfile)
    }
}
