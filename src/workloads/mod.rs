//! Utilities for loading workloads and compiling them for a target engine.
//!
//! A workload is a plain script under the workloads directory, identified by its file stem. Compiling a workload
//! for an engine substitutes its source into the engine's `template.js` if there is one, so engines that need a
//! harness around the workload (no `console`, different entry conventions, ...) can provide it.
//!
//! # Examples
//!
//! ```no_run
//! use std::path::Path;
//!
//! use mjsuite::workloads::Workload;
//!
//! let workload = Workload::load(Path::new("workloads"), "array-sort").expect("could not load workload");
//! let source = workload.compile(None).expect("could not compile workload");
//! ```

use std::{
    fmt::{self, Display, Formatter},
    fs,
    path::Path,
    sync::OnceLock,
};

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{engines::Engine, Error, Result};

/// Extension of workload scripts.
pub const WORKLOAD_EXTENSION: &str = "js";

/// Name of the optional per-engine template.
pub const TEMPLATE_FILE: &str = "template.js";

/// Unique identifier for a workload, the file stem of its script.
///
/// # Examples
///
/// ```
/// use mjsuite::workloads::Identifier;
///
/// let identifier = Identifier::from("array-sort");
///
/// assert_eq!(identifier.to_string(), "array-sort");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier(String);

impl Identifier {
    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A benchmark script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    /// Unique identifier for this workload.
    pub identifier: Identifier,
    source: String,
}

/// A workload as shown in listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkloadSummary {
    /// Identifier of the workload.
    pub identifier: Identifier,
    /// Number of lines in its script.
    pub lines: usize,
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{\s*workload\s*\}").expect("placeholder pattern is valid"))
}

impl Workload {
    /// Creates a workload from its source text.
    pub fn new(identifier: impl Into<Identifier>, source: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            source: source.into(),
        }
    }

    /// Loads workload `id` from `workloads_dir`.
    ///
    /// # Errors
    ///
    /// [`Error::Manifest`] if the script cannot be read.
    pub fn load(workloads_dir: &Path, id: &str) -> Result<Self> {
        let path = workloads_dir.join(format!("{id}.{WORKLOAD_EXTENSION}"));
        let source = fs::read_to_string(&path).map_err(|err| Error::workload(id, err))?;
        Ok(Self::new(id, source))
    }

    /// Source text of the script.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Produces the exact text to execute on `engine`, or the bare source when no engine is given.
    ///
    /// Engines without a template get the source unchanged. With a template, the single `${workload}` placeholder
    /// is replaced by the source verbatim. A template without a placeholder is returned unchanged (with a
    /// warning), one with several placeholders is rejected.
    ///
    /// # Errors
    ///
    /// [`Error::Template`] if the template cannot be read or has more than one placeholder.
    pub fn compile(&self, engine: Option<&Engine>) -> Result<String> {
        let Some(engine) = engine else {
            return Ok(self.source.clone());
        };

        let template_path = engine.template_path();
        if !template_path.exists() {
            log::debug!(
                "no workload template found for {}\n> {}",
                engine.identifier(),
                template_path.display()
            );
            return Ok(self.source.clone());
        }

        let template = fs::read_to_string(&template_path).map_err(|err| Error::Template {
            engine: engine.identifier().to_string(),
            reason: err.to_string(),
        })?;
        self.substitute(engine.identifier().as_str(), &template)
    }

    /// Substitutes the source into `template`, see [`Workload::compile`].
    ///
    /// # Errors
    ///
    /// [`Error::Template`] if the template has more than one placeholder.
    pub fn substitute(&self, engine: &str, template: &str) -> Result<String> {
        match placeholder().find_iter(template).count() {
            0 => {
                log::warn!("template for {engine} has no workload placeholder, the workload is not injected");
                Ok(template.to_string())
            }
            1 => Ok(placeholder()
                .replace(template, regex::NoExpand(&self.source))
                .into_owned()),
            n => Err(Error::Template {
                engine: engine.to_string(),
                reason: format!("expected a single workload placeholder, found {n}"),
            }),
        }
    }
}

/// Identifiers of every workload under `workloads_dir`, sorted.
///
/// # Errors
///
/// If the directory cannot be searched.
pub fn find_all_ids(workloads_dir: &Path) -> anyhow::Result<Vec<Identifier>> {
    let mut ids: Vec<Identifier> = glob::glob(
        workloads_dir
            .join(format!("*.{WORKLOAD_EXTENSION}"))
            .to_str()
            .context("could not convert workload pattern to string")?,
    )
    .context("searching for all workloads")?
    .filter_map(|r| {
        let path = r
            .map_err(|err| {
                log::warn!("could not get globbed path: {err}, skipping...");
            })
            .ok()?;
        Some(Identifier::from(path.file_stem()?.to_str()?))
    })
    .collect();
    ids.sort();
    log::debug!("found {} workloads", ids.len());
    Ok(ids)
}

/// Every workload under `workloads_dir` with its line count.
///
/// # Errors
///
/// If the directory cannot be searched or a script cannot be read.
pub fn list_all(workloads_dir: &Path) -> anyhow::Result<Vec<WorkloadSummary>> {
    find_all_ids(workloads_dir)?
        .into_iter()
        .map(|identifier| -> anyhow::Result<WorkloadSummary> {
            let workload = Workload::load(workloads_dir, identifier.as_str())?;
            Ok(WorkloadSummary {
                lines: workload.source.split('\n').count(),
                identifier,
            })
        })
        .collect()
}
