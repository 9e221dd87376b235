//! Named view definitions: the sets of top-level requirements a deployment
//! computes, grouped by calculation configuration.

use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::BuildRequest;
use crate::error::ConfigError;
use crate::value::{PropertySet, ValueRequirement};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalcConfiguration {
    pub name: String,
    #[serde(default)]
    pub defaults: PropertySet,
    pub requirements: Vec<ValueRequirement>,
}

impl CalcConfiguration {
    /// The requirements as the engine sees them, with defaults applied.
    pub fn resolved_requirements(&self) -> Vec<ValueRequirement> {
        self.requirements
            .iter()
            .map(|requirement| {
                requirement
                    .clone()
                    .with_constraints(requirement.constraints().with_defaults(&self.defaults))
            })
            .collect()
    }

    pub fn to_request(&self, valuation_time: DateTime<Utc>) -> BuildRequest {
        self.requirements.iter().cloned().fold(
            BuildRequest::new(&self.name, valuation_time).with_defaults(self.defaults.clone()),
            BuildRequest::with,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    pub configurations: Vec<CalcConfiguration>,
}

/// Supplies the view definitions to validate.
pub trait ConfigSource: Send + Sync {
    /// Every view, in a stable order.
    fn views(&self) -> Result<Vec<ViewDefinition>, ConfigError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    views: Vec<ViewDefinition>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, view: ViewDefinition) -> Self {
        self.views.push(view);
        self
    }
}

impl ConfigSource for InMemorySource {
    fn views(&self) -> Result<Vec<ViewDefinition>, ConfigError> {
        check_unique(&self.views)?;
        Ok(self.views.clone())
    }
}

/// One view per JSON file, for every file matching a glob pattern under a
/// base directory. Files are read in path order.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    base: Utf8PathBuf,
    pattern: String,
}

impl JsonFileSource {
    pub fn new(base: impl Into<Utf8PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            pattern: pattern.into(),
        }
    }

    fn read(path: &Utf8Path) -> Result<ViewDefinition, ConfigError> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_owned(),
            source,
        })
    }
}

impl ConfigSource for JsonFileSource {
    fn views(&self) -> Result<Vec<ViewDefinition>, ConfigError> {
        let pattern = self.base.join(&self.pattern);

        let mut paths = vec![];
        for path in glob::glob(pattern.as_str())? {
            paths.push(Utf8PathBuf::try_from(path?)?);
        }
        paths.sort();

        let views = paths
            .iter()
            .map(|path| Self::read(path))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Loaded {} views from {pattern}", views.len());
        check_unique(&views)?;
        Ok(views)
    }
}

fn check_unique(views: &[ViewDefinition]) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for view in views {
        if !seen.insert(view.name.as_str()) {
            return Err(ConfigError::DuplicateView(view.name.clone()));
        }
    }
    Ok(())
}
