//! Stage registry: the static map from stage id to executable and limits.
//!
//! The registry is built once at process start and never mutated. Stages are
//! kept in ordinal order; a stage may only depend on stages registered before
//! it, so the dependency graph is acyclic by construction.

mod defaults;
mod stage;

pub use defaults::{default_registry, FOLLOW_UP_STAGE};
pub use stage::{
    Executable, StageDefinition, StageLimits, DEFAULT_MAX_OUTPUT_BYTES, HEAVY_TIMEOUT,
    LIGHT_TIMEOUT,
};

use crate::errors::{CascadeError, RegistryError};
use crate::utils::is_valid_identifier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Sentinel scope that selects every pipeline stage.
pub const ALL_STAGES: &str = "ALL";

/// A stage selector: one stage or the `ALL` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StageScope {
    /// Every pipeline stage.
    All,
    /// A single stage.
    Stage(String),
}

impl StageScope {
    /// Returns true if the scope covers the given stage.
    #[must_use]
    pub fn includes(&self, stage_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Stage(id) => id == stage_id,
        }
    }
}

impl FromStr for StageScope {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == ALL_STAGES {
            Ok(Self::All)
        } else if is_valid_identifier(trimmed) {
            Ok(Self::Stage(trimmed.to_string()))
        } else {
            Err(CascadeError::validation(format!("Invalid stage scope '{s}'")))
        }
    }
}

impl fmt::Display for StageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "{ALL_STAGES}"),
            Self::Stage(id) => write!(f, "{id}"),
        }
    }
}

impl Serialize for StageScope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StageScope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// On-disk registry description.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryFile {
    stages: Vec<StageDefinition>,
    #[serde(default)]
    follow_up: Option<String>,
}

/// Immutable, validated set of stages.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
    follow_up: Option<String>,
}

impl StageRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::default()
    }

    /// Loads a registry from a JSON file.
    ///
    /// Ordinals in the file are ignored; the array order defines them.
    pub fn from_json_file(path: &Path) -> Result<Self, CascadeError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parses a registry from a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, CascadeError> {
        let file: RegistryFile = serde_json::from_str(raw)?;
        let mut builder = Self::builder();
        for stage in file.stages {
            builder = builder.stage(stage);
        }
        if let Some(follow_up) = file.follow_up {
            builder = builder.follow_up(follow_up);
        }
        Ok(builder.build()?)
    }

    /// Looks up a stage by id.
    pub fn get(&self, id: &str) -> Result<&StageDefinition, CascadeError> {
        self.index
            .get(id)
            .map(|&i| &self.stages[i])
            .ok_or_else(|| CascadeError::UnknownStage(id.to_string()))
    }

    /// Returns true if the stage is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Returns every registered stage in ordinal order, follow-up included.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Returns the stages of the pipeline proper (the follow-up excluded).
    pub fn pipeline_stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages
            .iter()
            .filter(move |s| self.follow_up.as_deref() != Some(s.id.as_str()))
    }

    /// Returns the follow-up status synchronization stage, if configured.
    #[must_use]
    pub fn follow_up(&self) -> Option<&StageDefinition> {
        self.follow_up.as_deref().and_then(|id| self.get(id).ok())
    }

    /// Resolves a scope into stages in ordinal order.
    pub fn resolve(&self, scope: &StageScope) -> Result<Vec<&StageDefinition>, CascadeError> {
        match scope {
            StageScope::All => Ok(self.pipeline_stages().collect()),
            StageScope::Stage(id) => Ok(vec![self.get(id)?]),
        }
    }

    /// Returns every stage the given stage transitively depends on.
    #[must_use]
    pub fn ancestors(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<&str> = vec![id];

        while let Some(current) = pending.pop() {
            if let Ok(stage) = self.get(current) {
                for dep in &stage.depends_on {
                    if seen.insert(dep.clone()) {
                        pending.push(dep);
                    }
                }
            }
        }

        seen
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stages are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Builder for [`StageRegistry`].
#[derive(Debug, Clone, Default)]
pub struct StageRegistryBuilder {
    stages: Vec<StageDefinition>,
    follow_up: Option<String>,
}

impl StageRegistryBuilder {
    /// Registers a stage after the ones already added.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Names the stage run after every successful stage.
    #[must_use]
    pub fn follow_up(mut self, id: impl Into<String>) -> Self {
        self.follow_up = Some(id.into());
        self
    }

    /// Validates and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty registry, invalid or duplicate ids,
    /// dependencies on unknown or later stages, zero limits, or an
    /// unregistered follow-up stage.
    pub fn build(self) -> Result<StageRegistry, RegistryError> {
        if self.stages.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut index = HashMap::with_capacity(self.stages.len());
        let mut stages = Vec::with_capacity(self.stages.len());

        for (ordinal, mut stage) in self.stages.into_iter().enumerate() {
            if !is_valid_identifier(&stage.id) {
                return Err(RegistryError::InvalidId(stage.id));
            }
            if index.contains_key(&stage.id) {
                return Err(RegistryError::DuplicateStage(stage.id));
            }
            if stage.limits.timeout.is_zero() {
                return Err(RegistryError::InvalidLimit {
                    stage: stage.id,
                    reason: "timeout must be greater than zero".to_string(),
                });
            }
            if stage.limits.max_output_bytes == 0 {
                return Err(RegistryError::InvalidLimit {
                    stage: stage.id,
                    reason: "max output bytes must be greater than zero".to_string(),
                });
            }
            if let Some(dep) = stage.depends_on.iter().find(|d| !index.contains_key(*d)) {
                return Err(RegistryError::UnknownDependency {
                    stage: stage.id.clone(),
                    dependency: dep.clone(),
                });
            }

            stage.ordinal = ordinal;
            index.insert(stage.id.clone(), ordinal);
            stages.push(stage);
        }

        if let Some(ref follow_up) = self.follow_up {
            if !index.contains_key(follow_up) {
                return Err(RegistryError::UnknownFollowUp(follow_up.clone()));
            }
        }

        Ok(StageRegistry {
            stages,
            index,
            follow_up: self.follow_up,
        })
    }
}
