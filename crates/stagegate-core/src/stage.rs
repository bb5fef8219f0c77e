//! # Stage Registry
//!
//! The ordered, runtime-immutable list of production stages.
//!
//! ## Invariants
//!
//! | Rule | Checked by |
//! |------|------------|
//! | Active indices are `0, 1, 2, ...` with no gaps | [`StageRegistry::new`] |
//! | Indices are unique across active and inactive stages | [`StageRegistry::new`] |
//! | Names are unique (case-insensitive) and non-empty | [`StageRegistry::new`] |
//! | At least one active stage exists | [`StageRegistry::new`] |
//!
//! Changing the list is an administrative operation (edit the config and
//! restart), never part of the transition protocol.
//!
//! ## Parallel work
//!
//! A stage with `allows_parallel_work` may run alongside its predecessor, so
//! a forward handoff is allowed to skip over it. Every other stage must be
//! entered in order.

use crate::error::EngineError;
use crate::primitives::MAX_NAME_LENGTH;
use crate::types::StageIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

// =============================================================================
// STAGE
// =============================================================================

/// One station in the production pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub index: StageIndex,
    pub name: String,
    #[serde(default)]
    pub allows_parallel_work: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Stage {
    #[must_use]
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index: StageIndex(index),
            name: name.into(),
            allows_parallel_work: false,
            is_active: true,
        }
    }

    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.allows_parallel_work = true;
        self
    }

    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.index, self.name)
    }
}

/// Result of asking for the stage after another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStage<'a> {
    Stage(&'a Stage),
    /// The sequence is exhausted: the order is ready for shipment.
    Terminal,
}

// =============================================================================
// REGISTRY ERRORS
// =============================================================================

/// Reasons a stage list is rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("No active stages configured")]
    Empty,

    #[error("Stage index {0} is used more than once")]
    DuplicateIndex(StageIndex),

    #[error("Stage name '{0}' is used more than once")]
    DuplicateName(String),

    #[error("Stage {0} has an empty or oversized name")]
    InvalidName(StageIndex),

    #[error("Active stage indices must be 0..n without gaps; expected {expected}, found {found}")]
    NotDense {
        expected: StageIndex,
        found: StageIndex,
    },
}

// =============================================================================
// STAGE REGISTRY
// =============================================================================

/// The validated pipeline. Cheap to share behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRegistry {
    /// Active stages; `active[i].index == StageIndex(i)`.
    active: Vec<Stage>,
    /// Retired stages, kept so historical records still resolve to a name.
    inactive: Vec<Stage>,
}

impl StageRegistry {
    /// Validate and build a registry from an unordered stage list.
    pub fn new(stages: Vec<Stage>) -> Result<Self, RegistryError> {
        let mut seen_indices = BTreeSet::new();
        let mut seen_names = BTreeSet::new();
        for stage in &stages {
            let trimmed = stage.name.trim();
            if trimmed.is_empty() || trimmed.len() > MAX_NAME_LENGTH {
                return Err(RegistryError::InvalidName(stage.index));
            }
            if !seen_indices.insert(stage.index) {
                return Err(RegistryError::DuplicateIndex(stage.index));
            }
            if !seen_names.insert(trimmed.to_ascii_lowercase()) {
                return Err(RegistryError::DuplicateName(stage.name.clone()));
            }
        }

        let (mut active, mut inactive): (Vec<Stage>, Vec<Stage>) =
            stages.into_iter().partition(|s| s.is_active);
        active.sort_by_key(|s| s.index);
        inactive.sort_by_key(|s| s.index);

        if active.is_empty() {
            return Err(RegistryError::Empty);
        }
        for (position, stage) in active.iter().enumerate() {
            let expected = StageIndex(position as u32);
            if stage.index != expected {
                return Err(RegistryError::NotDense {
                    expected,
                    found: stage.index,
                });
            }
        }

        Ok(Self { active, inactive })
    }

    /// The upholstery shop pipeline used when no stages are configured.
    #[must_use]
    pub fn default_pipeline() -> Self {
        Self {
            active: vec![
                Stage::new(0, "design"),
                Stage::new(1, "framing"),
                Stage::new(2, "foam-molding").parallel(),
                Stage::new(3, "sewing").parallel(),
                Stage::new(4, "upholstery"),
                Stage::new(5, "assembly"),
            ],
            inactive: Vec::new(),
        }
    }

    /// Active stages in pipeline order.
    #[must_use]
    pub fn list_active_stages(&self) -> &[Stage] {
        &self.active
    }

    /// Retired stages.
    #[must_use]
    pub fn inactive_stages(&self) -> &[Stage] {
        &self.inactive
    }

    #[must_use]
    pub fn first_stage(&self) -> &Stage {
        // Non-empty by construction.
        &self.active[0]
    }

    #[must_use]
    pub fn last_stage(&self) -> &Stage {
        &self.active[self.active.len() - 1]
    }

    /// Look up an active stage by index.
    #[must_use]
    pub fn get(&self, index: StageIndex) -> Option<&Stage> {
        self.active.get(index.0 as usize)
    }

    /// Look up any stage, active or retired, by index.
    #[must_use]
    pub fn get_any(&self, index: StageIndex) -> Option<&Stage> {
        self.get(index)
            .or_else(|| self.inactive.iter().find(|s| s.index == index))
    }

    /// Look up an active stage by name, ignoring ASCII case.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Stage> {
        let name = name.trim();
        self.active
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Resolve user input that is either a stage index or a stage name.
    pub fn resolve(&self, input: &str) -> Result<&Stage, EngineError> {
        let found = match input.trim().parse::<u32>() {
            Ok(index) => self.get(StageIndex(index)),
            Err(_) => self.by_name(input),
        };
        found.ok_or_else(|| EngineError::UnknownStage(input.to_string()))
    }

    /// Fail with `UnknownStage` unless `index` names an active stage.
    pub fn require(&self, index: StageIndex) -> Result<&Stage, EngineError> {
        self.get(index)
            .ok_or_else(|| EngineError::UnknownStage(index.to_string()))
    }

    /// The stage after `current`, or `Terminal` after the last active stage.
    pub fn next_stage(&self, current: StageIndex) -> Result<NextStage<'_>, EngineError> {
        self.require(current)?;
        Ok(match self.get(current.successor()) {
            Some(stage) if current.0 < u32::MAX => NextStage::Stage(stage),
            _ => NextStage::Terminal,
        })
    }

    /// The stage before `current`, if any.
    pub fn previous_stage(&self, current: StageIndex) -> Result<Option<&Stage>, EngineError> {
        self.require(current)?;
        Ok(current
            .0
            .checked_sub(1)
            .and_then(|prev| self.get(StageIndex(prev))))
    }

    /// Check that an order at `from` (or not yet in the pipeline) may be
    /// handed forward to `to`.
    ///
    /// The target must lie ahead of `from`, and every stage skipped on the
    /// way must allow parallel work.
    pub fn check_forward(&self, from: Option<StageIndex>, to: StageIndex) -> Result<(), EngineError> {
        self.require(to)?;
        let first_skipped = match from {
            Some(current) => {
                self.require(current)?;
                if to <= current {
                    return Err(EngineError::invalid(
                        "target_stage",
                        format!("stage {to} is not ahead of current stage {current}"),
                    ));
                }
                current.0 + 1
            }
            None => 0,
        };
        let blocking = (first_skipped..to.0)
            .filter_map(|i| self.get(StageIndex(i)))
            .find(|s| !s.allows_parallel_work);
        match blocking {
            Some(stage) => Err(EngineError::invalid(
                "target_stage",
                format!("cannot skip stage '{}' which does not allow parallel work", stage.name),
            )),
            None => Ok(()),
        }
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

// =============================================================================
// TESTS
// =============================================================================
