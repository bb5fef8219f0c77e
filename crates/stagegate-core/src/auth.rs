//! # Capabilities
//!
//! The identity layer resolves the calling principal once per request and
//! hands it to the engine. The engine never looks identity up on its own.

use crate::error::EngineError;
use crate::types::{OperatorId, StageIndex};
use serde::{Deserialize, Serialize};

/// A permission checked by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Request handoffs (issue checkpoint tokens) and manage blocks.
    GenerateCheckpoint,
    /// Confirm handoffs, mark work ready and ship.
    Confirm,
    /// Send orders back for rework.
    ReturnOrders,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GenerateCheckpoint => "can_generate_checkpoint",
            Self::Confirm => "can_confirm",
            Self::ReturnOrders => "can_return_orders",
        };
        f.write_str(name)
    }
}

/// The capabilities granted to one principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default)]
    pub can_generate_checkpoint: bool,
    #[serde(default)]
    pub can_confirm: bool,
    #[serde(default)]
    pub can_return_orders: bool,
    /// When set, stage-bound actions are limited to this station.
    #[serde(default)]
    pub stage_restriction: Option<StageIndex>,
}

impl CapabilitySet {
    /// Everything, unrestricted.
    #[must_use]
    pub fn supervisor() -> Self {
        Self {
            can_generate_checkpoint: true,
            can_confirm: true,
            can_return_orders: true,
            stage_restriction: None,
        }
    }

    /// A station operator who may only confirm work at `stage`.
    #[must_use]
    pub fn station(stage: StageIndex) -> Self {
        Self {
            can_confirm: true,
            stage_restriction: Some(stage),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::GenerateCheckpoint => self.can_generate_checkpoint,
            Capability::Confirm => self.can_confirm,
            Capability::ReturnOrders => self.can_return_orders,
        }
    }
}

/// The calling principal: who they are and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: OperatorId,
    pub capabilities: CapabilitySet,
}

impl Principal {
    #[must_use]
    pub fn new(id: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            id: OperatorId::new(id),
            capabilities,
        }
    }

    /// Fail with `Unauthorized` unless the capability is granted.
    pub fn require(&self, capability: Capability) -> Result<(), EngineError> {
        if self.capabilities.has(capability) {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(capability))
        }
    }

    /// Fail with `StageRestricted` if the principal is bound to another stage.
    pub fn require_stage(&self, stage: StageIndex) -> Result<(), EngineError> {
        match self.capabilities.stage_restriction {
            Some(allowed) if allowed != stage => Err(EngineError::StageRestricted {
                allowed,
                requested: stage,
            }),
            _ => Ok(()),
        }
    }
}
