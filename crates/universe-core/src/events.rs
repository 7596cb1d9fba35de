//! Notifications produced by a tick.

use crate::interaction::InteractionOutcome;
use crate::lifecycle::Transition;
use crate::model::{ParticleId, Tick};
use serde::Serialize;
use serde_json::Value;

pub const INTERACTION_OCCURRED: &str = "interaction.occurred";
pub const PARTICLE_SPLIT: &str = "particle.split";
pub const PARTICLE_STATE_CHANGED: &str = "particle.state_changed";

/// Something observers may want to hear about.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Interaction {
        tick: Tick,
        #[serde(flatten)]
        outcome: InteractionOutcome,
    },
    Split {
        tick: Tick,
        source: ParticleId,
        children: [ParticleId; 2],
    },
    StateChanged {
        tick: Tick,
        #[serde(flatten)]
        transition: Transition,
    },
}

impl EngineEvent {
    /// Event-type label handed to the event sink.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Interaction { .. } => INTERACTION_OCCURRED,
            Self::Split { .. } => PARTICLE_SPLIT,
            Self::StateChanged { .. } => PARTICLE_STATE_CHANGED,
        }
    }

    /// JSON payload for the event sink.
    #[must_use]
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
