//! Compensation strategies applied after a terminal step failure

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which completed steps are undone when a workflow fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// Undo every completed step, newest first
    #[default]
    CompensateAll,

    /// Undo only completed steps with id >= the given step
    CompensateFrom(u32),

    /// Leave the workflow FAILED for an operator to decide
    Manual,
}

impl fmt::Display for CompensationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompensateAll => f.write_str("compensate_all"),
            Self::CompensateFrom(step_id) => write!(f, "compensate_from:{}", step_id),
            Self::Manual => f.write_str("manual"),
        }
    }
}

impl FromStr for CompensationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "compensate_all" => Ok(Self::CompensateAll),
            "manual" => Ok(Self::Manual),
            other => match other.strip_prefix("compensate_from:") {
                Some(step_id) => step_id
                    .parse()
                    .map(Self::CompensateFrom)
                    .map_err(|_| format!("invalid step id in strategy: {:?}", other)),
                None => Err(format!("unknown compensation strategy: {:?}", other)),
            },
        }
    }
}
