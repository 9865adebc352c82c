//! Resource kind enumeration.
//!
//! Every migratable object on the platform belongs to exactly one kind.
//! The enum keys the cross-kind ID-map table and the per-kind statistics,
//! and names items in the persisted session file, so its serialized form is
//! part of the on-disk schema and must stay stable.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::MigrateError;

/// The migratable resource kinds, in rough dependency order.
///
/// * `Dataset`: named container of examples; the root of the dependency
///   graph.
/// * `Example`: dataset row with arbitrary JSON inputs/outputs and optional
///   binary attachments.
/// * `Experiment`: evaluation session bound to a reference dataset.
/// * `Run`: execution trace row; forms a tree via `parent_run_id`.
/// * `Feedback`: score/comment attached to a run.
/// * `Queue`: annotation queue.
/// * `Prompt`: prompt repository with a commit DAG.
/// * `Rule`: automation rule scoped to a project and/or dataset.
/// * `Chart`: dashboard element, optionally grouped into a section.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Dataset,
    Example,
    Experiment,
    Run,
    Feedback,
    Queue,
    Prompt,
    Rule,
    Chart,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Dataset => "dataset",
            ResourceKind::Example => "example",
            ResourceKind::Experiment => "experiment",
            ResourceKind::Run => "run",
            ResourceKind::Feedback => "feedback",
            ResourceKind::Queue => "queue",
            ResourceKind::Prompt => "prompt",
            ResourceKind::Rule => "rule",
            ResourceKind::Chart => "chart",
        }
    }

    /// All kinds, in the cross-kind dependency order the orchestrator uses.
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Dataset,
            ResourceKind::Example,
            ResourceKind::Experiment,
            ResourceKind::Run,
            ResourceKind::Feedback,
            ResourceKind::Prompt,
            ResourceKind::Queue,
            ResourceKind::Rule,
            ResourceKind::Chart,
        ]
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataset" => Ok(ResourceKind::Dataset),
            "example" => Ok(ResourceKind::Example),
            "experiment" => Ok(ResourceKind::Experiment),
            "run" => Ok(ResourceKind::Run),
            "feedback" => Ok(ResourceKind::Feedback),
            "queue" => Ok(ResourceKind::Queue),
            "prompt" => Ok(ResourceKind::Prompt),
            "rule" => Ok(ResourceKind::Rule),
            "chart" => Ok(ResourceKind::Chart),
            other => Err(MigrateError::validation(format!(
                "`{other}` is not a migratable resource kind"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for kind in ResourceKind::all() {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn test_serde_snake_case() {
        let serialized = serde_json::to_string(&ResourceKind::Queue).unwrap();
        assert_eq!(serialized, "\"queue\"");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!("widget".parse::<ResourceKind>().is_err());
    }
}
