//! Replicated operations exchanged between sites.

use serde::{Deserialize, Serialize};

use super::id::OpId;

/// A single replicated edit.
///
/// Inserts carry their neighbours at creation time (`left_origin`,
/// `right_origin`); deletes carry their own id so the state vector counts
/// them like any other op and resync can ship them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    Insert {
        id: OpId,
        value: char,
        left_origin: Option<OpId>,
        right_origin: Option<OpId>,
    },
    #[serde(rename_all = "camelCase")]
    Delete { id: OpId, target: OpId },
}

impl Operation {
    /// The id of this operation.
    pub fn id(&self) -> OpId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => *id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }

    /// Ids that must already be integrated before this op can apply.
    pub fn dependencies(&self) -> impl Iterator<Item = OpId> {
        let deps: [Option<OpId>; 2] = match self {
            Operation::Insert { left_origin, right_origin, .. } => [*left_origin, *right_origin],
            Operation::Delete { target, .. } => [Some(*target), None],
        };
        deps.into_iter().flatten()
    }
}
