//! Entity operations requested by workflows

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single write applied as part of a transact operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EntityWrite {
    Set {
        entity: String,
        key: String,
        value: Value,
    },
    Delete {
        entity: String,
        key: String,
    },
}

/// Operation against the keyed entity store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum EntityOperation {
    Get { name: String, key: String },
    Set { name: String, key: String, value: Value },
    Delete { name: String, key: String },
    /// All entries of one entity
    List { name: String },
    /// Several writes applied atomically, possibly across entities
    Transact { writes: Vec<EntityWrite> },
}

impl EntityOperation {
    /// Operation kind, compared during replay
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::Delete { .. } => "delete",
            Self::List { .. } => "list",
            Self::Transact { .. } => "transact",
        }
    }

    /// Entity the operation targets; `None` for multi-entity operations
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            Self::Get { name, .. }
            | Self::Set { name, .. }
            | Self::Delete { name, .. }
            | Self::List { name } => Some(name),
            Self::Transact { .. } => None,
        }
    }

    /// Whether `other` is the same kind of operation on the same entity
    pub fn corresponds_to(&self, other: &EntityOperation) -> bool {
        self.kind() == other.kind() && self.entity_name() == other.entity_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_correspondence_by_kind_and_name() {
        let get = EntityOperation::Get {
            name: "counter".into(),
            key: "a".into(),
        };
        let other_key = EntityOperation::Get {
            name: "counter".into(),
            key: "b".into(),
        };
        let other_entity = EntityOperation::Get {
            name: "users".into(),
            key: "a".into(),
        };
        let set = EntityOperation::Set {
            name: "counter".into(),
            key: "a".into(),
            value: json!(1),
        };

        assert!(get.corresponds_to(&other_key));
        assert!(!get.corresponds_to(&other_entity));
        assert!(!get.corresponds_to(&set));

        let transact = EntityOperation::Transact { writes: vec![] };
        assert!(transact.corresponds_to(&EntityOperation::Transact { writes: vec![] }));
        assert_eq!(transact.entity_name(), None);
    }
}
