//! In-process entity store and transaction registry

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::workflow::{EntityOperation, EntityWrite, WorkflowError};

/// Keyed JSON values grouped by entity name
#[derive(Debug, Default)]
pub struct LocalEntityStore {
    entities: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl LocalEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str, key: &str) -> Option<Value> {
        self.entities
            .read()
            .get(name)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    pub fn set(&self, name: &str, key: &str, value: Value) {
        self.entities
            .write()
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Run one operation; `Transact` writes are applied under a single lock
    pub fn apply(&self, operation: &EntityOperation) -> Result<Value, WorkflowError> {
        match operation {
            EntityOperation::Get { name, key } => Ok(self.get(name, key).unwrap_or(Value::Null)),
            EntityOperation::Set { name, key, value } => {
                self.set(name, key, value.clone());
                Ok(Value::Null)
            }
            EntityOperation::Delete { name, key } => {
                if let Some(entries) = self.entities.write().get_mut(name) {
                    entries.remove(key);
                }
                Ok(Value::Null)
            }
            EntityOperation::List { name } => {
                let entities = self.entities.read();
                let entries = entities
                    .get(name)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|(key, value)| json!({"key": key, "value": value}))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Value::Array(entries))
            }
            EntityOperation::Transact { writes } => {
                let mut entities = self.entities.write();
                for write in writes {
                    match write {
                        EntityWrite::Set { entity, key, value } => {
                            entities
                                .entry(entity.clone())
                                .or_default()
                                .insert(key.clone(), value.clone());
                        }
                        EntityWrite::Delete { entity, key } => {
                            if let Some(entries) = entities.get_mut(entity) {
                                entries.remove(key);
                            }
                        }
                    }
                }
                Ok(Value::Null)
            }
        }
    }
}

/// Body of a registered transaction
pub type TransactionFn =
    dyn Fn(&LocalEntityStore, Value) -> Result<Value, WorkflowError> + Send + Sync;

/// Named transactions over the local entity store
#[derive(Default)]
pub struct LocalTransactions {
    transactions: RwLock<HashMap<String, Arc<TransactionFn>>>,
}

impl std::fmt::Debug for LocalTransactions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.transactions.read().keys().cloned().collect();
        names.sort_unstable();
        f.debug_struct("LocalTransactions")
            .field("transactions", &names)
            .finish()
    }
}

impl LocalTransactions {
    pub fn register<F>(&self, name: impl Into<String>, body: F)
    where
        F: Fn(&LocalEntityStore, Value) -> Result<Value, WorkflowError> + Send + Sync + 'static,
    {
        self.transactions.write().insert(name.into(), Arc::new(body));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TransactionFn>> {
        self.transactions.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_operations() {
        let store = LocalEntityStore::new();
        store
            .apply(&EntityOperation::Set {
                name: "carts".into(),
                key: "b".into(),
                value: json!(2),
            })
            .unwrap();
        store.set("carts", "a", json!(1));

        let listed = store
            .apply(&EntityOperation::List {
                name: "carts".into(),
            })
            .unwrap();
        assert_eq!(
            listed,
            json!([{"key": "a", "value": 1}, {"key": "b", "value": 2}])
        );

        store
            .apply(&EntityOperation::Delete {
                name: "carts".into(),
                key: "a".into(),
            })
            .unwrap();
        let missing = store
            .apply(&EntityOperation::Get {
                name: "carts".into(),
                key: "a".into(),
            })
            .unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[test]
    fn test_transact_applies_every_write() {
        let store = LocalEntityStore::new();
        store.set("stock", "apple", json!(3));

        store
            .apply(&EntityOperation::Transact {
                writes: vec![
                    EntityWrite::Delete {
                        entity: "stock".into(),
                        key: "apple".into(),
                    },
                    EntityWrite::Set {
                        entity: "orders".into(),
                        key: "1".into(),
                        value: json!("apple"),
                    },
                ],
            })
            .unwrap();

        assert_eq!(store.get("stock", "apple"), None);
        assert_eq!(store.get("orders", "1"), Some(json!("apple")));
    }
}
