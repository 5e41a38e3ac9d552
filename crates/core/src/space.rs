//! Spaces and the environments (namespaces) they deploy to.

use serde::{Deserialize, Serialize};

/// A named deployment target backed by one namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub order: i32,
}

/// A resolved space: its id plus its environments in display order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Space {
    pub id: String,
    pub environments: Vec<Environment>,
}

impl Space {
    pub fn new(id: impl Into<String>, mut environments: Vec<Environment>) -> Self {
        environments.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        Self { id: id.into(), environments }
    }
}
