//! envwatch views: derived, read-only records built from live collections.
//!
//! Everything here is a pure function of its inputs. Views are rebuilt from
//! scratch whenever an input collection changes; they hold `Arc`s to the
//! resources they were built from and never mutate them.

#![forbid(unsafe_code)]

use std::sync::Arc;

use envwatch_core::{KindTag, Labels, Resource};
use serde::Serialize;

mod catalog;
mod combine;

pub use catalog::{find_view, Combine, ViewSpec, TRACKED};
pub use combine::{combine_controllers, deployment_views, exposing_services, plain, replica_views};

/// Label consulted by [`filter_by_space`].
pub const SPACE_LABEL: &str = "space";

/// A controller (Deployment-like or ReplicaSet-like) annotated with the services exposing it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ControllerView {
    pub name: String,
    pub controller: Arc<Resource>,
    pub services: Vec<Arc<Resource>>,
}

/// One row of a derived collection.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum ViewItem {
    Resource(Arc<Resource>),
    Controller(ControllerView),
}

impl ViewItem {
    pub fn name(&self) -> &str {
        match self {
            ViewItem::Resource(r) => &r.name,
            ViewItem::Controller(v) => &v.name,
        }
    }

    /// Kind of the primary resource.
    pub fn kind(&self) -> KindTag {
        match self {
            ViewItem::Resource(r) => r.kind,
            ViewItem::Controller(v) => v.controller.kind,
        }
    }

    pub fn labels(&self) -> &Labels {
        match self {
            ViewItem::Resource(r) => &r.labels,
            ViewItem::Controller(v) => &v.controller.labels,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels().iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Keep items without a `space` label or whose `space` label equals `label`.
/// `None` keeps everything.
pub fn filter_by_space(items: Vec<ViewItem>, label: Option<&str>) -> Vec<ViewItem> {
    let Some(label) = label else { return items };
    items
        .into_iter()
        .filter(|it| match it.label(SPACE_LABEL) {
            None | Some("") => true,
            Some(v) => v == label,
        })
        .collect()
}
