//! The live component tree.
//!
//! One `watch` channel holds the whole [`AppState`]. Every mutation goes
//! through `send_modify`/`send_if_modified`, so the tree has exactly one
//! writer path and observers always see a consistent value.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Result, SynxioError};
use crate::identity::MountInfo;

/// State slots of one component, keyed by slot name.
pub type StateMap = serde_json::Map<String, Value>;

/// Authoritative lifecycle status of a component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Running,
    Completed,
    Failed,
}

/// Child reference published under a property of the parent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildRef {
    One(String),
    Many(Vec<String>),
}

/// Published state of a single component instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentState {
    pub name: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub status: ComponentStatus,
    pub state: StateMap,
    /// Property -> endpoint id of the currently open endpoints.
    pub endpoints: BTreeMap<String, String>,
    pub components: BTreeMap<String, ChildRef>,
}

/// Runtime bookkeeping that is never published.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentMeta {
    /// Generation of the mount that registered this entry.
    pub generation: u64,
    /// Payload the component was mounted with, shown to the authorizer.
    pub payload: Value,
    /// Property of the parent the component is linked under.
    pub property: Option<String>,
}

/// Owner of an open endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenEndpoint {
    pub component_id: String,
    pub property: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppState {
    /// Last generation handed out. Never reused within an instance.
    pub generation: u64,
    pub components: BTreeMap<String, ComponentState>,
    pub open_endpoints: BTreeMap<String, OpenEndpoint>,
    pub metadata: BTreeMap<String, ComponentMeta>,
}

impl AppState {
    pub fn component(&self, id: &str) -> Option<&ComponentState> {
        self.components.get(id)
    }

    /// Ids of `id` and everything below it, parents first.
    fn subtree(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut pending = vec![id.to_string()];
        while let Some(next) = pending.pop() {
            if let Some(component) = self.components.get(&next) {
                for child in component.components.values() {
                    match child {
                        ChildRef::One(child_id) => pending.push(child_id.clone()),
                        ChildRef::Many(ids) => pending.extend(ids.iter().cloned()),
                    }
                }
            }
            out.push(next);
        }
        out
    }
}

/// Shared handle on the live tree.
#[derive(Clone)]
pub struct StateStore {
    sender: Arc<watch::Sender<AppState>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(AppState::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> AppState {
        self.sender.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&AppState) -> R) -> R {
        f(&self.sender.borrow())
    }

    pub fn component(&self, id: &str) -> Option<ComponentState> {
        self.read(|state| state.components.get(id).cloned())
    }

    /// Register a running instance and link it into its parent.
    ///
    /// Returns the generation assigned to this mount.
    pub(crate) fn register(&self, mount: &MountInfo, initial: StateMap, payload: Value) -> u64 {
        let id = mount.id();
        let mut generation = 0;

        self.sender.send_modify(|state| {
            state.generation += 1;
            generation = state.generation;

            state.components.insert(
                id.clone(),
                ComponentState {
                    name: mount.name().to_string(),
                    id: id.clone(),
                    parent_id: mount.parent_id().map(str::to_string),
                    status: ComponentStatus::Running,
                    state: initial,
                    endpoints: BTreeMap::new(),
                    components: BTreeMap::new(),
                },
            );
            state.metadata.insert(
                id.clone(),
                ComponentMeta {
                    generation,
                    payload,
                    property: mount.property().map(str::to_string),
                },
            );

            if let (Some(parent_id), Some(property)) = (mount.parent_id(), mount.property()) {
                if let Some(parent) = state.components.get_mut(parent_id) {
                    if mount.is_list() {
                        let entry = parent
                            .components
                            .entry(property.to_string())
                            .or_insert_with(|| ChildRef::Many(Vec::new()));
                        match entry {
                            ChildRef::Many(ids) => {
                                if !ids.contains(&id) {
                                    ids.push(id.clone());
                                }
                            }
                            ChildRef::One(_) => *entry = ChildRef::Many(vec![id.clone()]),
                        }
                    } else {
                        parent
                            .components
                            .insert(property.to_string(), ChildRef::One(id.clone()));
                    }
                }
            }
        });

        generation
    }

    /// Remove an instance (and anything still below it) from the tree.
    pub(crate) fn deregister(&self, id: &str) {
        self.sender.send_if_modified(|state| {
            let Some(component) = state.components.get(id) else {
                return false;
            };
            let parent_id = component.parent_id.clone();
            let property = state.metadata.get(id).and_then(|meta| meta.property.clone());

            if let (Some(parent_id), Some(property)) = (parent_id, property) {
                if let Some(parent) = state.components.get_mut(&parent_id) {
                    let emptied = match parent.components.get_mut(&property) {
                        Some(ChildRef::One(child)) => child == id,
                        Some(ChildRef::Many(ids)) => {
                            ids.retain(|child| child != id);
                            ids.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        parent.components.remove(&property);
                    }
                }
            }

            for removed in state.subtree(id) {
                state.components.remove(&removed);
                state.metadata.remove(&removed);
                state
                    .open_endpoints
                    .retain(|_, open| open.component_id != removed);
            }
            true
        });
    }

    /// Move a running instance to a terminal status.
    ///
    /// Returns false if the id is unknown or no longer running.
    pub(crate) fn set_status(&self, id: &str, status: ComponentStatus) -> bool {
        self.sender.send_if_modified(|state| match state.components.get_mut(id) {
            Some(component) if component.status == ComponentStatus::Running => {
                component.status = status;
                true
            }
            _ => false,
        })
    }

    /// Apply `f` to a component's state map. Observers are notified only if
    /// the map actually changed.
    pub(crate) fn update_state<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut StateMap) -> Result<R>,
    ) -> Result<R> {
        let mut outcome = None;
        self.sender.send_if_modified(|state| {
            let Some(component) = state.components.get_mut(id) else {
                return false;
            };
            let before = component.state.clone();
            let result = f(&mut component.state);
            if result.is_err() {
                component.state = before;
                outcome = Some(result);
                return false;
            }
            outcome = Some(result);
            component.state != before
        });

        outcome.unwrap_or_else(|| {
            Err(SynxioError::ComponentNotFound { id: id.to_string() })
        })
    }

    pub(crate) fn open_endpoint(&self, component_id: &str, property: &str, endpoint_id: &str) {
        self.sender.send_modify(|state| {
            if let Some(component) = state.components.get_mut(component_id) {
                component
                    .endpoints
                    .insert(property.to_string(), endpoint_id.to_string());
            }
            state.open_endpoints.insert(
                endpoint_id.to_string(),
                OpenEndpoint {
                    component_id: component_id.to_string(),
                    property: property.to_string(),
                },
            );
        });
    }

    /// Drop an endpoint from the published state. A newer endpoint opened
    /// under the same property is left in place.
    pub(crate) fn close_endpoint(&self, endpoint_id: &str) {
        self.sender.send_if_modified(|state| {
            let Some(open) = state.open_endpoints.remove(endpoint_id) else {
                return false;
            };
            if let Some(component) = state.components.get_mut(&open.component_id) {
                if component.endpoints.get(&open.property).map(String::as_str) == Some(endpoint_id) {
                    component.endpoints.remove(&open.property);
                }
            }
            true
        });
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let components = self.read(|state| state.components.len());
        f.debug_struct("StateStore")
            .field("components", &components)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> MountInfo {
        MountInfo::root("Root")
    }

    fn list_child(key: &str) -> MountInfo {
        let root = root();
        MountInfo::List {
            parent_id: root.id(),
            parent_path: root.path(),
            property: "Items".into(),
            name: "Item".into(),
            key: key.into(),
        }
    }

    #[test]
    fn test_register_links_list_children_without_duplicates() {
        let store = StateStore::new();
        store.register(&root(), StateMap::new(), json!({}));
        store.register(&list_child("a"), StateMap::new(), json!({}));
        store.register(&list_child("b"), StateMap::new(), json!({}));
        let generation = store.register(&list_child("a"), StateMap::new(), json!({}));

        assert_eq!(generation, 4);
        let parent = store.component(&root().id()).unwrap();
        assert_eq!(
            parent.components.get("Items"),
            Some(&ChildRef::Many(vec![list_child("a").id(), list_child("b").id()]))
        );
    }

    #[test]
    fn test_deregister_unlinks_from_parent() {
        let store = StateStore::new();
        store.register(&root(), StateMap::new(), json!({}));
        store.register(&list_child("a"), StateMap::new(), json!({}));

        store.deregister(&list_child("a").id());

        let state = store.snapshot();
        assert_eq!(state.components.len(), 1);
        assert!(state.components[&root().id()].components.is_empty());
        assert!(!state.metadata.contains_key(&list_child("a").id()));
    }

    #[test]
    fn test_status_only_leaves_running_once() {
        let store = StateStore::new();
        let id = root().id();
        store.register(&root(), StateMap::new(), json!({}));

        assert!(store.set_status(&id, ComponentStatus::Completed));
        assert!(!store.set_status(&id, ComponentStatus::Failed));
        assert_eq!(store.component(&id).unwrap().status, ComponentStatus::Completed);
    }

    #[test]
    fn test_unchanged_state_does_not_notify() {
        let store = StateStore::new();
        let id = root().id();
        store.register(&root(), StateMap::new(), json!({}));
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        store
            .update_state(&id, |state| {
                state.insert("count".into(), json!(1));
                Ok(())
            })
            .unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        store
            .update_state(&id, |state| {
                state.insert("count".into(), json!(1));
                Ok(())
            })
            .unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_update_unknown_component() {
        let store = StateStore::new();
        let result = store.update_state("missing", |_| Ok(()));
        assert!(matches!(result, Err(SynxioError::ComponentNotFound { .. })));
    }

    #[test]
    fn test_endpoint_publish_and_close() {
        let store = StateStore::new();
        let id = root().id();
        store.register(&root(), StateMap::new(), json!({}));

        store.open_endpoint(&id, "message", "e1");
        store.open_endpoint(&id, "message", "e2");
        store.close_endpoint("e1");

        let state = store.snapshot();
        assert_eq!(state.components[&id].endpoints.get("message"), Some(&"e2".to_string()));
        assert!(state.open_endpoints.contains_key("e2"));
        assert!(!state.open_endpoints.contains_key("e1"));
    }

    #[test]
    fn test_component_state_serializes_camel_case() {
        let store = StateStore::new();
        store.register(&root(), StateMap::new(), json!({}));
        let value = serde_json::to_value(store.component(&root().id()).unwrap()).unwrap();

        assert_eq!(value["parentId"], Value::Null);
        assert_eq!(value["status"], "running");
        assert_eq!(value["name"], "Root");
    }
}
