//! Typed state slots.
//!
//! A slot is a name plus a default. Values live in the component's
//! [`StateMap`] as JSON and are decoded on every read, so a slot can be
//! declared as a `const` next to the component that owns it:
//!
//! ```ignore
//! const KEY_POINTS: StateSlot<Vec<String>> = StateSlot::new("keyPoints", Vec::new);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{Result, SynxioError};
use crate::store::StateMap;

pub struct StateSlot<T> {
    name: &'static str,
    init: fn() -> T,
}

impl<T> StateSlot<T> {
    pub const fn new(name: &'static str, init: fn() -> T) -> Self {
        Self { name, init }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_value(&self) -> T {
        (self.init)()
    }
}

impl<T: Serialize + DeserializeOwned> StateSlot<T> {
    /// Decode the slot from `state`, falling back to the default.
    pub(crate) fn read(&self, state: &StateMap) -> Result<T> {
        match state.get(self.name) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|source| SynxioError::State {
                slot: self.name.to_string(),
                source,
            }),
            None => Ok(self.default_value()),
        }
    }

    pub(crate) fn write(&self, state: &mut StateMap, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value).map_err(|source| SynxioError::State {
            slot: self.name.to_string(),
            source,
        })?;
        state.insert(self.name.to_string(), encoded);
        Ok(())
    }
}

impl<T> Clone for StateSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateSlot<T> {}

impl<T> std::fmt::Debug for StateSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSlot").field("name", &self.name).finish()
    }
}

/// Builds the default state map a component is registered with.
#[derive(Debug, Default)]
pub struct InitialState {
    state: StateMap,
}

impl InitialState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot<T: Serialize + DeserializeOwned>(mut self, slot: &StateSlot<T>) -> Self {
        match serde_json::to_value(slot.default_value()) {
            Ok(value) => {
                self.state.insert(slot.name().to_string(), value);
            }
            Err(e) => warn!(slot = slot.name(), error = %e, "state slot default does not serialize"),
        }
        self
    }

    pub fn build(self) -> StateMap {
        self.state
    }
}

impl From<InitialState> for StateMap {
    fn from(initial: InitialState) -> Self {
        initial.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    const ITEMS: StateSlot<Vec<String>> = StateSlot::new("items", Vec::new);
    const TITLE: StateSlot<Option<String>> = StateSlot::new("title", || None);
    const LOADING: StateSlot<bool> = StateSlot::new("isLoading", || false);

    #[test]
    fn test_missing_slot_reads_default() {
        let state = StateMap::new();
        assert_eq!(ITEMS.read(&state).unwrap(), Vec::<String>::new());
        assert_eq!(TITLE.read(&state).unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let mut state = StateMap::new();
        ITEMS.write(&mut state, &vec!["a".to_string()]).unwrap();
        assert_eq!(state.get("items"), Some(&json!(["a"])));
        assert_eq!(ITEMS.read(&state).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_incompatible_value_is_state_error() {
        let mut state = StateMap::new();
        state.insert("isLoading".into(), json!("yes"));
        let err = LOADING.read(&state).unwrap_err();
        assert!(matches!(err, SynxioError::State { ref slot, .. } if slot == "isLoading"));
    }

    #[test]
    fn test_initial_state_collects_defaults() {
        let state = InitialState::new().slot(&ITEMS).slot(&TITLE).slot(&LOADING).build();
        assert_eq!(
            Value::Object(state),
            json!({"items": [], "title": null, "isLoading": false})
        );
    }
}
