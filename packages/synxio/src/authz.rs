//! Per-subscription authorization of the component tree.
//!
//! A component is visible to a session only if it and every ancestor up to
//! the root are authorized. Decisions are cached for the lifetime of one
//! subscription, keyed by component id and mount generation, so a
//! re-mounted component is asked about again with its new payload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::store::AppState;

/// What the authorizer sees of a component.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComponentInfo {
    pub name: String,
    pub payload: Value,
}

/// Decides which components a session may see.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    /// Opaque identity of one subscriber.
    type Session: Send + Sync + 'static;

    async fn authorize(&self, session: &Self::Session, component: &ComponentInfo) -> bool;
}

/// Authorizer that shows every component to everyone.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    type Session = ();

    async fn authorize(&self, _session: &(), _component: &ComponentInfo) -> bool {
        true
    }
}

/// Authorization decisions of one subscription.
pub(crate) struct AuthCache<A: Authorizer> {
    authorizer: Arc<A>,
    session: A::Session,
    decisions: HashMap<(String, u64), bool>,
}

impl<A: Authorizer> AuthCache<A> {
    pub(crate) fn new(authorizer: Arc<A>, session: A::Session) -> Self {
        Self {
            authorizer,
            session,
            decisions: HashMap::new(),
        }
    }

    async fn decide(&mut self, state: &AppState, id: &str) -> bool {
        let (Some(component), Some(meta)) = (state.components.get(id), state.metadata.get(id)) else {
            return false;
        };
        let key = (id.to_string(), meta.generation);
        if let Some(allowed) = self.decisions.get(&key) {
            return *allowed;
        }

        let info = ComponentInfo {
            name: component.name.clone(),
            payload: meta.payload.clone(),
        };
        let allowed = self.authorizer.authorize(&self.session, &info).await;
        debug!(component_id = %id, name = %info.name, allowed, "authorized component");
        self.decisions.insert(key, allowed);
        allowed
    }

    /// True if `id` and all of its ancestors are authorized.
    async fn visible(&mut self, state: &AppState, id: &str, seen: &mut HashMap<String, bool>) -> bool {
        let mut chain = Vec::new();
        let mut current = Some(id.to_string());
        let mut verdict = true;

        while let Some(next) = current.take() {
            if let Some(known) = seen.get(&next) {
                verdict = *known;
                break;
            }
            let Some(component) = state.components.get(&next) else {
                verdict = false;
                break;
            };
            if chain.len() > state.components.len() {
                verdict = false;
                break;
            }
            current = component.parent_id.clone();
            chain.push(next);
        }

        if verdict {
            // Root first, so a forbidden ancestor stops the walk before its
            // descendants are ever asked about.
            for ancestor in chain.iter().rev() {
                if !self.decide(state, ancestor).await {
                    verdict = false;
                    break;
                }
                seen.insert(ancestor.clone(), true);
            }
        }

        if !verdict {
            for member in &chain {
                seen.entry(member.clone()).or_insert(false);
            }
        }
        verdict
    }

    /// The component map as this session may see it.
    pub(crate) async fn render(&mut self, state: &AppState) -> Result<Value> {
        let mut seen = HashMap::new();
        let mut out = Map::new();

        for (id, component) in &state.components {
            let view = if self.visible(state, id, &mut seen).await {
                serde_json::to_value(component)?
            } else {
                json!({
                    "name": component.name,
                    "id": component.id,
                    "parentId": component.parent_id,
                    "status": "forbidden",
                })
            };
            out.insert(id.clone(), view);
        }
        Ok(Value::Object(out))
    }
}
