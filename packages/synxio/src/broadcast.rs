//! Debounced change feed over the live tree.
//!
//! ```text
//! StateStore (watch) ──► wait for change ──► trailing debounce ──► distinct ──► watch<Arc<AppState>>
//! ```
//!
//! The output channel only ever holds the latest value, so a slow
//! subscriber skips intermediate states but never sees an older one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::store::{AppState, StateStore};

/// Spawn the broadcaster on `tracker`. It stops when `shutdown` is
/// cancelled or the store is dropped.
pub(crate) fn spawn(
    store: &StateStore,
    debounce: Duration,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) -> watch::Receiver<Arc<AppState>> {
    let mut source = store.subscribe();
    let initial = Arc::new(source.borrow_and_update().clone());
    let (sender, receiver) = watch::channel(initial);

    tracker.spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = source.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let mut closed = false;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    quiet = tokio::time::timeout(debounce, source.changed()) => match quiet {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }
            }

            let next = source.borrow_and_update().clone();
            let published = sender.send_if_modified(|current| {
                if **current == next {
                    return false;
                }
                *current = Arc::new(next);
                true
            });
            if published {
                debug!(
                    components = sender.borrow().components.len(),
                    "state change broadcast"
                );
            }

            if closed {
                break;
            }
        }
        debug!("change broadcaster stopped");
    });

    receiver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MountInfo;
    use crate::store::StateMap;
    use serde_json::json;
    use tokio::time::Instant;

    fn setup() -> (StateStore, String, CancellationToken, TaskTracker) {
        let store = StateStore::new();
        let root = MountInfo::root("Root");
        store.register(&root, StateMap::new(), json!({}));
        (store, root.id(), CancellationToken::new(), TaskTracker::new())
    }

    fn set_count(store: &StateStore, id: &str, count: u32) {
        store
            .update_state(id, |state| {
                state.insert("count".into(), json!(count));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bursts_are_coalesced() {
        let (store, id, shutdown, tracker) = setup();
        let mut changes = spawn(&store, Duration::from_millis(20), shutdown.clone(), &tracker);
        changes.borrow_and_update();

        let started = Instant::now();
        for count in 1..=5 {
            set_count(&store, &id, count);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        changes.changed().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
        let latest = changes.borrow_and_update().clone();
        assert_eq!(latest.components[&id].state["count"], json!(5));

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_that_revert_are_not_broadcast() {
        let (store, id, shutdown, tracker) = setup();
        let mut changes = spawn(&store, Duration::from_millis(20), shutdown.clone(), &tracker);
        changes.borrow_and_update();

        set_count(&store, &id, 1);
        store
            .update_state(&id, |state| {
                state.remove("count");
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!changes.has_changed().unwrap());

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_shutdown() {
        let (store, _id, shutdown, tracker) = setup();
        let mut changes = spawn(&store, Duration::from_millis(20), shutdown.clone(), &tracker);

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;

        assert!(changes.changed().await.is_err());
    }
}
