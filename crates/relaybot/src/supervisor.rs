use std::collections::HashMap;
use std::sync::Mutex;

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::util::lock_mutex;

#[derive(Debug)]
struct CancelHandle {
    token: CancellationToken,
    active_stage: Option<AbortHandle>,
    cancellable: bool,
}

/// In-flight cancellation handles, one per item being processed.
///
/// Created at process start and cleared at shutdown. Each entry is written
/// only by the orchestrator that owns the item; cancellation requests come
/// from the chat side.
#[derive(Debug, Default)]
pub struct Supervisor {
    handles: Mutex<HashMap<String, CancelHandle>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_handles<R>(&self, f: impl FnOnce(&mut HashMap<String, CancelHandle>) -> R) -> R {
        f(&mut lock_mutex(&self.handles))
    }

    pub fn register(&self, item_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.with_handles(|h| {
            h.insert(
                item_id.to_string(),
                CancelHandle {
                    token: token.clone(),
                    active_stage: None,
                    cancellable: true,
                },
            )
        });
        if previous.is_some() {
            warn!("replaced an existing cancellation handle for item {item_id}");
        }
        token
    }

    /// Publishes the task of the stage that is running now.
    pub fn set_active_stage(&self, item_id: &str, stage: AbortHandle) {
        self.with_handles(|h| {
            if let Some(handle) = h.get_mut(item_id) {
                handle.active_stage = Some(stage);
            }
        });
    }

    pub fn clear_active_stage(&self, item_id: &str) {
        self.with_handles(|h| {
            if let Some(handle) = h.get_mut(item_id) {
                handle.active_stage = None;
            }
        });
    }

    /// Ends the cancellable phase; later requests are ignored. Returns false
    /// when a cancellation was accepted first, so the caller must still honour it.
    pub fn close_cancellation(&self, item_id: &str) -> bool {
        self.with_handles(|h| match h.get_mut(item_id) {
            Some(handle) => {
                handle.cancellable = false;
                !handle.token.is_cancelled()
            }
            None => false,
        })
    }

    /// Signals cancellation and interrupts the active stage.
    /// Returns false when the item is unknown or past its cancellable phase.
    pub fn cancel(&self, item_id: &str) -> bool {
        self.with_handles(|h| match h.get_mut(item_id) {
            Some(handle) if handle.cancellable => {
                handle.token.cancel();
                if let Some(stage) = handle.active_stage.take() {
                    stage.abort();
                }
                info!("cancellation requested for item {item_id}");
                true
            }
            Some(_) => {
                debug!("ignoring cancellation for item {item_id}: not cancellable anymore");
                false
            }
            None => false,
        })
    }

    pub fn remove(&self, item_id: &str) {
        self.with_handles(|h| h.remove(item_id));
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.with_handles(|h| h.contains_key(item_id))
    }

    pub fn in_flight(&self) -> usize {
        self.with_handles(|h| h.len())
    }

    /// Signals every item, including those past their cancellable phase.
    /// Handles stay registered until their orchestrators remove them.
    pub fn cancel_all(&self) -> usize {
        self.with_handles(|h| {
            for handle in h.values_mut() {
                handle.token.cancel();
                if let Some(stage) = handle.active_stage.take() {
                    stage.abort();
                }
            }
            h.len()
        })
    }

    /// Cancels every item and forgets all handles.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.with_handles(|h| h.drain().collect());
        for (item_id, handle) in drained {
            handle.token.cancel();
            if let Some(stage) = handle.active_stage {
                stage.abort();
            }
            debug!("cancelled item {item_id} on shutdown");
        }
    }
}
