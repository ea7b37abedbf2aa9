//! Observer fan-out for document life-cycle events.
//!
//! Observers implement [`DocumentCallback`] and are invoked in
//! registration order. A failing or panicking observer is logged and
//! skipped; it never affects the caller or the remaining observers.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

use crate::context::DocumentContext;
use crate::manager::DocumentManager;

/// Result type for observer hooks.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Hooks fired by the document manager.
///
/// `on_document_changed` runs while the document's mutation lock is
/// held, so observers see changes in commit order. Observers must not
/// mutate or read the same document from inside that hook.
#[async_trait]
pub trait DocumentCallback: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// The manager has started.
    async fn on_initialized(&self, _manager: &Arc<DocumentManager>) -> CallbackResult {
        Ok(())
    }

    /// A document was loaded (or created) into memory.
    async fn on_document_loaded(&self, _ctx: &DocumentContext) -> CallbackResult {
        Ok(())
    }

    /// An update is about to be applied.
    async fn on_document_changing(&self, _ctx: &DocumentContext) -> CallbackResult {
        Ok(())
    }

    /// An update changed the document; `diff` is what the transaction integrated.
    async fn on_document_changed(&self, _ctx: &DocumentContext, _diff: &[u8]) -> CallbackResult {
        Ok(())
    }

    /// A client left, explicitly or by presence expiry.
    async fn on_client_disconnected(
        &self,
        _ctx: &DocumentContext,
        _last_clock: u64,
    ) -> CallbackResult {
        Ok(())
    }

    /// A client's presence is new or its clock advanced.
    async fn on_awareness_updated(
        &self,
        _ctx: &DocumentContext,
        _clock: u64,
        _state: Option<&str>,
    ) -> CallbackResult {
        Ok(())
    }
}

/// Ordered registry of [`DocumentCallback`] observers.
#[derive(Default)]
pub struct CallbackDispatcher {
    callbacks: RwLock<Vec<Arc<dyn DocumentCallback>>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Observers run in registration order.
    pub fn register(&self, callback: Arc<dyn DocumentCallback>) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn DocumentCallback>> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn initialized(&self, manager: &Arc<DocumentManager>) {
        for callback in self.snapshot() {
            isolate("initialized", callback.name(), callback.on_initialized(manager)).await;
        }
    }

    pub async fn document_loaded(&self, ctx: &DocumentContext) {
        for callback in self.snapshot() {
            isolate("document_loaded", callback.name(), callback.on_document_loaded(ctx)).await;
        }
    }

    pub async fn document_changing(&self, ctx: &DocumentContext) {
        for callback in self.snapshot() {
            isolate(
                "document_changing",
                callback.name(),
                callback.on_document_changing(ctx),
            )
            .await;
        }
    }

    pub async fn document_changed(&self, ctx: &DocumentContext, diff: &[u8]) {
        for callback in self.snapshot() {
            isolate(
                "document_changed",
                callback.name(),
                callback.on_document_changed(ctx, diff),
            )
            .await;
        }
    }

    pub async fn client_disconnected(&self, ctx: &DocumentContext, last_clock: u64) {
        for callback in self.snapshot() {
            isolate(
                "client_disconnected",
                callback.name(),
                callback.on_client_disconnected(ctx, last_clock),
            )
            .await;
        }
    }

    pub async fn awareness_updated(&self, ctx: &DocumentContext, clock: u64, state: Option<&str>) {
        for callback in self.snapshot() {
            isolate(
                "awareness_updated",
                callback.name(),
                callback.on_awareness_updated(ctx, clock, state),
            )
            .await;
        }
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("callback_count", &self.len())
            .finish()
    }
}

async fn isolate(event: &str, callback: &str, hook: impl Future<Output = CallbackResult>) {
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(callback, event, "Callback failed: {}", e),
        Err(_) => warn!(callback, event, "Callback panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DocumentCallback for Recorder {
        async fn on_document_changed(&self, ctx: &DocumentContext, diff: &[u8]) -> CallbackResult {
            self.log.lock().unwrap().push(format!(
                "{}:{}:{}",
                self.label,
                ctx.document_name,
                diff.len()
            ));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl DocumentCallback for Failing {
        async fn on_document_changed(&self, _ctx: &DocumentContext, _diff: &[u8]) -> CallbackResult {
            Err("boom".into())
        }
    }

    struct Panicking;

    #[async_trait]
    impl DocumentCallback for Panicking {
        async fn on_document_changed(&self, _ctx: &DocumentContext, _diff: &[u8]) -> CallbackResult {
            panic!("observer bug");
        }
    }

    #[tokio::test]
    async fn test_observers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = CallbackDispatcher::new();
        for label in ["first", "second", "third"] {
            dispatcher.register(Arc::new(Recorder {
                label,
                log: log.clone(),
            }));
        }

        dispatcher
            .document_changed(&DocumentContext::new("notes", 7), &[1, 2])
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:notes:2", "second:notes:2", "third:notes:2"]
        );
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = CallbackDispatcher::new();
        dispatcher.register(Arc::new(Failing));
        dispatcher.register(Arc::new(Panicking));
        dispatcher.register(Arc::new(Recorder {
            label: "survivor",
            log: log.clone(),
        }));

        dispatcher
            .document_changed(&DocumentContext::new("notes", 1), &[9])
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["survivor:notes:1"]);
    }

    #[tokio::test]
    async fn test_default_hooks_are_noops() {
        let dispatcher = CallbackDispatcher::new();
        dispatcher.register(Arc::new(Failing));
        assert_eq!(dispatcher.len(), 1);

        // Failing only overrides on_document_changed
        let ctx = DocumentContext::new("notes", 1);
        dispatcher.document_loaded(&ctx).await;
        dispatcher.client_disconnected(&ctx, 3).await;
        dispatcher.awareness_updated(&ctx, 1, None).await;
    }
}
