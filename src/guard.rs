//! Client Guard - lifecycle coordinator
//!
//! Wires the status fetcher, enforcement state, overlay renderer and tamper
//! watcher together: poll on a schedule, reconcile the page on every state
//! change, and leave no trace after `shutdown`.

use crate::config::{ConfigError, GuardConfig};
use crate::dom::Dom;
use crate::enforcement::{BlockLevel, EnforcementState};
use crate::overlay_renderer::{OverlayContent, OverlayRenderer};
use crate::status_fetcher::StatusFetcher;
use crate::tamper_alerts::TamperAlertLog;
use crate::tamper_watcher::{RenderSnapshot, TamperWatcher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Activation errors
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Client guard must be activated inside a tokio runtime")]
    NoRuntime,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct GuardInner {
    renderer: OverlayRenderer,
    fetcher: StatusFetcher,
    state_tx: watch::Sender<EnforcementState>,
    content: Mutex<OverlayContent>,
    watcher: Mutex<Option<TamperWatcher>>,
    alerts: Arc<TamperAlertLog>,
    alive: AtomicBool,
    stop: Notify,
    runtime: Handle,
}

impl GuardInner {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn poll_once(&self) {
        if let Some(level) = self.fetcher.poll().await {
            self.apply(level);
        }
    }

    /// The only path by which the enforcement state changes
    fn apply(&self, level: BlockLevel) {
        // Response arrived after teardown
        if !self.is_alive() {
            debug!("Discarding opacity={:.3} after shutdown", level.value());
            return;
        }

        let next = EnforcementState::from_level(level);
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            info!(
                "Enforcement now opacity={:.3} critical={} ({:?})",
                next.opacity(),
                next.critical,
                next.tier()
            );
            self.reconcile();
        } else {
            self.reassert_scroll(next.critical);
        }
    }

    /// Put body overflow back to what `critical` demands, without a re-render
    fn reassert_scroll(&self, critical: bool) {
        let _serial = self.renderer.reconcile_lock();
        if !self.is_alive() {
            return;
        }

        let result = if critical {
            self.renderer.suppress_scroll()
        } else {
            self.renderer.restore_scroll()
        };
        if let Err(e) = result {
            error!("Scroll state refresh failed: {}", e);
        }
    }

    fn reconcile(&self) {
        let _serial = self.renderer.reconcile_lock();
        if !self.is_alive() {
            return;
        }

        let state = *self.state_tx.borrow();
        let content = lock(&self.content).clone();
        let mut watcher = lock(&self.watcher);

        // The old watcher restores stale content
        if let Some(previous) = watcher.take() {
            previous.disarm();
        }

        if let Err(e) = self.renderer.render(&state, &content) {
            error!("Overlay render failed: {}", e);
        }

        if !state.requires_overlay() {
            return;
        }

        let _runtime = self.runtime.enter();
        match TamperWatcher::arm(
            self.renderer.clone(),
            RenderSnapshot { state, content },
            self.alerts.clone(),
        ) {
            Ok(armed) => *watcher = Some(armed),
            Err(e) => error!("Tamper watcher could not arm: {}", e),
        }
    }
}

async fn poll_loop(inner: Arc<GuardInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.stop.notified() => break,
        }
        if !inner.is_alive() {
            break;
        }
        // An in-flight poll runs to completion; `apply` drops it after shutdown
        inner.poll_once().await;
    }

    debug!("Status schedule stopped");
}

/// An activated payment guard bound to one document
pub struct ClientGuard {
    inner: Arc<GuardInner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientGuard {
    /// Validate the config, then start polling immediately and every
    /// `poll_interval` thereafter.
    pub fn activate(config: GuardConfig, dom: Arc<dyn Dom>) -> Result<Self, GuardError> {
        let runtime = Handle::try_current().map_err(|_| GuardError::NoRuntime)?;
        config.validate()?;

        let fetcher = StatusFetcher::new(&config)?;
        let renderer = OverlayRenderer::new(dom);
        let (state_tx, _) = watch::channel(EnforcementState::default());

        let inner = Arc::new(GuardInner {
            renderer,
            fetcher,
            state_tx,
            content: Mutex::new(OverlayContent::new(config.heading.clone(), config.message.clone())),
            watcher: Mutex::new(None),
            alerts: Arc::new(TamperAlertLog::new()),
            alive: AtomicBool::new(true),
            stop: Notify::new(),
            runtime: runtime.clone(),
        });

        let task = runtime.spawn(poll_loop(inner.clone(), config.poll_interval()));

        info!(
            "🛡️  Client guard active for project {} (overlay {}, polling {} every {}s)",
            config.project_slug,
            inner.renderer.overlay_id(),
            inner.fetcher.url(),
            config.poll_interval_secs
        );

        Ok(Self {
            inner,
            poll_task: Mutex::new(Some(task)),
        })
    }

    /// Current enforcement snapshot
    pub fn state(&self) -> EnforcementState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_critical(&self) -> bool {
        self.state().critical
    }

    /// Reactive view of the enforcement state
    pub fn subscribe(&self) -> watch::Receiver<EnforcementState> {
        self.inner.state_tx.subscribe()
    }

    /// Session id of the overlay node
    pub fn overlay_id(&self) -> &str {
        self.inner.renderer.overlay_id()
    }

    pub fn tamper_alerts(&self) -> Arc<TamperAlertLog> {
        self.inner.alerts.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_alive()
    }

    /// Whether a tamper watcher currently guards the overlay
    pub fn is_armed(&self) -> bool {
        lock(&self.inner.watcher)
            .as_ref()
            .map_or(false, TamperWatcher::is_armed)
    }

    pub fn content(&self) -> OverlayContent {
        lock(&self.inner.content).clone()
    }

    /// Poll once now, outside the schedule
    pub async fn refresh(&self) {
        self.inner.poll_once().await;
    }

    /// Replace the panel text and re-render with it
    pub fn set_content(&self, heading: impl Into<String>, message: impl Into<String>) {
        let next = OverlayContent::new(heading, message);
        {
            let mut content = lock(&self.inner.content);
            if *content == next {
                return;
            }
            *content = next;
        }

        if self.state().requires_overlay() {
            self.inner.reconcile();
        }
    }

    /// Stop polling, disarm the watcher, remove the overlay and give
    /// scrolling back. Runs once; later calls do nothing.
    pub fn shutdown(&self) {
        if !self.inner.alive.swap(false, Ordering::AcqRel) {
            return;
        }

        self.inner.stop.notify_one();
        // Detach: the loop exits on its own once any in-flight poll returns
        drop(lock(&self.poll_task).take());

        let _serial = self.inner.renderer.reconcile_lock();
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.disarm();
        }
        if let Err(e) = self.inner.renderer.remove() {
            error!("Overlay removal failed during shutdown: {}", e);
        }
        if let Err(e) = self.inner.renderer.restore_scroll() {
            error!("Scroll restore failed during shutdown: {}", e);
        }

        info!("Client guard stopped");
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MemoryDocument;

    fn config() -> GuardConfig {
        // Nothing listens here: scheduled polls fail and change nothing
        GuardConfig::new("key", "acme", "Payment overdue", "Contact your developer.")
            .with_api_url("http://127.0.0.1:9/api")
    }

    fn level(value: f64) -> BlockLevel {
        BlockLevel::new(value).unwrap()
    }

    fn activate() -> (Arc<MemoryDocument>, ClientGuard) {
        let doc = Arc::new(MemoryDocument::new());
        let guard = ClientGuard::activate(config(), doc.clone()).unwrap();
        (doc, guard)
    }

    #[test]
    fn test_activation_requires_runtime() {
        let doc = Arc::new(MemoryDocument::new());
        let result = ClientGuard::activate(config(), doc);
        assert!(matches!(result, Err(GuardError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_activation_rejects_invalid_config() {
        let doc = Arc::new(MemoryDocument::new());
        let mut bad = config();
        bad.api_key.clear();
        let result = ClientGuard::activate(bad, doc);
        assert!(matches!(result, Err(GuardError::Config(ConfigError::MissingApiKey))));
    }

    #[tokio::test]
    async fn test_starts_clear() {
        let (doc, guard) = activate();
        assert_eq!(guard.state(), EnforcementState::default());
        assert!(!guard.is_armed());
        assert!(doc.get_element_by_id(guard.overlay_id()).is_none());
    }

    #[tokio::test]
    async fn test_state_change_renders_and_arms() {
        let (doc, guard) = activate();
        let mut rx = guard.subscribe();

        guard.inner.apply(level(0.5));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().opacity(), 0.5);
        assert!(guard.is_armed());
        assert_eq!(doc.count_elements_with_id(guard.overlay_id()), 1);
        assert_eq!(doc.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_identical_level_is_not_republished() {
        let (_doc, guard) = activate();
        guard.inner.apply(level(0.3));

        let mut rx = guard.subscribe();
        guard.inner.apply(level(0.3));
        assert!(!rx.has_changed().unwrap());
        rx.borrow_and_update();

        guard.inner.apply(level(0.9));
        assert!(rx.has_changed().unwrap());
        assert!(guard.is_critical());
    }

    #[tokio::test]
    async fn test_identical_level_reasserts_scroll() {
        let (doc, guard) = activate();
        guard.inner.apply(level(0.9));
        let mut rx = guard.subscribe();

        doc.set_style(doc.body(), "overflow", "scroll").unwrap();
        guard.inner.apply(level(0.9));

        assert!(!rx.has_changed().unwrap());
        assert_eq!(doc.style(doc.body(), "overflow").as_deref(), Some("hidden"));
        assert_eq!(doc.count_elements_with_id(guard.overlay_id()), 1);
    }

    #[tokio::test]
    async fn test_dropping_to_zero_disarms_and_removes() {
        let (doc, guard) = activate();
        guard.inner.apply(level(0.9));
        assert_eq!(doc.style(doc.body(), "overflow").as_deref(), Some("hidden"));

        guard.inner.apply(level(0.0));

        assert!(!guard.is_armed());
        assert_eq!(doc.observer_count(), 0);
        assert!(doc.get_element_by_id(guard.overlay_id()).is_none());
        assert_eq!(doc.style(doc.body(), "overflow"), None);
    }

    #[tokio::test]
    async fn test_rearm_keeps_single_observer() {
        let (doc, guard) = activate();
        for value in [0.2, 0.5, 0.85, 0.4] {
            guard.inner.apply(level(value));
            assert_eq!(doc.observer_count(), 1);
            assert_eq!(doc.count_elements_with_id(guard.overlay_id()), 1);
        }
    }

    #[tokio::test]
    async fn test_set_content_rerenders() {
        let (doc, guard) = activate();
        guard.inner.apply(level(0.5));

        guard.set_content("Invoice 42 unpaid", "Site paused.");

        let node = doc.get_element_by_id(guard.overlay_id()).unwrap();
        let markup = doc.inner_html(node).unwrap();
        assert!(markup.contains("Invoice 42 unpaid"));
        assert!(markup.contains("Site paused."));
        assert!(guard.is_armed());
        assert_eq!(guard.content().heading, "Invoice 42 unpaid");
    }

    #[tokio::test]
    async fn test_shutdown_leaves_no_trace() {
        let (doc, guard) = activate();
        guard.inner.apply(level(0.95));

        guard.shutdown();
        guard.shutdown();

        assert!(!guard.is_active());
        assert!(!guard.is_armed());
        assert_eq!(doc.observer_count(), 0);
        assert_eq!(doc.count_elements_with_id(guard.overlay_id()), 0);
        assert_eq!(doc.style(doc.body(), "overflow"), None);

        // Late responses are ignored
        guard.inner.apply(level(0.5));
        assert!(guard.is_critical());
        assert_eq!(doc.count_elements_with_id(guard.overlay_id()), 0);
    }
}
