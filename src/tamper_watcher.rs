//! Tamper Watcher - self-healing reaction to overlay interference
//!
//! Observes the body for child-list changes and `style`/`class` writes.
//! A batch that removes or hides the overlay triggers an immediate re-render
//! from the snapshot the watcher was armed with, plus a scroll lock.

use crate::dom::{Dom, DomError, MutationRecord, MutationSubscription, NodeId, ObserveOptions, ObserverId};
use crate::enforcement::EnforcementState;
use crate::overlay_renderer::{OverlayContent, OverlayRenderer};
use crate::tamper_alerts::TamperAlertLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Classification of one observed mutation batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperEvent {
    /// The overlay node was taken out of the page
    NodeRemoved,
    /// The overlay's inline style hides it
    NodeHidden,
    /// Nothing to react to
    Benign,
}

impl TamperEvent {
    pub fn is_tampering(self) -> bool {
        self != TamperEvent::Benign
    }
}

/// Observation scope used while armed
pub fn watch_options() -> ObserveOptions {
    ObserveOptions {
        child_list: true,
        attributes: true,
        subtree: true,
        attribute_filter: Some(vec!["style".to_string(), "class".to_string()]),
    }
}

fn is_hidden(dom: &dyn Dom, node: NodeId) -> bool {
    let display_none = dom.style(node, "display").as_deref() == Some("none");
    let transparent = dom
        .style(node, "opacity")
        .and_then(|v| v.parse::<f64>().ok())
        .map_or(false, |v| v == 0.0);
    let invisible = dom.style(node, "visibility").as_deref() == Some("hidden");

    display_none || transparent || invisible
}

/// Decide whether a batch amounts to tampering with `overlay_id`
pub fn classify(dom: &dyn Dom, overlay_id: &str, batch: &[MutationRecord]) -> TamperEvent {
    let overlay = dom.get_element_by_id(overlay_id);
    let mut verdict = TamperEvent::Benign;

    for record in batch {
        let removed_overlay = record
            .removed_nodes
            .iter()
            .any(|n| dom.element_id(*n).as_deref() == Some(overlay_id));
        if removed_overlay {
            return TamperEvent::NodeRemoved;
        }

        if Some(record.target) == overlay && is_hidden(dom, record.target) {
            verdict = TamperEvent::NodeHidden;
        }
    }

    verdict
}

/// What the watcher restores when it detects tampering
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSnapshot {
    pub state: EnforcementState,
    pub content: OverlayContent,
}

struct Responder {
    renderer: OverlayRenderer,
    snapshot: RenderSnapshot,
    alerts: Arc<TamperAlertLog>,
    armed: Arc<AtomicBool>,
}

impl Responder {
    fn handle_batch(&self, batch: &[MutationRecord]) -> TamperEvent {
        let _serial = self.renderer.reconcile_lock();

        // Disarmed while the batch was queued
        if !self.armed.load(Ordering::Acquire) {
            return TamperEvent::Benign;
        }

        let event = classify(
            self.renderer.dom().as_ref(),
            self.renderer.overlay_id(),
            batch,
        );
        if !event.is_tampering() {
            return event;
        }

        self.alerts.emit(
            event,
            self.renderer.overlay_id(),
            self.snapshot.state.opacity(),
        );

        if let Err(e) = self
            .renderer
            .render(&self.snapshot.state, &self.snapshot.content)
        {
            error!("Overlay restore failed: {}", e);
        }

        // Punitive: lock scrolling even below the critical level
        if let Err(e) = self.renderer.suppress_scroll() {
            error!("Scroll lock failed: {}", e);
        }

        event
    }
}

/// Armed observer over the document body
pub struct TamperWatcher {
    dom: Arc<dyn Dom>,
    observer: ObserverId,
    armed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TamperWatcher {
    /// Subscribe to body mutations and start reacting. Needs a tokio runtime.
    pub fn arm(
        renderer: OverlayRenderer,
        snapshot: RenderSnapshot,
        alerts: Arc<TamperAlertLog>,
    ) -> Result<Self, DomError> {
        let dom = renderer.dom().clone();
        let MutationSubscription { id, mut records } = dom.observe(dom.body(), watch_options())?;
        let armed = Arc::new(AtomicBool::new(true));

        debug!(
            "Tamper watcher armed for {} at opacity={:.2}",
            renderer.overlay_id(),
            snapshot.state.opacity()
        );

        let responder = Responder {
            renderer,
            snapshot,
            alerts,
            armed: armed.clone(),
        };

        let task = tokio::spawn(async move {
            while let Some(batch) = records.recv().await {
                responder.handle_batch(&batch);
            }
        });

        Ok(Self {
            dom,
            observer: id,
            armed,
            task,
        })
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Stop observing. Safe to call more than once.
    pub fn disarm(&self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            self.dom.disconnect(self.observer);
            self.task.abort();
            debug!("Tamper watcher disarmed");
        }
    }
}

impl Drop for TamperWatcher {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MemoryDocument;
    use crate::enforcement::BlockLevel;
    use crate::tamper_alerts::AlertPriority;
    use std::time::Duration;

    const OVERLAY: &str = "guard-test123";

    fn snapshot(value: f64) -> RenderSnapshot {
        RenderSnapshot {
            state: EnforcementState::from_level(BlockLevel::new(value).unwrap()),
            content: OverlayContent::new("Overdue", "Pay up"),
        }
    }

    fn mounted(value: f64) -> (Arc<MemoryDocument>, OverlayRenderer) {
        let doc = Arc::new(MemoryDocument::new());
        let renderer = OverlayRenderer::with_id(doc.clone(), OVERLAY);
        let snap = snapshot(value);
        renderer.render(&snap.state, &snap.content).unwrap();
        (doc, renderer)
    }

    fn observed(doc: &MemoryDocument, act: impl FnOnce()) -> Vec<MutationRecord> {
        let mut sub = doc.observe(doc.body(), watch_options()).unwrap();
        act();
        let mut out = Vec::new();
        while let Ok(batch) = sub.records.try_recv() {
            out.extend(batch);
        }
        doc.disconnect(sub.id);
        out
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    #[test]
    fn test_classify_removal() {
        let (doc, renderer) = mounted(0.5);
        let node = renderer.overlay_node().unwrap();

        let batch = observed(&doc, || doc.remove(node).unwrap());
        assert_eq!(classify(&*doc, OVERLAY, &batch), TamperEvent::NodeRemoved);
    }

    #[test]
    fn test_classify_hiding_vectors() {
        for (property, value) in [("display", "none"), ("opacity", "0"), ("visibility", "hidden")] {
            let (doc, renderer) = mounted(0.5);
            let node = renderer.overlay_node().unwrap();

            let batch = observed(&doc, || doc.set_style(node, property, value).unwrap());
            assert_eq!(
                classify(&*doc, OVERLAY, &batch),
                TamperEvent::NodeHidden,
                "{}: {} not detected",
                property,
                value
            );
        }
    }

    #[test]
    fn test_classify_benign_changes() {
        let (doc, renderer) = mounted(0.5);
        let node = renderer.overlay_node().unwrap();
        let other = doc.create_element("div");

        let batch = observed(&doc, || {
            doc.append_child(doc.body(), other).unwrap();
            doc.set_style(other, "display", "none").unwrap();
            doc.remove(other).unwrap();
            doc.set_attribute(node, "class", "whatever").unwrap();
            doc.set_style(node, "opacity", "0.5").unwrap();
        });

        assert!(!batch.is_empty());
        assert_eq!(classify(&*doc, OVERLAY, &batch), TamperEvent::Benign);
    }

    #[tokio::test]
    async fn test_restores_removed_overlay() {
        let (doc, renderer) = mounted(0.5);
        let alerts = Arc::new(TamperAlertLog::new());
        let watcher = TamperWatcher::arm(renderer.clone(), snapshot(0.5), alerts.clone()).unwrap();

        let original = renderer.overlay_node().unwrap();
        doc.remove(original).unwrap();

        assert!(wait_until(|| renderer.overlay_node().is_some()).await);
        assert_eq!(doc.count_elements_with_id(OVERLAY), 1);
        assert_eq!(doc.style(doc.body(), "overflow").as_deref(), Some("hidden"));
        assert_eq!(alerts.count_by_priority(AlertPriority::Critical), 1);

        watcher.disarm();
    }

    #[tokio::test]
    async fn test_restores_hidden_overlay_in_place() {
        let (doc, renderer) = mounted(0.5);
        let alerts = Arc::new(TamperAlertLog::new());
        let _watcher = TamperWatcher::arm(renderer.clone(), snapshot(0.5), alerts.clone()).unwrap();

        let node = renderer.overlay_node().unwrap();
        doc.set_attribute(node, "style", "display: none").unwrap();

        assert!(wait_until(|| doc.style(node, "display").as_deref() == Some("flex")).await);
        assert_eq!(renderer.overlay_node(), Some(node));
        assert_eq!(alerts.count_by_priority(AlertPriority::Warning), 1);
    }

    #[tokio::test]
    async fn test_disarmed_watcher_ignores_tampering() {
        let (doc, renderer) = mounted(0.5);
        let alerts = Arc::new(TamperAlertLog::new());
        let watcher = TamperWatcher::arm(renderer.clone(), snapshot(0.5), alerts.clone()).unwrap();

        watcher.disarm();
        watcher.disarm();
        assert!(!watcher.is_armed());
        assert_eq!(doc.observer_count(), 0);

        doc.remove(renderer.overlay_node().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(renderer.overlay_node().is_none());
        assert_eq!(alerts.total_count(), 0);
    }
}
