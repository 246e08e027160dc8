//! Tamper Alert Log - prioritized record of detected interference
//!
//! Every tampering the watcher reacts to lands here, newest last.

use crate::tamper_watcher::TamperEvent;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

/// Alert priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertPriority {
    /// P0: overlay node was removed from the page
    Critical = 0,
    /// P1: overlay node was hidden in place
    Warning = 1,
}

/// One detected tampering
#[derive(Clone, Debug)]
pub struct TamperAlert {
    pub timestamp: DateTime<Utc>,
    pub priority: AlertPriority,
    pub event: TamperEvent,
    pub overlay_id: String,
    pub block_level: f64,
}

impl TamperAlert {
    /// `None` for batches that were not tampering
    fn from_event(event: TamperEvent, overlay_id: &str, block_level: f64) -> Option<Self> {
        let priority = match event {
            TamperEvent::NodeRemoved => AlertPriority::Critical,
            TamperEvent::NodeHidden => AlertPriority::Warning,
            TamperEvent::Benign => return None,
        };

        Some(Self {
            timestamp: Utc::now(),
            priority,
            event,
            overlay_id: overlay_id.to_string(),
            block_level,
        })
    }
}

/// Bounded tamper alert store
pub struct TamperAlertLog {
    alerts: Mutex<Vec<TamperAlert>>,
    max_alerts: usize,
}

impl TamperAlertLog {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create with custom capacity
    pub fn with_capacity(max_alerts: usize) -> Self {
        Self {
            alerts: Mutex::new(Vec::with_capacity(max_alerts.min(1000))),
            max_alerts: max_alerts.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TamperAlert>> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a detection. Benign events are not stored.
    pub fn emit(&self, event: TamperEvent, overlay_id: &str, block_level: f64) {
        let Some(alert) = TamperAlert::from_event(event, overlay_id, block_level) else {
            return;
        };

        match alert.priority {
            AlertPriority::Critical => {
                error!(
                    "🚨 P0 TAMPERING: overlay {} removed at opacity={:.2}, restoring",
                    alert.overlay_id, alert.block_level
                );
            }
            AlertPriority::Warning => {
                warn!(
                    "⚠️  P1 TAMPERING: overlay {} hidden at opacity={:.2}, restoring",
                    alert.overlay_id, alert.block_level
                );
            }
        }

        let mut alerts = self.lock();

        // FIFO eviction
        if alerts.len() >= self.max_alerts {
            alerts.remove(0);
        }

        alerts.push(alert);
    }

    pub fn get_critical_alerts(&self) -> Vec<TamperAlert> {
        self.get_alerts_above(AlertPriority::Critical)
    }

    /// All alerts at `min_priority` or more severe
    pub fn get_alerts_above(&self, min_priority: AlertPriority) -> Vec<TamperAlert> {
        self.lock()
            .iter()
            .filter(|a| a.priority <= min_priority)
            .cloned()
            .collect()
    }

    pub fn count_by_priority(&self, priority: AlertPriority) -> usize {
        self.lock().iter().filter(|a| a.priority == priority).count()
    }

    pub fn latest(&self) -> Option<TamperAlert> {
        self.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn total_count(&self) -> usize {
        self.lock().len()
    }
}

impl Default for TamperAlertLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_from_event() {
        let removed = TamperAlert::from_event(TamperEvent::NodeRemoved, "guard-a", 0.5).unwrap();
        assert_eq!(removed.priority, AlertPriority::Critical);

        let hidden = TamperAlert::from_event(TamperEvent::NodeHidden, "guard-a", 0.5).unwrap();
        assert_eq!(hidden.priority, AlertPriority::Warning);

        assert!(TamperAlert::from_event(TamperEvent::Benign, "guard-a", 0.5).is_none());
    }

    #[test]
    fn test_benign_events_are_not_logged() {
        let log = TamperAlertLog::new();
        log.emit(TamperEvent::Benign, "guard-a", 0.5);

        assert_eq!(log.total_count(), 0);
        assert!(log.latest().is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = TamperAlertLog::with_capacity(3);
        for i in 0..5 {
            log.emit(TamperEvent::NodeHidden, "guard-a", i as f64 / 10.0);
        }

        assert_eq!(log.total_count(), 3);
        assert_eq!(log.latest().unwrap().block_level, 0.4);
        assert_eq!(log.get_alerts_above(AlertPriority::Warning)[0].block_level, 0.2);
    }

    #[test]
    fn test_filter_by_priority() {
        let log = TamperAlertLog::new();
        log.emit(TamperEvent::NodeRemoved, "guard-a", 0.5);
        log.emit(TamperEvent::NodeHidden, "guard-a", 0.5);
        log.emit(TamperEvent::NodeHidden, "guard-a", 0.5);

        assert_eq!(log.get_critical_alerts().len(), 1);
        assert_eq!(log.count_by_priority(AlertPriority::Warning), 2);
        assert_eq!(log.get_alerts_above(AlertPriority::Warning).len(), 3);

        log.clear();
        assert_eq!(log.total_count(), 0);
    }
}
