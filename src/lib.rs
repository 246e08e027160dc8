//! Client Guard - self-healing payment overdue overlay
//!
//! Library components: status polling, enforcement state, overlay rendering
//! and tamper watching over a host document.

pub mod config;
pub mod dom;
pub mod enforcement;
pub mod guard;
pub mod overlay_renderer;
pub mod status_fetcher;
pub mod tamper_alerts;
pub mod tamper_watcher;

pub use config::{ConfigError, Credentials, GuardConfig, DEFAULT_API_URL};
pub use dom::{Dom, DomError, MemoryDocument, MutationRecord, NodeId, ObserveOptions};
pub use enforcement::{
    BlockLevel, EnforcementState, EnforcementTier, CRITICAL_THRESHOLD, INTERACTION_THRESHOLD,
};
pub use guard::{ClientGuard, GuardError};
pub use overlay_renderer::{OverlayContent, OverlayRenderer};
pub use status_fetcher::{FetchError, StatusFetcher};
pub use tamper_alerts::{AlertPriority, TamperAlert, TamperAlertLog};
pub use tamper_watcher::{RenderSnapshot, TamperEvent, TamperWatcher};
