//! Overlay Renderer - materializes the enforcement state as one page node
//!
//! `render` is idempotent: it finds or creates the overlay by its session id,
//! rewrites every enforced inline property and the panel markup, and toggles
//! the page-wide scroll lock.

use crate::dom::{Dom, DomError, NodeId};
use crate::enforcement::EnforcementState;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

const ID_PREFIX: &str = "guard-";
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 7;

/// Largest z-index browsers honour
pub const MAX_Z_INDEX: &str = "2147483647";

/// Fresh overlay id, e.g. `guard-k3x9a1q`.
///
/// Not a secret: it only keeps static stylesheets from targeting the node.
pub fn generate_overlay_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", ID_PREFIX, suffix)
}

/// Text shown in the centered panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayContent {
    pub heading: String,
    pub message: String,
}

impl OverlayContent {
    pub fn new(heading: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
            message: message.into(),
        }
    }

    /// Panel markup with heading and message escaped
    pub fn panel_markup(&self) -> String {
        format!(
            "<div style=\"max-width: 600px; background: rgba(0,0,0,0.8); padding: 40px; \
             border-radius: 12px; box-shadow: 0 4px 30px rgba(0,0,0,0.5);\">\
             <h1 style=\"margin-bottom: 20px; font-size: 2rem; color: #ff4444;\">{}</h1>\
             <p style=\"font-size: 1.2rem; line-height: 1.6;\">{}</p>\
             </div>",
            escape_html(&self.heading),
            escape_html(&self.message),
        )
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Inline properties enforced on every render
pub fn overlay_styles(state: &EnforcementState) -> Vec<(&'static str, String)> {
    vec![
        ("position", "fixed".to_string()),
        ("top", "0".to_string()),
        ("left", "0".to_string()),
        ("width", "100vw".to_string()),
        ("height", "100vh".to_string()),
        ("background-color", format!("rgba(0, 0, 0, {})", state.opacity())),
        ("z-index", MAX_Z_INDEX.to_string()),
        (
            "pointer-events",
            if state.intercepts_pointer() { "all" } else { "none" }.to_string(),
        ),
        ("display", "flex".to_string()),
        ("align-items", "center".to_string()),
        ("justify-content", "center".to_string()),
        ("flex-direction", "column".to_string()),
        (
            "backdrop-filter",
            if state.critical { "blur(4px)" } else { "none" }.to_string(),
        ),
        ("transition", "background-color 0.5s ease".to_string()),
        ("color", "#ffffff".to_string()),
        ("font-family", "sans-serif".to_string()),
        ("text-align", "center".to_string()),
        ("padding", "20px".to_string()),
        ("opacity", "1".to_string()),
        ("visibility", "visible".to_string()),
    ]
}

/// Renders the overlay for one guard session
#[derive(Clone)]
pub struct OverlayRenderer {
    dom: Arc<dyn Dom>,
    overlay_id: Arc<str>,
    reconcile: Arc<Mutex<()>>,
}

impl OverlayRenderer {
    /// Renderer with a freshly generated overlay id
    pub fn new(dom: Arc<dyn Dom>) -> Self {
        Self::with_id(dom, generate_overlay_id())
    }

    pub fn with_id(dom: Arc<dyn Dom>, overlay_id: impl Into<String>) -> Self {
        Self {
            dom,
            overlay_id: Arc::from(overlay_id.into()),
            reconcile: Arc::new(Mutex::new(())),
        }
    }

    pub fn overlay_id(&self) -> &str {
        &self.overlay_id
    }

    pub fn dom(&self) -> &Arc<dyn Dom> {
        &self.dom
    }

    /// The connected overlay node, if any
    pub fn overlay_node(&self) -> Option<NodeId> {
        self.dom.get_element_by_id(&self.overlay_id)
    }

    /// Serializes renders coming from the poll loop and the watcher
    pub(crate) fn reconcile_lock(&self) -> MutexGuard<'_, ()> {
        self.reconcile.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the page in line with `state`
    pub fn render(
        &self,
        state: &EnforcementState,
        content: &OverlayContent,
    ) -> Result<(), DomError> {
        if !state.requires_overlay() {
            self.remove()?;
            return self.restore_scroll();
        }

        let node = match self.overlay_node() {
            Some(node) => node,
            None => {
                let node = self.dom.create_element("div");
                self.dom.set_element_id(node, &self.overlay_id)?;
                self.dom.append_child(self.dom.body(), node)?;
                debug!("Overlay {} mounted", self.overlay_id);
                node
            }
        };

        for (property, value) in overlay_styles(state) {
            self.dom.set_style(node, property, &value)?;
        }

        let markup = if state.shows_content() {
            content.panel_markup()
        } else {
            String::new()
        };
        self.dom.set_inner_html(node, &markup)?;

        if state.critical {
            self.suppress_scroll()
        } else {
            self.restore_scroll()
        }
    }

    /// Remove the overlay node if it is attached
    pub fn remove(&self) -> Result<(), DomError> {
        if let Some(node) = self.overlay_node() {
            self.dom.remove(node)?;
            debug!("Overlay {} removed", self.overlay_id);
        }
        Ok(())
    }

    /// Lock page scrolling
    pub fn suppress_scroll(&self) -> Result<(), DomError> {
        self.dom.set_style(self.dom.body(), "overflow", "hidden")
    }

    /// Give page scrolling back
    pub fn restore_scroll(&self) -> Result<(), DomError> {
        let body = self.dom.body();
        if self.dom.style(body, "overflow").is_some() {
            self.dom.set_style(body, "overflow", "")?;
        }
        Ok(())
    }
}
