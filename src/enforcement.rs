//! Enforcement State - block level and the tiers derived from it
//!
//! The state only ever changes by applying a freshly fetched block level.

/// Block level at or above which the overlay intercepts pointer events
pub const INTERACTION_THRESHOLD: f64 = 0.1;

/// Block level at or above which the project counts as overdue
pub const CRITICAL_THRESHOLD: f64 = 0.8;

/// Required obstruction fraction, always within `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct BlockLevel(f64);

impl BlockLevel {
    /// No obstruction
    pub const CLEAR: BlockLevel = BlockLevel(0.0);

    /// Accept a finite value in `[0, 1]`, reject anything else
    pub fn new(value: f64) -> Option<Self> {
        (value.is_finite() && (0.0..=1.0).contains(&value)).then_some(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_critical(self) -> bool {
        self.0 >= CRITICAL_THRESHOLD
    }
}

/// How hard the overlay has to bite for a given level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnforcementTier {
    /// No overlay at all
    Clear,
    /// Dim backdrop, clicks pass through, no content
    Warning,
    /// Clicks blocked, heading and message shown
    Blocking,
    /// Blocking plus blur and page scroll lock
    Critical,
}

/// Current enforcement as seen by the embedding application
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnforcementState {
    pub block_level: BlockLevel,
    pub critical: bool,
}

impl EnforcementState {
    /// Derive the state for a fetched block level
    pub fn from_level(block_level: BlockLevel) -> Self {
        Self {
            block_level,
            critical: block_level.is_critical(),
        }
    }

    pub fn opacity(&self) -> f64 {
        self.block_level.value()
    }

    /// Whether an overlay node has to exist at all
    pub fn requires_overlay(&self) -> bool {
        self.block_level.value() > 0.0
    }

    /// Whether the overlay swallows pointer events
    pub fn intercepts_pointer(&self) -> bool {
        self.block_level.value() >= INTERACTION_THRESHOLD
    }

    /// Whether the heading and message panel is rendered
    pub fn shows_content(&self) -> bool {
        self.block_level.value() > INTERACTION_THRESHOLD
    }

    pub fn tier(&self) -> EnforcementTier {
        if !self.requires_overlay() {
            EnforcementTier::Clear
        } else if self.critical {
            EnforcementTier::Critical
        } else if self.intercepts_pointer() {
            EnforcementTier::Blocking
        } else {
            EnforcementTier::Warning
        }
    }
}
