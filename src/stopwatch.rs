//! Live status overlay for the lifecycle stopwatch.
//!
//! The core never renders anything itself; it pushes frames through an
//! [`OverlaySink`] the host supplies. Visibility toggles have no other
//! observable effect.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverlayFrame {
    pub foreground: u64,
    pub background: u64,
    /// Foreground share of total tracked time, in percent. 100 when no time
    /// has been tracked yet.
    pub ratio_percent: f64,
    pub visible: bool,
    /// Set while a background transition is imminent or in effect.
    pub alert: bool,
}

impl OverlayFrame {
    pub fn foreground_hms(&self) -> String {
        format_hms(self.foreground)
    }

    pub fn background_hms(&self) -> String {
        format_hms(self.background)
    }
}

pub trait OverlaySink: Send + Sync {
    fn render(&self, frame: &OverlayFrame);
}

/// Default sink for hosts without an overlay surface.
pub struct NullOverlay;

impl OverlaySink for NullOverlay {
    fn render(&self, _frame: &OverlayFrame) {}
}

pub fn format_hms(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{}:{:02}:{:02}", hours, minutes, secs)
}

/// Percentage shown on the overlay, floored to two decimals.
pub fn ratio_percent(foreground: u64, background: u64) -> f64 {
    if foreground == 0 {
        return 100.0;
    }
    let total = (foreground + background) as f64;
    (foreground as f64 / total * 10000.0).floor() / 100.0
}
