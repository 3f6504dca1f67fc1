//! Startup milestones relative to process start
//!
//! The timeline is how time-to-first-pixel is measured. Milestones may be
//! recorded out of order (the graphics worker finishes whenever it
//! finishes), so each entry carries its own offset and rendering sorts by it.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Milestone {
    Connected,
    DriverReady,
    ContextReady,
    CapabilitiesBound,
    WindowCreated,
    Configured,
    SurfaceBound,
    FirstFrame,
    Finished,
}

impl Milestone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Milestone::Connected => "connected",
            Milestone::DriverReady => "driver-ready",
            Milestone::ContextReady => "context-ready",
            Milestone::CapabilitiesBound => "capabilities-bound",
            Milestone::WindowCreated => "window-created",
            Milestone::Configured => "configured",
            Milestone::SurfaceBound => "surface-bound",
            Milestone::FirstFrame => "first-frame",
            Milestone::Finished => "finished",
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub milestone: Milestone,
    /// Milliseconds since the timeline origin
    pub offset_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupTimeline {
    #[serde(skip)]
    origin: Instant,
    entries: Vec<TimelineEntry>,
}

impl StartupTimeline {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(origin: Instant) -> Self {
        Self {
            origin,
            entries: Vec::new(),
        }
    }

    pub fn mark(&mut self, milestone: Milestone) {
        self.mark_at(milestone, Instant::now());
    }

    /// Records a milestone observed at `at`, e.g. on another thread.
    pub fn mark_at(&mut self, milestone: Milestone, at: Instant) {
        let offset = at.saturating_duration_since(self.origin);
        log::debug!("{} at +{:.3}ms", milestone, offset.as_secs_f64() * 1000.0);
        self.entries.push(TimelineEntry {
            milestone,
            offset_ms: offset.as_secs_f64() * 1000.0,
        });
    }

    pub fn offset_of(&self, milestone: Milestone) -> Option<Duration> {
        self.entries
            .iter()
            .find(|e| e.milestone == milestone)
            .map(|e| Duration::from_secs_f64(e.offset_ms / 1000.0))
    }

    pub fn time_to_first_pixel(&self) -> Option<Duration> {
        self.offset_of(Milestone::FirstFrame)
    }

    /// Entries ordered by offset
    pub fn entries(&self) -> Vec<TimelineEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| a.offset_ms.total_cmp(&b.offset_ms));
        entries
    }

    pub fn to_text(&self) -> String {
        self.entries()
            .iter()
            .map(|e| format!("{:>10.3}ms  {}", e.offset_ms, e.milestone))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&TimelineJson {
            entries: self.entries(),
            time_to_first_pixel_ms: self
                .time_to_first_pixel()
                .map(|d| d.as_secs_f64() * 1000.0),
        })
    }
}

impl Default for StartupTimeline {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct TimelineJson {
    entries: Vec<TimelineEntry>,
    time_to_first_pixel_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_marks_render_sorted() {
        let origin = Instant::now();
        let mut timeline = StartupTimeline::starting_at(origin);
        timeline.mark_at(Milestone::DriverReady, origin + Duration::from_millis(30));
        timeline.mark_at(Milestone::Connected, origin + Duration::from_millis(1));
        timeline.mark_at(Milestone::CapabilitiesBound, origin + Duration::from_millis(5));

        let order: Vec<_> = timeline.entries().iter().map(|e| e.milestone).collect();
        assert_eq!(
            order,
            vec![
                Milestone::Connected,
                Milestone::CapabilitiesBound,
                Milestone::DriverReady
            ]
        );
        assert!(timeline.to_text().lines().next().unwrap().ends_with("connected"));
    }

    #[test]
    fn test_first_pixel_only_after_first_frame() {
        let origin = Instant::now();
        let mut timeline = StartupTimeline::starting_at(origin);
        assert_eq!(timeline.time_to_first_pixel(), None);

        timeline.mark_at(Milestone::FirstFrame, origin + Duration::from_millis(42));
        let ttfp = timeline.time_to_first_pixel().unwrap();
        assert!(ttfp >= Duration::from_millis(41) && ttfp <= Duration::from_millis(43));
    }

    #[test]
    fn test_json_names_milestones_in_kebab_case() {
        let origin = Instant::now();
        let mut timeline = StartupTimeline::starting_at(origin);
        timeline.mark_at(Milestone::FirstFrame, origin + Duration::from_millis(12));

        let json: serde_json::Value = serde_json::from_str(&timeline.to_json().unwrap()).unwrap();
        assert_eq!(json["entries"][0]["milestone"], "first-frame");
        assert!(json["time_to_first_pixel_ms"].as_f64().unwrap() >= 11.9);
    }

    #[test]
    fn test_mark_before_origin_clamps_to_zero() {
        let origin = Instant::now() + Duration::from_secs(1);
        let mut timeline = StartupTimeline::starting_at(origin);
        timeline.mark(Milestone::Connected);
        assert_eq!(timeline.offset_of(Milestone::Connected), Some(Duration::ZERO));
    }
}
