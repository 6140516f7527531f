//! Slot sampling and disambiguation.
//!
//! A *slot* is a monitored unit on screen (a troop queue entry) that reports
//! an activity. Layouts that declare slot regions get identity-bearing
//! samples from [`StructuredSlotSource`]; older layouts fall back to
//! [`LegacySlotSource`], which only knows where resting icons are.

mod legacy;
mod structured;

pub use legacy::LegacySlotSource;
pub use structured::StructuredSlotSource;

use crate::config::{Coord, LayoutConfig};
use crate::diagnostics::TargetLog;
use crate::error::Result;
use crate::perception::Perception;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

const MIN_POLL: Duration = Duration::from_millis(100);

/// Pixel tolerance (per axis) for "the resting icon is still at this spot".
pub const ICON_TOLERANCE: i32 = 25;

// ---------------------------------------------------------------------------
// SlotActivity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotActivity {
    Idle,
    Marching,
    Stationed,
    Returning,
    Garrison,
    Gathering,
    Rally,
    Combat,
    Busy,
    Unknown,
}

impl SlotActivity {
    /// Parse a configured activity key, accepting the common aliases.
    pub fn from_key(key: &str) -> Self {
        match key.trim().to_lowercase().as_str() {
            "idle" | "sleep" | "sleeping" => SlotActivity::Idle,
            "march" | "marching" | "moving" => SlotActivity::Marching,
            "stationed" | "holding" | "occupying" => SlotActivity::Stationed,
            "return" | "returning" | "home" => SlotActivity::Returning,
            "garrison" | "reinforce" => SlotActivity::Garrison,
            "gather" | "gathering" => SlotActivity::Gathering,
            "rally" => SlotActivity::Rally,
            "combat" | "fight" => SlotActivity::Combat,
            "busy" => SlotActivity::Busy,
            _ => SlotActivity::Unknown,
        }
    }

    /// Out on the map or otherwise committed; not available for dispatch.
    pub fn is_working(self) -> bool {
        !matches!(self, SlotActivity::Idle | SlotActivity::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotActivity::Idle => "idle",
            SlotActivity::Marching => "marching",
            SlotActivity::Stationed => "stationed",
            SlotActivity::Returning => "returning",
            SlotActivity::Garrison => "garrison",
            SlotActivity::Gathering => "gathering",
            SlotActivity::Rally => "rally",
            SlotActivity::Combat => "combat",
            SlotActivity::Busy => "busy",
            SlotActivity::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SlotActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SlotStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSourceKind {
    /// Sampled from a configured slot region; the id is stable.
    Detector,
    /// Built from a resting-icon match; the id is only an index.
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStatus {
    pub slot_id: String,
    pub tap: Coord,
    pub activity: SlotActivity,
    /// The configured key that matched, e.g. `march` for Marching.
    pub activity_key: String,
    pub confidence: Option<f32>,
    pub label: Option<String>,
    pub source: SlotSourceKind,
    pub reference_coord: Coord,
}

impl SlotStatus {
    pub fn is_idle(&self) -> bool {
        self.activity == SlotActivity::Idle
    }

    pub fn display_name(&self) -> String {
        self.label
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.slot_id)
            .to_uppercase()
    }
}

pub fn manhattan(a: Coord, b: Coord) -> i32 {
    (a.0 - b.0).abs() + (a.1 - b.1).abs()
}

fn near(a: Coord, b: Coord, tolerance: i32) -> bool {
    (a.0 - b.0).abs() <= tolerance && (a.1 - b.1).abs() <= tolerance
}

// ---------------------------------------------------------------------------
// SlotSource
// ---------------------------------------------------------------------------

pub trait SlotSource {
    /// One sample of every slot the source can see, in a stable order.
    fn sample(&self, vision: &dyn Perception) -> Result<Vec<SlotStatus>>;

    /// Whether slot ids survive between samples.
    fn has_identity(&self) -> bool;
}

// ---------------------------------------------------------------------------
// SlotResolver
// ---------------------------------------------------------------------------

pub struct SlotResolver<'a> {
    source: Box<dyn SlotSource + 'a>,
    vision: &'a dyn Perception,
    log: TargetLog,
    simulate: bool,
}

impl<'a> SlotResolver<'a> {
    pub fn new(
        source: Box<dyn SlotSource + 'a>,
        vision: &'a dyn Perception,
        log: TargetLog,
        simulate: bool,
    ) -> Self {
        Self {
            source,
            vision,
            log,
            simulate,
        }
    }

    /// Pick the structured source when the layout declares slots, else the legacy one.
    pub fn for_layout(
        layout: &LayoutConfig,
        vision: &'a dyn Perception,
        log: TargetLog,
        simulate: bool,
    ) -> Self {
        let source: Box<dyn SlotSource + 'a> = match &layout.slots {
            Some(slots) if slots.is_usable() => {
                Box::new(StructuredSlotSource::new(layout, slots, &log))
            }
            _ => {
                log.warn("layout has no usable slot regions; using resting-icon detection");
                Box::new(LegacySlotSource::new(layout))
            }
        };
        Self::new(source, vision, log, simulate)
    }

    pub fn has_identity(&self) -> bool {
        self.source.has_identity()
    }

    pub fn sample_all(&self) -> Result<Vec<SlotStatus>> {
        let slots = self.source.sample(self.vision)?;
        if !slots.is_empty() {
            let summary = slots
                .iter()
                .map(|s| format!("{}: {}", s.display_name(), s.activity))
                .collect::<Vec<_>>()
                .join(", ");
            self.log.info(format!("slots -> {summary}"));
        }
        Ok(slots)
    }

    pub fn idle_slots(&self) -> Result<Vec<SlotStatus>> {
        Ok(self
            .sample_all()?
            .into_iter()
            .filter(SlotStatus::is_idle)
            .collect())
    }

    /// Wait until at least `min_count` slots are idle.
    ///
    /// A zero timeout samples once and returns at most `min_count` slots. On
    /// timeout the last sample is returned, possibly short.
    pub fn wait_for_idle(
        &self,
        min_count: usize,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Vec<SlotStatus>> {
        if timeout.is_zero() {
            let mut slots = self.idle_slots()?;
            if min_count > 0 {
                slots.truncate(min_count);
            }
            return Ok(slots);
        }
        let mut deadline = Deadline::new(timeout, poll);
        let mut last_seen = Vec::new();
        while deadline.next_sample() {
            let slots = self.idle_slots()?;
            if slots.len() >= min_count {
                return Ok(slots);
            }
            last_seen = slots;
            self.pause(deadline.poll);
        }
        Ok(last_seen)
    }

    /// True once `slot_id` reports something other than `from`.
    pub fn wait_for_state_change(
        &self,
        slot_id: &str,
        from: SlotActivity,
        timeout: Duration,
        poll: Duration,
    ) -> Result<bool> {
        if !self.has_identity() {
            return Ok(false);
        }
        let mut deadline = Deadline::new(timeout, poll);
        while deadline.next_sample() {
            let slots = self.sample_all()?;
            if let Some(slot) = slots.iter().find(|s| s.slot_id == slot_id) {
                if slot.activity != from {
                    return Ok(true);
                }
            }
            self.pause(deadline.poll);
        }
        Ok(false)
    }

    /// The slot whose anchor is closest to where we tapped.
    ///
    /// With no candidates given a fresh sample is taken. When the nearest
    /// slot is the fallback itself, the fallback instance is returned.
    pub fn resolve_slot_for_tap(
        &self,
        tap_point: Coord,
        candidates: Option<&[SlotStatus]>,
        fallback: Option<&SlotStatus>,
    ) -> Result<Option<SlotStatus>> {
        let sampled;
        let candidates = match candidates {
            Some(c) => c,
            None => {
                sampled = self.sample_all()?;
                &sampled[..]
            }
        };
        let Some(best) = candidates
            .iter()
            .min_by_key(|s| manhattan(s.reference_coord, tap_point))
        else {
            return Ok(fallback.cloned());
        };
        match fallback {
            Some(fb) if fb.slot_id == best.slot_id => Ok(Some(fb.clone())),
            _ => Ok(Some(best.clone())),
        }
    }

    /// Which slot actually left idle after a dispatch.
    ///
    /// Prefers the expected slot if it changed; otherwise the first slot in
    /// the new sample that was idle in `baseline` and no longer is. Falls
    /// back to `expected` when nothing can be told apart.
    pub fn detect_departing_slot(
        &self,
        expected: Option<&SlotStatus>,
        baseline: &[SlotStatus],
    ) -> Result<Option<SlotStatus>> {
        if !self.has_identity() {
            return Ok(expected.cloned());
        }
        let current = self.sample_all()?;
        if current.is_empty() {
            return Ok(expected.cloned());
        }

        if let Some(exp) = expected.filter(|e| !e.slot_id.is_empty()) {
            if let Some(own) = current
                .iter()
                .find(|s| s.slot_id == exp.slot_id && !s.is_idle())
            {
                return Ok(Some(own.clone()));
            }
        }

        let Some(chosen) = current.iter().find(|s| {
            !s.is_idle()
                && baseline
                    .iter()
                    .any(|b| !b.slot_id.is_empty() && b.slot_id == s.slot_id)
        }) else {
            return Ok(expected.cloned());
        };

        if let Some(exp) = expected {
            if exp.slot_id != chosen.slot_id {
                self.log.info(format!(
                    "slot {} departed instead of {}",
                    chosen.display_name(),
                    exp.display_name()
                ));
            }
        }
        Ok(Some(chosen.clone()))
    }

    /// Confirm a dispatched slot really left.
    pub fn confirm_departure(
        &self,
        slot: &SlotStatus,
        timeout: Duration,
        poll: Duration,
    ) -> Result<bool> {
        if slot.source == SlotSourceKind::Detector && self.has_identity() {
            return self.wait_for_state_change(&slot.slot_id, SlotActivity::Idle, timeout, poll);
        }
        let mut deadline = Deadline::new(timeout, poll);
        while deadline.next_sample() {
            let still_resting = self
                .source
                .sample(self.vision)?
                .iter()
                .any(|s| near(s.reference_coord, slot.reference_coord, ICON_TOLERANCE));
            if !still_resting {
                return Ok(true);
            }
            self.pause(deadline.poll);
        }
        self.log
            .warn("resting icon did not disappear after dispatching the slot");
        Ok(false)
    }

    fn pause(&self, poll: Duration) {
        if !self.simulate {
            std::thread::sleep(poll);
        }
    }
}

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// Sleep-poll budget for the slot waits.
///
/// Stops once the wall clock passes `timeout`, or after `timeout / poll + 1`
/// samples so simulate mode (which never sleeps) still ends. The first
/// sample is always taken.
struct Deadline {
    start: Instant,
    timeout: Duration,
    poll: Duration,
    samples_left: u128,
    taken: bool,
}

impl Deadline {
    fn new(timeout: Duration, poll: Duration) -> Self {
        let poll = poll.max(MIN_POLL);
        Self {
            start: Instant::now(),
            timeout,
            poll,
            samples_left: timeout.as_nanos() / poll.as_nanos() + 1,
            taken: false,
        }
    }

    fn next_sample(&mut self) -> bool {
        if self.samples_left == 0 || (self.taken && self.start.elapsed() > self.timeout) {
            return false;
        }
        self.samples_left -= 1;
        self.taken = true;
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
