//! The `Task` capability, the context tasks run in, and the name registry.

use crate::channel::ControlChannel;
use crate::config::{Config, Coord, LayoutConfig, Params, Region, TargetConfig};
use crate::diagnostics::TargetLog;
use crate::error::{DroverError, Result};
use crate::perception::Perception;
use crate::quota::QuotaStore;
use crate::slots::SlotResolver;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

const BACK_BUTTON_TEMPLATES: [&str; 2] = ["back_button_icon", "back_button"];

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: &mut TaskContext<'_>, params: &Params) -> Result<()>;

    /// Run even when today's quota is already met.
    fn allow_repeat_after_completion(&self) -> bool {
        false
    }

    /// The task records its own quota progress; the orchestrator must not.
    fn manual_daily_logging(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// Everything a task may touch during one target pass.
pub struct TaskContext<'a> {
    pub config: &'a Config,
    pub target: &'a TargetConfig,
    pub layout: &'a LayoutConfig,
    pub channel: &'a ControlChannel,
    pub vision: &'a dyn Perception,
    pub quota: Option<&'a mut QuotaStore>,
    pub log: TargetLog,
    pub simulate: bool,
}

impl<'a> TaskContext<'a> {
    pub fn tap_button(&self, name: &str, label: &str) -> Result<()> {
        let coord = self.layout.button(name)?;
        self.channel.tap(coord, label)
    }

    pub fn tap(&self, coord: Coord, label: &str) -> Result<()> {
        self.channel.tap(coord, label)
    }

    /// Sleep for `seconds`; non-positive values do nothing.
    pub fn pause(&self, seconds: f64) {
        if seconds > 0.0 && seconds.is_finite() {
            self.channel.sleep(Duration::from_secs_f64(seconds));
        }
    }

    /// Template paths for the given logical names. Unknown names are warned and skipped.
    pub fn templates<S: AsRef<str>>(&self, names: &[S]) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            match self.layout.template_paths(name) {
                Ok(found) => paths.extend(found),
                Err(_) => self
                    .log
                    .warn(format!("template '{name}' is not defined for this layout")),
            }
        }
        paths
    }

    /// Wait for any of `names` to appear and tap where it was found.
    pub fn tap_template<S: AsRef<str>>(
        &self,
        names: &[S],
        label: &str,
        timeout: Duration,
        threshold: f32,
    ) -> Result<bool> {
        let paths = self.templates(names);
        if paths.is_empty() {
            return Ok(false);
        }
        let poll = Duration::from_millis(500).min(timeout.max(Duration::from_millis(100)));
        match self.vision.wait_for_any(&paths, threshold, timeout, poll)? {
            Some(found) => {
                self.log
                    .info(format!("'{}' found; tapping ({label})", found.template_name()));
                self.channel.tap(found.coord, label)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Find the back button on screen and tap it.
    pub fn tap_back_button(&self, label: &str, timeout: Duration, threshold: f32) -> Result<bool> {
        let paths = self.layout.template_paths_lenient(&BACK_BUTTON_TEMPLATES);
        if paths.is_empty() {
            self.log.warn(format!(
                "no back button templates configured (candidates: {})",
                BACK_BUTTON_TEMPLATES.join(", ")
            ));
            return Ok(false);
        }
        let poll = Duration::from_millis(500).min(timeout.max(Duration::from_millis(100)));
        let Some(found) = self.vision.wait_for_any(&paths, threshold, timeout, poll)? else {
            self.log.warn(format!(
                "back button not seen within {:.1}s ({label})",
                timeout.as_secs_f64()
            ));
            return Ok(false);
        };
        self.log
            .info(format!("back button found via '{}' ({label})", found.template_name()));
        self.channel.tap(found.coord, label)?;
        Ok(true)
    }

    /// Slot resolver for this target's layout.
    pub fn slots(&self) -> SlotResolver<'a> {
        SlotResolver::for_layout(self.layout, self.vision, self.log.clone(), self.simulate)
    }

    // -----------------------------------------------------------------------
    // Quota shortcuts (no-ops when tracking is off)
    // -----------------------------------------------------------------------

    pub fn quota_met(&self, task: &str) -> bool {
        self.quota
            .as_deref()
            .is_some_and(|q| q.should_skip(&self.target.name, task))
    }

    pub fn record_progress(&mut self, task: &str, amount: i64) {
        if let Some(quota) = self.quota.as_deref_mut() {
            quota.record_progress(&self.target.name, task, amount);
        }
    }

    pub fn set_metadata(&mut self, task: &str, key: &str, value: Value) {
        if let Some(quota) = self.quota.as_deref_mut() {
            quota.set_metadata(&self.target.name, task, key, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter access
// ---------------------------------------------------------------------------

/// Typed lookups over YAML task parameters, falling back to a default when
/// the key is missing or has the wrong shape.
pub trait ParamsExt {
    fn f64_or(&self, key: &str, default: f64) -> f64;
    fn u32_or(&self, key: &str, default: u32) -> u32;
    fn bool_or(&self, key: &str, default: bool) -> bool;
    fn str_or<'p>(&'p self, key: &str, default: &'p str) -> &'p str;
    fn opt_str(&self, key: &str) -> Option<&str>;
    /// A single string or a list of strings.
    fn str_list(&self, key: &str) -> Vec<String>;
    fn region(&self, key: &str) -> Option<Region>;
}

impl ParamsExt for Params {
    fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    fn u32_or(&self, key: &str, default: u32) -> u32 {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .map(|v| v.min(u64::from(u32::MAX)) as u32)
                .unwrap_or(default),
            _ => default,
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    fn str_or<'p>(&'p self, key: &str, default: &'p str) -> &'p str {
        self.opt_str(key).unwrap_or(default)
    }

    fn opt_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn region(&self, key: &str) -> Option<Region> {
        let raw = self.get(key)?.clone();
        serde_json::from_value::<Region>(raw)
            .ok()
            .filter(Region::is_normalized)
    }
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Box<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the tasks this crate ships.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        crate::tasks::register_builtins(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, task: Box<dyn Task>) -> Result<()> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(DroverError::DuplicateTask(name));
        }
        self.tasks.insert(name, task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn Task> {
        self.tasks
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| DroverError::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
