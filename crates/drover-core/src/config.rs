use crate::error::{DroverError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Absolute screen coordinate `(x, y)` in device pixels.
pub type Coord = (i32, i32);

/// Free-form task parameters as written in YAML.
pub type Params = serde_json::Map<String, serde_json::Value>;

pub const COMMON_DEFAULTS_KEY: &str = "__common__";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// Screen region expressed as fractions of the frame height (`y`) and width (`x`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub y: (f32, f32),
    pub x: (f32, f32),
}

impl Region {
    pub fn is_normalized(&self) -> bool {
        let (y0, y1) = self.y;
        let (x0, x1) = self.x;
        (0.0..=1.0).contains(&y0)
            && y0 < y1
            && y1 <= 1.0
            && (0.0..=1.0).contains(&x0)
            && x0 < x1
            && x1 <= 1.0
    }

    /// Pixel bounds `(y1, y2, x1, x2)` for a frame of the given size, or `None`
    /// when the region collapses to nothing.
    pub fn to_pixels(&self, height: u32, width: u32) -> Option<(u32, u32, u32, u32)> {
        let h = height as f32;
        let w = width as f32;
        let y1 = (h * self.y.0).max(0.0) as u32;
        let y2 = ((h * self.y.1) as u32).min(height);
        let x1 = (w * self.x.0).max(0.0) as u32;
        let x2 = ((w * self.x.1) as u32).min(width);
        if y2 <= y1 || x2 <= x1 {
            return None;
        }
        Some((y1, y2, x1, x2))
    }
}

// ---------------------------------------------------------------------------
// AdbConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbConfig {
    /// Path to the adb binary, or a bare name looked up on PATH.
    #[serde(default = "default_adb_executable")]
    pub executable: String,
    #[serde(default = "default_adb_host")]
    pub host: String,
    #[serde(default = "default_adb_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_adb_timeout")]
    pub command_timeout: f64,
    #[serde(default = "default_capture_attempts")]
    pub capture_attempts: u32,
}

fn default_adb_executable() -> String {
    "adb".to_string()
}

fn default_adb_host() -> String {
    "127.0.0.1".to_string()
}

fn default_adb_timeout() -> f64 {
    20.0
}

fn default_capture_attempts() -> u32 {
    2
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            executable: default_adb_executable(),
            host: default_adb_host(),
            connect_timeout: default_adb_timeout(),
            command_timeout: default_adb_timeout(),
            capture_attempts: default_capture_attempts(),
        }
    }
}

impl AdbConfig {
    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        secs(self.command_timeout)
    }
}

// ---------------------------------------------------------------------------
// EmulatorConfig
// ---------------------------------------------------------------------------

/// Launcher used to boot an emulator instance before its pass and quit it after.
///
/// `{instance}` in the argument lists is replaced with the target's instance id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    pub player_path: String,
    #[serde(default = "default_start_args")]
    pub start_args: Vec<String>,
    #[serde(default = "default_stop_args")]
    pub stop_args: Vec<String>,
    #[serde(default = "default_start_timeout")]
    pub start_timeout: f64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: f64,
}

fn default_start_args() -> Vec<String> {
    ["--instance", "{instance}", "--cmd", "launchApp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_stop_args() -> Vec<String> {
    ["--instance", "{instance}", "--cmd", "quit"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_start_timeout() -> f64 {
    60.0
}

fn default_shutdown_timeout() -> f64 {
    15.0
}

// ---------------------------------------------------------------------------
// TargetConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub instance: String,
    pub device_port: u16,
    pub routine: String,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub help_limit: u32,
    #[serde(default)]
    pub help_minutes: f64,
    #[serde(default)]
    pub free_research_minutes: f64,
    #[serde(default)]
    pub free_construction_minutes: f64,
    #[serde(default)]
    pub construction_enabled: bool,
}

impl TargetConfig {
    fn clamp_modifiers(&mut self) {
        self.help_minutes = self.help_minutes.max(0.0);
        self.free_research_minutes = self.free_research_minutes.max(0.0);
        self.free_construction_minutes = self.free_construction_minutes.max(0.0);
    }
}

// ---------------------------------------------------------------------------
// Routines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub task: String,
    #[serde(default)]
    pub params: Params,
}

impl TaskStep {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            params: Params::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub tasks: Vec<TaskStep>,
}

impl Routine {
    /// A routine consisting of one parameterless task, used for diagnostic runs.
    pub fn single(task: &str) -> Self {
        Self {
            tasks: vec![TaskStep::new(task)],
        }
    }
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub id: String,
    pub tap: Coord,
    pub indicator_region: Region,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTemplates {
    pub activity: String,
    pub templates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotLayoutConfig {
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    /// Scanned in order; on equal scores the earlier entry wins.
    #[serde(default)]
    pub activity_templates: Vec<ActivityTemplates>,
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f32,
}

fn default_detection_threshold() -> f32 {
    0.85
}

impl SlotLayoutConfig {
    pub fn is_usable(&self) -> bool {
        !self.slots.is_empty() && !self.activity_templates.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestingIconConfig {
    #[serde(default = "default_resting_templates")]
    pub templates: Vec<String>,
    #[serde(default = "default_resting_threshold")]
    pub threshold: f32,
    #[serde(default = "default_resting_max")]
    pub max_matches: usize,
}

fn default_resting_templates() -> Vec<String> {
    vec!["resting_icon".to_string()]
}

fn default_resting_threshold() -> f32 {
    0.8
}

fn default_resting_max() -> usize {
    5
}

impl Default for RestingIconConfig {
    fn default() -> Self {
        Self {
            templates: default_resting_templates(),
            threshold: default_resting_threshold(),
            max_matches: default_resting_max(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default)]
    pub buttons: BTreeMap<String, Coord>,
    /// Each entry is a single path or a list of alternative paths.
    #[serde(default, deserialize_with = "deserialize_template_map")]
    pub templates: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub slots: Option<SlotLayoutConfig>,
    #[serde(default)]
    pub resting_icon: RestingIconConfig,
    /// Directory relative template paths resolve against (the config file's directory).
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn deserialize_template_map<'de, D>(
    d: D,
) -> std::result::Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let raw: BTreeMap<String, OneOrMany> = BTreeMap::deserialize(d)?;
    let mut out = BTreeMap::new();
    for (name, value) in raw {
        let entries: Vec<String> = match value {
            OneOrMany::One(path) => vec![path],
            OneOrMany::Many(paths) => paths,
        }
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect();
        if entries.is_empty() {
            return Err(serde::de::Error::custom(format!(
                "template '{name}' must include at least one path"
            )));
        }
        out.insert(name, entries);
    }
    Ok(out)
}

impl LayoutConfig {
    pub fn button(&self, name: &str) -> Result<Coord> {
        self.buttons
            .get(name)
            .copied()
            .ok_or_else(|| DroverError::UnknownButton(name.to_string()))
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn template_paths(&self, name: &str) -> Result<Vec<PathBuf>> {
        let raw = self
            .templates
            .get(name)
            .ok_or_else(|| DroverError::UnknownTemplate(name.to_string()))?;
        Ok(raw.iter().map(|p| self.resolve(p)).collect())
    }

    /// Resolve several logical template names, skipping the ones this layout lacks.
    pub fn template_paths_lenient(&self, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .filter_map(|n| self.template_paths(n).ok())
            .flatten()
            .collect()
    }

    /// A logical template name, or failing that a literal path to an image.
    pub fn resolve_template(&self, identifier: &str) -> Vec<PathBuf> {
        match self.template_paths(identifier) {
            Ok(paths) => paths,
            Err(_) => vec![self.resolve(identifier)],
        }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

// ---------------------------------------------------------------------------
// DailyTrackingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyTrackingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_reset_hour")]
    pub reset_hour_local: u32,
    /// Either a list of names (limit 1 each) or a map of name to daily limit.
    #[serde(default, deserialize_with = "deserialize_tracked_tasks")]
    pub tracked_tasks: BTreeMap<String, u32>,
}

fn default_true() -> bool {
    true
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("state/daily_tasks.json")
}

fn default_reset_hour() -> u32 {
    23
}

fn deserialize_tracked_tasks<'de, D>(d: D) -> std::result::Result<BTreeMap<String, u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Map(BTreeMap<String, i64>),
    }

    let raw: Option<Raw> = Option::deserialize(d)?;
    let mut out = BTreeMap::new();
    match raw {
        None => {}
        Some(Raw::List(names)) => {
            for name in names {
                let name = name.trim();
                if !name.is_empty() {
                    out.insert(name.to_string(), 1);
                }
            }
        }
        Some(Raw::Map(map)) => {
            for (name, limit) in map {
                let name = name.trim();
                if !name.is_empty() {
                    out.insert(name.to_string(), limit.max(1) as u32);
                }
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

/// A task fired between routine steps whenever its alert icon is on screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptConfig {
    pub task: String,
    pub template: String,
    #[serde(default = "default_detection_threshold")]
    pub threshold: f32,
    #[serde(default = "default_interrupt_cooldown")]
    pub cooldown_seconds: f64,
    /// Do not fire when the task's daily quota is already met.
    #[serde(default = "default_true")]
    pub skip_when_quota_met: bool,
    #[serde(default)]
    pub params: Params,
}

fn default_interrupt_cooldown() -> f64 {
    300.0
}

// ---------------------------------------------------------------------------
// PerceptionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerceptionConfig {
    /// argv of the external matcher helper; `None` means nothing is ever seen.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_helper_timeout")]
    pub timeout: f64,
}

fn default_helper_timeout() -> f64 {
    30.0
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub adb: AdbConfig,
    #[serde(default)]
    pub emulator: Option<EmulatorConfig>,
    #[serde(alias = "instances")]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub routines: BTreeMap<String, Routine>,
    #[serde(default)]
    pub layouts: BTreeMap<String, LayoutConfig>,
    #[serde(default)]
    pub default_layout: Option<String>,
    #[serde(default = "default_warmup")]
    pub instance_warmup_seconds: f64,
    #[serde(default)]
    pub timings: BTreeMap<String, f64>,
    #[serde(default)]
    pub task_defaults: BTreeMap<String, Params>,
    #[serde(default)]
    pub daily_tracking: Option<DailyTrackingConfig>,
    #[serde(default)]
    pub interrupts: Vec<InterruptConfig>,
    #[serde(default)]
    pub perception: PerceptionConfig,
    #[serde(default = "default_diagnostics_dir")]
    pub diagnostics_dir: PathBuf,
}

fn default_warmup() -> f64 {
    5.0
}

fn default_diagnostics_dir() -> PathBuf {
    PathBuf::from("debug_reports")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&data)?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        cfg.anchor_paths(&base);
        for target in &mut cfg.targets {
            target.clamp_modifiers();
        }
        Ok(cfg)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data)?;
        for target in &mut cfg.targets {
            target.clamp_modifiers();
        }
        Ok(cfg)
    }

    /// Relative paths in the file are relative to the file, not the working directory.
    fn anchor_paths(&mut self, base: &Path) {
        for layout in self.layouts.values_mut() {
            layout.base_dir = base.to_path_buf();
        }
        if self.diagnostics_dir.is_relative() {
            self.diagnostics_dir = base.join(&self.diagnostics_dir);
        }
        if let Some(tracking) = self.daily_tracking.as_mut() {
            if tracking.storage_path.is_relative() {
                tracking.storage_path = base.join(&tracking.storage_path);
            }
        }
    }

    pub fn routine_for(&self, id: &str) -> Result<&Routine> {
        self.routines
            .get(id)
            .ok_or_else(|| DroverError::UnknownRoutine(id.to_string()))
    }

    pub fn layout_for(&self, target: &TargetConfig) -> Result<&LayoutConfig> {
        let key = target
            .layout
            .as_deref()
            .or(self.default_layout.as_deref())
            .ok_or_else(|| DroverError::NoLayout(target.name.clone()))?;
        self.layouts.get(key).ok_or_else(|| DroverError::UnknownLayout {
            target: target.name.clone(),
            layout: key.to_string(),
        })
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn timing(&self, key: &str, default: f64) -> f64 {
        self.timings.get(key).copied().unwrap_or(default)
    }

    pub fn timing_duration(&self, key: &str, default_secs: f64) -> Duration {
        secs(self.timing(key, default_secs))
    }

    /// `__common__` defaults overlaid with the task's own defaults.
    pub fn task_defaults_for(&self, task: &str) -> Params {
        let mut combined = Params::new();
        for key in [COMMON_DEFAULTS_KEY, task] {
            if let Some(defaults) = self.task_defaults.get(key) {
                for (k, v) in defaults {
                    combined.insert(k.clone(), v.clone());
                }
            }
        }
        combined
    }

    /// Daily tracking settings when tracking is switched on.
    pub fn active_tracking(&self) -> Option<&DailyTrackingConfig> {
        self.daily_tracking
            .as_ref()
            .filter(|t| t.enabled && !t.tracked_tasks.is_empty())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.targets.is_empty() {
            warnings.push(ConfigWarning::error("no targets configured"));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "target '{}' is defined more than once",
                    target.name
                )));
            }
            if !self.routines.contains_key(&target.routine) {
                warnings.push(ConfigWarning::error(format!(
                    "target '{}' uses undefined routine '{}'",
                    target.name, target.routine
                )));
            }
            if let Err(e) = self.layout_for(target) {
                warnings.push(ConfigWarning::error(e.to_string()));
            }
        }

        for (id, routine) in &self.routines {
            if routine.tasks.is_empty() {
                warnings.push(ConfigWarning::warning(format!(
                    "routine '{id}' has no tasks"
                )));
            }
        }

        for (name, layout) in &self.layouts {
            let Some(slots) = &layout.slots else {
                continue;
            };
            if slots.detection_threshold <= 0.0 || slots.detection_threshold > 1.0 {
                warnings.push(ConfigWarning::error(format!(
                    "layout '{name}': detection_threshold must be in (0, 1]"
                )));
            }
            for slot in &slots.slots {
                if !slot.indicator_region.is_normalized() {
                    warnings.push(ConfigWarning::error(format!(
                        "layout '{name}': slot '{}' indicator_region must be normalized with start < end",
                        slot.id
                    )));
                }
            }
            for entry in &slots.activity_templates {
                if entry.templates.iter().all(|t| t.trim().is_empty()) {
                    warnings.push(ConfigWarning::error(format!(
                        "layout '{name}': activity '{}' needs at least one template",
                        entry.activity
                    )));
                }
                if crate::slots::SlotActivity::from_key(&entry.activity)
                    == crate::slots::SlotActivity::Unknown
                {
                    warnings.push(ConfigWarning::warning(format!(
                        "layout '{name}': activity '{}' is not a known activity; it will report as unknown",
                        entry.activity
                    )));
                }
            }
        }

        if let Some(tracking) = &self.daily_tracking {
            if tracking.reset_hour_local > 23 {
                warnings.push(ConfigWarning::error(
                    "daily_tracking.reset_hour_local must be between 0 and 23",
                ));
            }
            if tracking.enabled && tracking.tracked_tasks.is_empty() {
                warnings.push(ConfigWarning::error(
                    "daily_tracking.tracked_tasks cannot be empty when tracking is enabled",
                ));
            }
        }

        for interrupt in &self.interrupts {
            if !self.layouts.values().any(|l| l.has_template(&interrupt.template)) {
                warnings.push(ConfigWarning::warning(format!(
                    "interrupt '{}' watches template '{}' which no layout defines",
                    interrupt.task, interrupt.template
                )));
            }
        }

        warnings
    }
}

pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
