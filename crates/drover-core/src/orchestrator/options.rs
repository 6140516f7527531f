use crate::config::TargetConfig;
use tracing::warn;

/// What to run and on which targets.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run this routine on every selected target instead of each target's own.
    pub routine_override: Option<String>,
    /// Run only this task, once, on every selected target.
    pub single_task: Option<String>,
    /// Explicit target names, in run order. Takes precedence over the batch slice.
    pub target_names: Vec<String>,
    pub batch_start: usize,
    pub batch_size: Option<usize>,
    pub simulate: bool,
    /// Keep cycling over the selection until stopped.
    pub loop_mode: bool,
    /// 1-based position the first loop iteration starts from.
    pub loop_start_index: usize,
}

impl RunOptions {
    /// The routine id a target will run.
    pub fn routine_id<'a>(&'a self, target: &'a TargetConfig) -> &'a str {
        self.routine_override.as_deref().unwrap_or(&target.routine)
    }

    /// Label shown for a target's routine: `task:<name>` for single-task runs.
    pub fn routine_label(&self, target: &TargetConfig) -> String {
        match &self.single_task {
            Some(task) => format!("task:{task}"),
            None => self.routine_id(target).to_string(),
        }
    }
}

/// Targets to run, in order.
///
/// Explicit names win and keep their given order; unknown names are warned
/// about and dropped. Otherwise a `batch_start`/`batch_size` slice of the
/// configured list is taken.
pub fn select_targets<'c>(targets: &'c [TargetConfig], opts: &RunOptions) -> Vec<&'c TargetConfig> {
    if !opts.target_names.is_empty() {
        let mut selected = Vec::new();
        let mut missing = Vec::new();
        for name in &opts.target_names {
            match targets.iter().find(|t| &t.name == name) {
                Some(target) => selected.push(target),
                None => missing.push(name.as_str()),
            }
        }
        if !missing.is_empty() {
            warn!("some requested targets are not in the config: {}", missing.join(", "));
        }
        return selected;
    }

    let start = opts.batch_start.min(targets.len());
    let end = match opts.batch_size {
        Some(size) => start.saturating_add(size).min(targets.len()),
        None => targets.len(),
    };
    targets[start..end].iter().collect()
}

/// Rotate the selection so a loop run starts at `loop_start_index` (1-based).
pub fn apply_loop_rotation<T>(mut items: Vec<T>, opts: &RunOptions) -> Vec<T> {
    if items.is_empty() || !opts.loop_mode {
        return items;
    }
    let offset = (opts.loop_start_index.max(1) - 1) % items.len();
    items.rotate_left(offset);
    items
}

/// Turn CLI target tokens into names: 1-based indexes map to the configured
/// target at that position, anything else is taken as a name.
pub fn resolve_target_tokens(targets: &[TargetConfig], tokens: &[String]) -> Vec<String> {
    let mut names = Vec::new();
    for token in tokens.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if token.chars().all(|c| c.is_ascii_digit()) {
            match token.parse::<usize>() {
                Ok(idx) if (1..=targets.len()).contains(&idx) => {
                    names.push(targets[idx - 1].name.clone())
                }
                _ => warn!("target index {token} is out of range (1-{})", targets.len()),
            }
        } else {
            names.push(token.to_string());
        }
    }
    names
}
