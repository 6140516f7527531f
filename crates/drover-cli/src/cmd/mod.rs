pub mod config;
pub mod quota;
pub mod run;
pub mod targets;

use anyhow::Context;
use drover_core::config::Config;
use std::path::Path;

pub(crate) fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("failed to load config from {}", path.display()))
}
