use crate::cmd::load_config;
use crate::output::{or_dash, print_json, print_table};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct TargetRow<'a> {
    index: usize,
    name: &'a str,
    instance: &'a str,
    device_port: u16,
    routine: &'a str,
    layout: Option<&'a str>,
}

pub fn run(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let rows: Vec<TargetRow<'_>> = config
        .targets
        .iter()
        .enumerate()
        .map(|(i, t)| TargetRow {
            index: i + 1,
            name: &t.name,
            instance: &t.instance,
            device_port: t.device_port,
            routine: &t.routine,
            layout: t.layout.as_deref().or(config.default_layout.as_deref()),
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No targets configured.");
        return Ok(());
    }
    print_table(
        &["#", "NAME", "INSTANCE", "PORT", "ROUTINE", "LAYOUT"],
        rows.iter()
            .map(|r| {
                vec![
                    r.index.to_string(),
                    r.name.to_string(),
                    r.instance.to_string(),
                    r.device_port.to_string(),
                    r.routine.to_string(),
                    or_dash(r.layout),
                ]
            })
            .collect(),
    );
    Ok(())
}
