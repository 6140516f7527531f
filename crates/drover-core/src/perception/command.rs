//! Perception backed by an external matcher process.
//!
//! # Protocol
//! Each query writes the current frame to a temporary PNG, runs the
//! configured command, and sends one JSON request on stdin:
//!
//! ```text
//! {"op": "find_all" | "best_score" | "read_timer" | "brightness",
//!  "image": "/tmp/drover-frame-XXXX.png",
//!  "templates": ["..."], "threshold": 0.85, "max_results": 5,
//!  "region": {"y": [0.1, 0.2], "x": [0.5, 0.9]} | null}
//! ```
//!
//! The helper answers with one JSON object on stdout:
//! `{"matches": [{"x", "y", "template", "score"}]}`, `{"best": {...} | null}`,
//! `{"seconds": f | null}`, `{"brightness": f | null}`, or `{"error": "..."}`.
//! Matches are reported in template order, so `find_all` with
//! `max_results: 1` yields the first template that matches.

use super::{template_name, Frame, Perception, TemplateMatch};
use crate::channel::ControlChannel;
use crate::config::{secs, PerceptionConfig, Region};
use crate::error::{DroverError, Result};
use crate::process::{run_with_timeout, RunError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct Query<'a> {
    op: &'a str,
    templates: &'a [PathBuf],
    #[serde(skip_serializing_if = "Option::is_none")]
    threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_results: Option<usize>,
    region: Option<&'a Region>,
}

#[derive(Debug, Default, Deserialize)]
struct HelperResponse {
    #[serde(default)]
    matches: Vec<HelperMatch>,
    #[serde(default)]
    best: Option<HelperMatch>,
    #[serde(default)]
    seconds: Option<f64>,
    #[serde(default)]
    brightness: Option<f32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperMatch {
    #[serde(default)]
    x: i32,
    #[serde(default)]
    y: i32,
    template: PathBuf,
    #[serde(default)]
    score: Option<f32>,
}

pub struct CommandPerception {
    channel: Arc<ControlChannel>,
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandPerception {
    pub fn new(channel: Arc<ControlChannel>, config: &PerceptionConfig) -> Result<Self> {
        let argv = config
            .command
            .clone()
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| DroverError::Perception("perception.command is not configured".into()))?;
        Ok(Self {
            channel,
            argv,
            timeout: secs(config.timeout),
        })
    }

    /// Templates that exist on disk; missing ones are logged and skipped.
    fn existing(&self, templates: &[PathBuf]) -> Vec<PathBuf> {
        templates
            .iter()
            .filter(|path| {
                let exists = path.exists();
                if !exists {
                    self.channel
                        .log()
                        .warn(format!("template not found: {}", path.display()));
                }
                exists
            })
            .cloned()
            .collect()
    }

    fn request(&self, frame: &Frame, query: Query<'_>) -> Result<HelperResponse> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            image: &'a Path,
            #[serde(flatten)]
            query: Query<'a>,
        }

        let mut image = tempfile::Builder::new()
            .prefix("drover-frame-")
            .suffix(".png")
            .tempfile()?;
        image.write_all(&frame.png)?;
        image.flush()?;
        let body = serde_json::to_vec(&Envelope {
            image: image.path(),
            query,
        })?;

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        let done = match run_with_timeout(&mut cmd, Some(&body), true, self.timeout) {
            Ok(done) => done,
            Err(RunError::Timeout) => {
                return Err(DroverError::Perception(format!(
                    "helper timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                )))
            }
            Err(RunError::Spawn(e)) => {
                return Err(DroverError::Perception(format!(
                    "could not start helper {}: {e}",
                    self.argv[0]
                )))
            }
        };
        if !done.success {
            return Err(DroverError::Perception(format!(
                "helper exited with code {}: {}",
                done.code,
                done.stderr.trim()
            )));
        }
        let resp: HelperResponse = serde_json::from_slice(&done.stdout)
            .map_err(|e| DroverError::Perception(format!("invalid helper output: {e}")))?;
        if let Some(err) = resp.error {
            return Err(DroverError::Perception(err));
        }
        Ok(resp)
    }

    fn matches(
        &self,
        templates: &[PathBuf],
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<TemplateMatch>> {
        let templates = self.existing(templates);
        if templates.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }
        let Some(frame) = self.capture()? else {
            return Ok(Vec::new());
        };
        let resp = self.request(
            &frame,
            Query {
                op: "find_all",
                templates: &templates,
                threshold: Some(threshold),
                max_results: Some(max_results),
                region: None,
            },
        )?;
        let found: Vec<TemplateMatch> = resp
            .matches
            .into_iter()
            .take(max_results)
            .map(|m| TemplateMatch {
                coord: (m.x, m.y),
                template: m.template,
                score: m.score,
            })
            .collect();
        if let Some(first) = found.first() {
            self.channel
                .log()
                .record_frame(&format!("find-{}", first.template_name()), &frame.png);
        }
        Ok(found)
    }
}

impl Perception for CommandPerception {
    fn capture(&self) -> Result<Option<Frame>> {
        Ok(self.channel.capture()?.map(Frame::new))
    }

    fn find_any(&self, templates: &[PathBuf], threshold: f32) -> Result<Option<TemplateMatch>> {
        Ok(self.matches(templates, threshold, 1)?.into_iter().next())
    }

    fn find_all(
        &self,
        templates: &[PathBuf],
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<TemplateMatch>> {
        self.matches(templates, threshold, max_results)
    }

    fn best_score(
        &self,
        frame: &Frame,
        region: Option<&Region>,
        templates: &[PathBuf],
    ) -> Result<Option<(PathBuf, f32)>> {
        let templates = self.existing(templates);
        if templates.is_empty() {
            return Ok(None);
        }
        let resp = self.request(
            frame,
            Query {
                op: "best_score",
                templates: &templates,
                threshold: None,
                max_results: None,
                region,
            },
        )?;
        Ok(resp
            .best
            .and_then(|m| m.score.map(|score| (m.template, score))))
    }

    fn read_timer(&self, region: &Region) -> Result<Option<Duration>> {
        let Some(frame) = self.capture()? else {
            return Ok(None);
        };
        let resp = self.request(
            &frame,
            Query {
                op: "read_timer",
                templates: &[],
                threshold: None,
                max_results: None,
                region: Some(region),
            },
        )?;
        let timer = resp.seconds.filter(|s| s.is_finite() && *s >= 0.0);
        if timer.is_none() {
            self.channel.log().record_frame("timer-unreadable", &frame.png);
        }
        Ok(timer.map(Duration::from_secs_f64))
    }

    fn average_brightness(&self, region: Option<&Region>) -> Result<Option<f32>> {
        let Some(frame) = self.capture()? else {
            return Ok(None);
        };
        let resp = self.request(
            &frame,
            Query {
                op: "brightness",
                templates: &[],
                threshold: None,
                max_results: None,
                region,
            },
        )?;
        Ok(resp.brightness.map(|b| b.clamp(0.0, 1.0)))
    }
}

impl std::fmt::Debug for CommandPerception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPerception")
            .field("argv", &self.argv)
            .field("serial", &self.channel.serial())
            .finish()
    }
}

/// Name shown in logs for a set of templates.
pub fn describe(templates: &[PathBuf]) -> String {
    templates
        .iter()
        .map(|t| template_name(t))
        .collect::<Vec<_>>()
        .join(", ")
}
