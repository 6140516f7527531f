//! Screen perception: template matching, timer reading and brightness, seen
//! only through the [`Perception`] trait. The matcher itself lives outside
//! this crate.

pub mod command;

use crate::config::{Coord, Region};
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use command::CommandPerception;

/// One captured screen, PNG encoded.
#[derive(Debug, Clone)]
pub struct Frame {
    pub png: Arc<Vec<u8>>,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(png: Vec<u8>) -> Self {
        Self {
            png: Arc::new(png),
            captured_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMatch {
    /// Center of the match in device pixels.
    pub coord: Coord,
    pub template: PathBuf,
    pub score: Option<f32>,
}

impl TemplateMatch {
    /// File stem of the template, handy for log lines.
    pub fn template_name(&self) -> String {
        template_name(&self.template)
    }
}

pub fn template_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub trait Perception {
    /// Grab a fresh frame, or `None` when the device has no screen to show.
    fn capture(&self) -> Result<Option<Frame>>;

    /// First template (in order) matching the current screen at `threshold`.
    fn find_any(&self, templates: &[PathBuf], threshold: f32) -> Result<Option<TemplateMatch>>;

    /// Up to `max_results` non-overlapping matches across all templates.
    fn find_all(
        &self,
        templates: &[PathBuf],
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<TemplateMatch>>;

    /// Highest score of any template inside `region` of an existing frame.
    fn best_score(
        &self,
        frame: &Frame,
        region: Option<&Region>,
        templates: &[PathBuf],
    ) -> Result<Option<(PathBuf, f32)>>;

    /// Read a countdown such as `1d 02:03:04` inside `region` of the current screen.
    fn read_timer(&self, region: &Region) -> Result<Option<Duration>>;

    /// Mean brightness (0..=1) of the current screen or a region of it.
    fn average_brightness(&self, region: Option<&Region>) -> Result<Option<f32>>;

    /// Poll `find_any` until something matches or `timeout` passes.
    fn wait_for_any(
        &self,
        templates: &[PathBuf],
        threshold: f32,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<TemplateMatch>> {
        if templates.is_empty() {
            return Ok(None);
        }
        let start = Instant::now();
        loop {
            if let Some(found) = self.find_any(templates, threshold)? {
                return Ok(Some(found));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(poll);
        }
    }
}

impl<P: Perception + ?Sized> Perception for Arc<P> {
    fn capture(&self) -> Result<Option<Frame>> {
        (**self).capture()
    }

    fn find_any(&self, templates: &[PathBuf], threshold: f32) -> Result<Option<TemplateMatch>> {
        (**self).find_any(templates, threshold)
    }

    fn find_all(
        &self,
        templates: &[PathBuf],
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<TemplateMatch>> {
        (**self).find_all(templates, threshold, max_results)
    }

    fn best_score(
        &self,
        frame: &Frame,
        region: Option<&Region>,
        templates: &[PathBuf],
    ) -> Result<Option<(PathBuf, f32)>> {
        (**self).best_score(frame, region, templates)
    }

    fn read_timer(&self, region: &Region) -> Result<Option<Duration>> {
        (**self).read_timer(region)
    }

    fn average_brightness(&self, region: Option<&Region>) -> Result<Option<f32>> {
        (**self).average_brightness(region)
    }

    fn wait_for_any(
        &self,
        templates: &[PathBuf],
        threshold: f32,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<TemplateMatch>> {
        (**self).wait_for_any(templates, threshold, timeout, poll)
    }
}

/// Perception for simulate runs: there is never anything on screen.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlindPerception;

impl Perception for BlindPerception {
    fn capture(&self) -> Result<Option<Frame>> {
        Ok(None)
    }

    fn find_any(&self, _: &[PathBuf], _: f32) -> Result<Option<TemplateMatch>> {
        Ok(None)
    }

    fn find_all(&self, _: &[PathBuf], _: f32, _: usize) -> Result<Vec<TemplateMatch>> {
        Ok(Vec::new())
    }

    fn best_score(
        &self,
        _: &Frame,
        _: Option<&Region>,
        _: &[PathBuf],
    ) -> Result<Option<(PathBuf, f32)>> {
        Ok(None)
    }

    fn read_timer(&self, _: &Region) -> Result<Option<Duration>> {
        Ok(None)
    }

    fn average_brightness(&self, _: Option<&Region>) -> Result<Option<f32>> {
        Ok(None)
    }

    fn wait_for_any(
        &self,
        _: &[PathBuf],
        _: f32,
        _: Duration,
        _: Duration,
    ) -> Result<Option<TemplateMatch>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Hit, ScriptedPerception};

    #[test]
    fn blind_perception_sees_nothing_without_waiting() {
        let blind = BlindPerception;
        let start = Instant::now();
        let found = blind
            .wait_for_any(
                &[PathBuf::from("world_button.png")],
                0.8,
                Duration::from_secs(60),
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(found.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn template_name_is_file_stem() {
        assert_eq!(template_name(Path::new("/x/templates/back_button.png")), "back_button");
    }

    #[test]
    fn default_wait_polls_until_found() {
        let p = ScriptedPerception::new(vec![
            vec![],
            vec![],
            vec![Hit::at("world_button", (10, 10))],
        ]);
        let found = p
            .wait_for_any(
                &[PathBuf::from("world_button.png")],
                0.8,
                Duration::from_secs(5),
                Duration::from_millis(1),
            )
            .unwrap()
            .unwrap();
        assert_eq!(found.coord, (10, 10));
        assert_eq!(p.captures(), 3);
    }
}
