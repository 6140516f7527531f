//! Test doubles shared by the unit tests of several modules.

use crate::channel::{ControlChannel, Transport, TransportError};
use crate::config::{Config, Coord, Region};
use crate::diagnostics::TargetLog;
use crate::error::Result;
use crate::perception::{template_name, Frame, Perception, TemplateMatch};
use crate::quota::QuotaStore;
use crate::task::TaskContext;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

type Reply = std::result::Result<Vec<u8>, TransportError>;

#[derive(Default)]
struct FakeState {
    calls: Vec<Vec<String>>,
    queue: VecDeque<Reply>,
    rules: Vec<(String, usize, TransportError)>,
}

/// Records every invocation. Replies come from matching rules first, then
/// from the queue, and default to success with empty output.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: Reply) {
        self.state.lock().unwrap().queue.push_back(reply);
    }

    /// Fail the next `times` calls whose joined argv contains `needle`.
    pub fn fail_matching(&self, needle: &str, times: usize, err: TransportError) {
        self.state
            .lock()
            .unwrap()
            .rules
            .push((needle.to_string(), times, err));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.join(" ").contains(needle))
            .count()
    }

    /// Coordinates of every `input tap`, in order.
    pub fn taps(&self) -> Vec<Coord> {
        self.calls()
            .iter()
            .filter_map(|c| {
                let pos = c.iter().position(|a| a == "tap")?;
                let x = c.get(pos + 1)?.parse().ok()?;
                let y = c.get(pos + 2)?.parse().ok()?;
                Some((x, y))
            })
            .collect()
    }
}

impl Transport for FakeTransport {
    fn exec(&self, args: &[String], _: Duration, _: bool) -> Reply {
        let mut state = self.state.lock().unwrap();
        state.calls.push(args.to_vec());
        let joined = args.join(" ");
        for (needle, remaining, err) in state.rules.iter_mut() {
            if *remaining > 0 && joined.contains(needle.as_str()) {
                *remaining -= 1;
                return Err(err.clone());
            }
        }
        state.queue.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedPerception
// ---------------------------------------------------------------------------

/// Something visible on a scripted screen.
#[derive(Debug, Clone)]
pub(crate) struct Hit {
    pub template: String,
    pub coord: Coord,
    pub score: f32,
    /// Only counts for `best_score` calls on this region; `None` means anywhere.
    pub region: Option<Region>,
}

impl Hit {
    pub fn at(template: &str, coord: Coord) -> Self {
        Self {
            template: template.to_string(),
            coord,
            score: 0.95,
            region: None,
        }
    }

    pub fn scored(template: &str, score: f32) -> Self {
        Self {
            template: template.to_string(),
            coord: (0, 0),
            score,
            region: None,
        }
    }

    pub fn in_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }
}

/// A sequence of screens; each capture advances one screen and the last one
/// stays up for good.
pub(crate) struct ScriptedPerception {
    pending: Mutex<VecDeque<Vec<Hit>>>,
    current: Mutex<Option<Vec<Hit>>>,
    frames: Mutex<Vec<Vec<Hit>>>,
    captures: AtomicUsize,
    blind: bool,
    timer: Mutex<Option<Duration>>,
    capture_delay: Duration,
}

impl ScriptedPerception {
    pub fn new(screens: Vec<Vec<Hit>>) -> Self {
        Self {
            pending: Mutex::new(screens.into()),
            current: Mutex::new(None),
            frames: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
            blind: false,
            timer: Mutex::new(None),
            capture_delay: Duration::ZERO,
        }
    }

    /// Every capture takes this long, like a real device round trip.
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Always shows the same screen.
    pub fn steady(screen: Vec<Hit>) -> Self {
        Self::new(vec![screen])
    }

    /// Never produces a frame.
    pub fn blind() -> Self {
        Self {
            blind: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn set_timer(&self, timer: Option<Duration>) {
        *self.timer.lock().unwrap() = timer;
    }

    pub fn push_screen(&self, screen: Vec<Hit>) {
        self.pending.lock().unwrap().push_back(screen);
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    fn next_screen(&self) -> Vec<Hit> {
        let mut current = self.current.lock().unwrap();
        if let Some(next) = self.pending.lock().unwrap().pop_front() {
            *current = Some(next);
        }
        current.clone().unwrap_or_default()
    }

    fn frame_hits(&self, frame: &Frame) -> Vec<Hit> {
        let mut id = [0u8; 8];
        id.copy_from_slice(&frame.png[..8]);
        let idx = u64::from_le_bytes(id) as usize;
        self.frames.lock().unwrap().get(idx).cloned().unwrap_or_default()
    }

    fn matches(hits: &[Hit], templates: &[PathBuf], threshold: f32) -> Vec<TemplateMatch> {
        let mut out = Vec::new();
        for template in templates {
            let name = template_name(template);
            for hit in hits {
                if hit.template == name && hit.score >= threshold {
                    out.push(TemplateMatch {
                        coord: hit.coord,
                        template: template.clone(),
                        score: Some(hit.score),
                    });
                }
            }
        }
        out
    }
}

impl Perception for ScriptedPerception {
    fn capture(&self) -> Result<Option<Frame>> {
        if self.blind {
            return Ok(None);
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        if !self.capture_delay.is_zero() {
            std::thread::sleep(self.capture_delay);
        }
        let hits = self.next_screen();
        let mut frames = self.frames.lock().unwrap();
        let idx = frames.len() as u64;
        frames.push(hits);
        Ok(Some(Frame::new(idx.to_le_bytes().to_vec())))
    }

    fn find_any(&self, templates: &[PathBuf], threshold: f32) -> Result<Option<TemplateMatch>> {
        let Some(frame) = self.capture()? else {
            return Ok(None);
        };
        let hits = self.frame_hits(&frame);
        Ok(Self::matches(&hits, templates, threshold).into_iter().next())
    }

    fn find_all(
        &self,
        templates: &[PathBuf],
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<TemplateMatch>> {
        let Some(frame) = self.capture()? else {
            return Ok(Vec::new());
        };
        let hits = self.frame_hits(&frame);
        let mut found = Self::matches(&hits, templates, threshold);
        found.truncate(max_results);
        Ok(found)
    }

    fn best_score(
        &self,
        frame: &Frame,
        region: Option<&Region>,
        templates: &[PathBuf],
    ) -> Result<Option<(PathBuf, f32)>> {
        let hits = self.frame_hits(frame);
        let mut best: Option<(PathBuf, f32)> = None;
        for template in templates {
            let name = template_name(template);
            for hit in &hits {
                let in_region = match (&hit.region, region) {
                    (None, _) => true,
                    (Some(h), Some(r)) => h == r,
                    (Some(_), None) => false,
                };
                if hit.template == name
                    && in_region
                    && best.as_ref().map_or(true, |(_, s)| hit.score > *s)
                {
                    best = Some((template.clone(), hit.score));
                }
            }
        }
        Ok(best)
    }

    fn read_timer(&self, _: &Region) -> Result<Option<Duration>> {
        Ok(*self.timer.lock().unwrap())
    }

    fn average_brightness(&self, _: Option<&Region>) -> Result<Option<f32>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Rig: one target wired to fakes, for task tests
// ---------------------------------------------------------------------------

pub(crate) struct Rig {
    pub config: Config,
    pub transport: FakeTransport,
    pub channel: ControlChannel,
    pub quota: Option<QuotaStore>,
    pub dir: tempfile::TempDir,
}

impl Rig {
    /// Wires the first target of `yaml` to a fake transport.
    pub fn new(yaml: &str) -> Self {
        let config = Config::from_yaml(yaml).unwrap();
        let transport = FakeTransport::new();
        let target = &config.targets[0];
        let channel = ControlChannel::new(
            Box::new(transport.clone()),
            &config.adb,
            target.device_port,
            TargetLog::new(target.name.clone(), None),
        )
        .with_reconnect_pause(std::time::Duration::ZERO);
        Self {
            config,
            transport,
            channel,
            quota: None,
            dir: tempfile::TempDir::new().unwrap(),
        }
    }

    pub fn with_quota(mut self, limits: &[(&str, u32)]) -> Self {
        let limits: BTreeMap<String, u32> =
            limits.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        self.quota = Some(QuotaStore::open(
            &self.dir.path().join("daily.json"),
            0,
            &limits,
        ));
        self
    }

    pub fn ctx<'a>(&'a mut self, vision: &'a dyn Perception) -> TaskContext<'a> {
        let target = &self.config.targets[0];
        TaskContext {
            config: &self.config,
            target,
            layout: self.config.layout_for(target).unwrap(),
            channel: &self.channel,
            vision,
            quota: self.quota.as_mut(),
            log: self.channel.log().clone(),
            simulate: false,
        }
    }
}

/// One target, a slotted layout and a plain (resting-icon) layout.
pub(crate) const FARM_YAML: &str = r#"
targets:
  - { name: farm1, instance: Pie64, device_port: 5555, routine: daily }
routines:
  daily:
    tasks:
      - task: tap_buttons
        params: { buttons: [mail] }
layouts:
  slotted:
    buttons:
      march: [400, 800]
      close_popup: [270, 440]
      mail: [10, 20]
      claim: [30, 40]
    slots:
      slots:
        - { id: a, tap: [100, 100], indicator_region: { y: [0.1, 0.2], x: [0.0, 0.1] } }
        - { id: b, tap: [100, 200], indicator_region: { y: [0.2, 0.3], x: [0.0, 0.1] }, label: beta }
      activity_templates:
        - { activity: march, templates: [march] }
        - { activity: gather, templates: [gather] }
        - { activity: returning, templates: [returning] }
      detection_threshold: 0.8
    templates:
      march: march.png
      gather: gather.png
      returning: returning.png
      popup_close: popup_close.png
      back_button: back_button.png
  plain:
    buttons:
      march: [400, 800]
    templates:
      resting_icon: resting_icon.png
default_layout: slotted
"#;
