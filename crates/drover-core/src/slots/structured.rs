use super::{SlotActivity, SlotSource, SlotSourceKind, SlotStatus};
use crate::config::{LayoutConfig, SlotConfig, SlotLayoutConfig};
use crate::diagnostics::TargetLog;
use crate::error::Result;
use crate::perception::Perception;
use std::path::PathBuf;

struct ActivityProbe {
    key: String,
    activity: SlotActivity,
    templates: Vec<PathBuf>,
}

/// Samples every configured slot region against the activity templates.
pub struct StructuredSlotSource {
    slots: Vec<SlotConfig>,
    probes: Vec<ActivityProbe>,
    threshold: f32,
}

impl StructuredSlotSource {
    pub fn new(layout: &LayoutConfig, config: &SlotLayoutConfig, log: &TargetLog) -> Self {
        let probes = config
            .activity_templates
            .iter()
            .filter_map(|entry| {
                let templates: Vec<PathBuf> = entry
                    .templates
                    .iter()
                    .filter(|t| !t.trim().is_empty())
                    .flat_map(|t| layout.resolve_template(t))
                    .collect();
                if templates.is_empty() {
                    log.warn(format!(
                        "no usable templates for slot activity '{}'",
                        entry.activity
                    ));
                    return None;
                }
                Some(ActivityProbe {
                    key: entry.activity.clone(),
                    activity: SlotActivity::from_key(&entry.activity),
                    templates,
                })
            })
            .collect();
        Self {
            slots: config.slots.clone(),
            probes,
            threshold: config.detection_threshold,
        }
    }
}

impl SlotSource for StructuredSlotSource {
    fn sample(&self, vision: &dyn Perception) -> Result<Vec<SlotStatus>> {
        let Some(frame) = vision.capture()? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let mut best: Option<(&ActivityProbe, f32)> = None;
            for probe in &self.probes {
                let Some((_, score)) =
                    vision.best_score(&frame, Some(&slot.indicator_region), &probe.templates)?
                else {
                    continue;
                };
                // Strictly greater: on a tie the activity declared first wins.
                if score >= self.threshold && best.map_or(true, |(_, s)| score > s) {
                    best = Some((probe, score));
                }
            }
            let (activity, activity_key, confidence) = match best {
                Some((probe, score)) => (probe.activity, probe.key.clone(), Some(score)),
                None => (SlotActivity::Idle, "idle".to_string(), None),
            };
            out.push(SlotStatus {
                slot_id: slot.id.clone(),
                tap: slot.tap,
                activity,
                activity_key,
                confidence,
                label: slot.label.clone(),
                source: SlotSourceKind::Detector,
                reference_coord: slot.tap,
            });
        }
        Ok(out)
    }

    fn has_identity(&self) -> bool {
        true
    }
}
