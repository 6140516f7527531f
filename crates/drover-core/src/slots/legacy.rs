use super::{SlotActivity, SlotSource, SlotSourceKind, SlotStatus};
use crate::config::LayoutConfig;
use crate::error::Result;
use crate::perception::Perception;
use std::path::PathBuf;

/// Synthesizes idle slots from resting-icon matches.
///
/// Ids are positional (`legacy_0`, `legacy_1`, ...) and mean nothing across
/// samples, so this source reports no identity.
pub struct LegacySlotSource {
    templates: Vec<PathBuf>,
    threshold: f32,
    max_matches: usize,
}

impl LegacySlotSource {
    pub fn new(layout: &LayoutConfig) -> Self {
        let icon = &layout.resting_icon;
        Self {
            templates: icon
                .templates
                .iter()
                .flat_map(|t| layout.resolve_template(t))
                .collect(),
            threshold: icon.threshold,
            max_matches: icon.max_matches,
        }
    }
}

impl SlotSource for LegacySlotSource {
    fn sample(&self, vision: &dyn Perception) -> Result<Vec<SlotStatus>> {
        let matches = vision.find_all(&self.templates, self.threshold, self.max_matches)?;
        Ok(matches
            .into_iter()
            .enumerate()
            .map(|(idx, m)| SlotStatus {
                slot_id: format!("legacy_{idx}"),
                tap: m.coord,
                activity: SlotActivity::Idle,
                activity_key: "legacy".to_string(),
                confidence: m.score,
                label: None,
                source: SlotSourceKind::Synthetic,
                reference_coord: m.coord,
            })
            .collect())
    }

    fn has_identity(&self) -> bool {
        false
    }
}
