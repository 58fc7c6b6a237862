//! Actor appearance layers and their composition
//!
//! An actor's effective appearance is its Base with the selected Outfit and
//! then each selected Item folded on top, in selection order. Override
//! layers only touch what their [`LayerFilter`] permits.

use crate::error::Result;
use crate::glamour::{GlamourState, LayerFilter, ModScope};
use crate::metadata::MetadataSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use uuid::Uuid;

/// Where a layer exported from this machine lives on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileInfo {
    pub path: PathBuf,
    pub exported_at: DateTime<Utc>,
}

impl LocalFileInfo {
    pub fn new(path: PathBuf) -> Self {
        LocalFileInfo {
            path,
            exported_at: Utc::now(),
        }
    }
}

/// Content shared by every layer kind
#[derive(Debug, Clone, PartialEq)]
pub struct LayerData {
    /// File id of the container the layer came from
    pub id: Uuid,
    pub summary: MetadataSummary,
    /// Resolved `gamePath → filePath`
    pub mod_dict: BTreeMap<String, String>,
    /// Present only for layers exported from this machine
    pub local: Option<LocalFileInfo>,
}

impl LayerData {
    pub fn new(id: Uuid, summary: MetadataSummary, mod_dict: BTreeMap<String, String>) -> Self {
        LayerData {
            id,
            summary,
            mod_dict,
            local: None,
        }
    }

    pub fn with_local(mut self, local: LocalFileInfo) -> Self {
        self.local = Some(local);
        self
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }
}

/// Full appearance layer
#[derive(Debug, Clone, PartialEq)]
pub struct ActorBase {
    pub data: LayerData,
}

/// Override layer for a subset of the appearance
#[derive(Debug, Clone, PartialEq)]
pub struct ActorOutfit {
    pub data: LayerData,
    pub filter: LayerFilter,
}

/// Single-piece override layer
#[derive(Debug, Clone, PartialEq)]
pub struct ActorItem {
    pub data: LayerData,
    pub filter: LayerFilter,
}

/// A layer that overrides part of what lies below it
pub trait OverrideLayer {
    fn data(&self) -> &LayerData;
    fn filter(&self) -> &LayerFilter;
}

impl OverrideLayer for ActorOutfit {
    fn data(&self) -> &LayerData {
        &self.data
    }

    fn filter(&self) -> &LayerFilter {
        &self.filter
    }
}

impl OverrideLayer for ActorItem {
    fn data(&self) -> &LayerData {
        &self.data
    }

    fn filter(&self) -> &LayerFilter {
        &self.filter
    }
}

/// Composed appearance of one actor. Derived data: always recomputable from
/// the layers it was built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectiveState {
    pub mod_dict: BTreeMap<String, String>,
    pub glamour_state: GlamourState,
    pub manip_string: String,
    pub customize_data: String,
}

impl EffectiveState {
    /// Glamour snapshot as handed to the cosmetic layer
    pub fn glamour_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.glamour_state)?)
    }

    fn from_base(base: &ActorBase) -> Self {
        let summary = &base.data.summary;
        EffectiveState {
            mod_dict: base.data.mod_dict.clone(),
            glamour_state: summary.glamour_state.clone(),
            manip_string: summary.manipulation_string.clone(),
            customize_data: summary.customize_data.clone(),
        }
    }

    fn overlay<L: OverrideLayer + ?Sized>(&mut self, layer: &L) {
        let data = layer.data();
        let filter = layer.filter();

        overlay_mods(&mut self.mod_dict, &data.mod_dict, filter);
        self.glamour_state.overlay(&data.summary.glamour_state, filter);

        if filter.meta.manipulations && !data.summary.manipulation_string.is_empty() {
            self.manip_string = data.summary.manipulation_string.clone();
        }
        if filter.meta.customize_profile && !data.summary.customize_data.is_empty() {
            self.customize_data = data.summary.customize_data.clone();
        }
    }
}

/// Slot-scoped mods are replaced wholesale for every scope the layer both
/// defines and may touch; unclassified paths are overridden key by key.
fn overlay_mods(
    target: &mut BTreeMap<String, String>,
    layer: &BTreeMap<String, String>,
    filter: &LayerFilter,
) {
    let classified: Vec<(ModScope, &String, &String)> = layer
        .iter()
        .map(|(path, file)| (ModScope::classify(path), path, file))
        .collect();

    let replaced: BTreeSet<ModScope> = classified
        .iter()
        .map(|(scope, _, _)| *scope)
        .filter(|scope| *scope != ModScope::Other && filter.permits_scope(*scope))
        .collect();

    if !replaced.is_empty() {
        target.retain(|path, _| !replaced.contains(&ModScope::classify(path)));
    }

    for (scope, path, file) in classified {
        let permitted = if scope == ModScope::Other {
            filter.permits_scope(scope)
        } else {
            replaced.contains(&scope)
        };
        if permitted {
            target.insert(path.clone(), file.clone());
        }
    }
}

/// Fold `base`, then `outfit`, then `items` in order into one state.
///
/// Pure and deterministic: the same inputs always give the same output.
pub fn recalculate(
    base: &ActorBase,
    outfit: Option<&ActorOutfit>,
    items: &[&ActorItem],
) -> EffectiveState {
    let mut state = EffectiveState::from_base(base);
    if let Some(outfit) = outfit {
        state.overlay(outfit);
    }
    for item in items {
        state.overlay(*item);
    }
    state
}
