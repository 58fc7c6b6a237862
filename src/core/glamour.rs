//! Glamour state, equipment slots and layer filter criteria
//!
//! Outfit and Item layers override only the part of a Base they are allowed
//! to touch. What they may touch is described by a [`LayerFilter`]; which
//! part of the appearance a modded game path belongs to is decided by
//! [`ModScope::classify`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Equipment slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EquipSlot {
    MainHand,
    OffHand,
    Head,
    Body,
    Hands,
    Legs,
    Feet,
    Ears,
    Neck,
    Wrists,
    RFinger,
    LFinger,
}

impl EquipSlot {
    pub const ALL: [EquipSlot; 12] = [
        EquipSlot::MainHand,
        EquipSlot::OffHand,
        EquipSlot::Head,
        EquipSlot::Body,
        EquipSlot::Hands,
        EquipSlot::Legs,
        EquipSlot::Feet,
        EquipSlot::Ears,
        EquipSlot::Neck,
        EquipSlot::Wrists,
        EquipSlot::RFinger,
        EquipSlot::LFinger,
    ];

    pub fn is_weapon(self) -> bool {
        matches!(self, EquipSlot::MainHand | EquipSlot::OffHand)
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "met" => EquipSlot::Head,
            "top" => EquipSlot::Body,
            "glv" => EquipSlot::Hands,
            "dwn" => EquipSlot::Legs,
            "sho" => EquipSlot::Feet,
            "ear" => EquipSlot::Ears,
            "nek" => EquipSlot::Neck,
            "wrs" => EquipSlot::Wrists,
            "rir" => EquipSlot::RFinger,
            "ril" => EquipSlot::LFinger,
            _ => return None,
        })
    }
}

/// Which part of the appearance a modded game path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModScope {
    /// Equipment or accessory model/material/texture for one slot
    Slot(EquipSlot),
    /// Weapon assets (shared by main hand and off hand)
    Weapon,
    /// Anything else: body, face, hair, VFX, animations...
    Other,
}

fn equipment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^chara/(?:equipment|accessory)/[ea]\d{4}/.*?_(met|top|glv|dwn|sho|ear|nek|wrs|rir|ril)(?:[_.]|$)",
        )
        .expect("equipment path pattern is valid")
    })
}

impl ModScope {
    /// Classify a game path, e.g. `chara/equipment/e0123/model/c0101e0123_top.mdl`
    pub fn classify(game_path: &str) -> Self {
        let path = game_path.replace('\\', "/").to_ascii_lowercase();
        if path.starts_with("chara/weapon/") {
            return ModScope::Weapon;
        }
        equipment_pattern()
            .captures(&path)
            .and_then(|caps| caps.get(1))
            .and_then(|suffix| EquipSlot::from_suffix(suffix.as_str()))
            .map(ModScope::Slot)
            .unwrap_or(ModScope::Other)
    }
}

/// Glamour snapshot: equipment per slot plus keyed customization sections.
///
/// Values are opaque JSON owned by the cosmetic plugin; only the section and
/// key structure matters for layering. Maps are ordered so serialization is
/// byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GlamourState {
    #[serde(default)]
    pub equipment: BTreeMap<EquipSlot, Value>,
    #[serde(default)]
    pub customize: BTreeMap<String, Value>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub materials: BTreeMap<String, Value>,
}

impl GlamourState {
    pub fn is_empty(&self) -> bool {
        self.equipment.is_empty()
            && self.customize.is_empty()
            && self.parameters.is_empty()
            && self.materials.is_empty()
    }

    /// Apply `layer` on top of `self`, limited to what `filter` permits
    pub fn overlay(&mut self, layer: &GlamourState, filter: &LayerFilter) {
        if filter.parts.contains(&ApplyPart::Equipment) {
            for (slot, value) in &layer.equipment {
                if filter.slots.contains(slot) {
                    self.equipment.insert(*slot, value.clone());
                }
            }
        }
        let sections = [
            (ApplyPart::Customize, &mut self.customize, &layer.customize),
            (ApplyPart::Parameters, &mut self.parameters, &layer.parameters),
            (ApplyPart::Materials, &mut self.materials, &layer.materials),
        ];
        for (part, target, source) in sections {
            if filter.parts.contains(&part) {
                for (key, value) in source {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Appearance section an override layer may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApplyPart {
    Equipment,
    Customize,
    Parameters,
    Materials,
    /// Mods on game paths that belong to no equipment slot
    OtherMods,
}

impl ApplyPart {
    pub const ALL: [ApplyPart; 5] = [
        ApplyPart::Equipment,
        ApplyPart::Customize,
        ApplyPart::Parameters,
        ApplyPart::Materials,
        ApplyPart::OtherMods,
    ];
}

/// Meta overrides an override layer may apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetaFilter {
    /// Replace the mod-manipulation string
    pub manipulations: bool,
    /// Replace the customize-profile blob
    pub customize_profile: bool,
}

/// Filter criteria carried by Outfit and Item layers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerFilter {
    #[serde(default)]
    pub parts: BTreeSet<ApplyPart>,
    #[serde(default)]
    pub slots: BTreeSet<EquipSlot>,
    #[serde(default)]
    pub meta: MetaFilter,
}

impl LayerFilter {
    /// Permit everything
    pub fn all() -> Self {
        LayerFilter {
            parts: ApplyPart::ALL.into_iter().collect(),
            slots: EquipSlot::ALL.into_iter().collect(),
            meta: MetaFilter {
                manipulations: true,
                customize_profile: true,
            },
        }
    }

    /// Equipment-only filter for the given slots
    pub fn equipment<I: IntoIterator<Item = EquipSlot>>(slots: I) -> Self {
        LayerFilter {
            parts: [ApplyPart::Equipment].into_iter().collect(),
            slots: slots.into_iter().collect(),
            meta: MetaFilter::default(),
        }
    }

    pub fn with_part(mut self, part: ApplyPart) -> Self {
        self.parts.insert(part);
        self
    }

    pub fn with_meta(mut self, meta: MetaFilter) -> Self {
        self.meta = meta;
        self
    }

    /// Whether mods in `scope` may be overridden
    pub fn permits_scope(&self, scope: ModScope) -> bool {
        match scope {
            ModScope::Slot(slot) => self.slots.contains(&slot),
            ModScope::Weapon => self.slots.iter().any(|slot| slot.is_weapon()),
            ModScope::Other => self.parts.contains(&ApplyPart::OtherMods),
        }
    }
}
