//! In-memory store of layers, actor records and their effective states
//!
//! Every mutation takes the single write lock, updates the store and
//! recomputes the effective state of each affected actor before releasing
//! it. Readers therefore never see a state older than the last mutation.

use crate::actor::{recalculate, ActorBase, ActorItem, ActorOutfit, EffectiveState};
use crate::error::{Result, SmaError};
use crate::metadata::DescriptorDocument;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// An actor: one Base, an optional selected Outfit and ordered Items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorRecord {
    pub id: Uuid,
    pub name: String,
    pub base: Uuid,
    pub selected_outfit: Option<Uuid>,
    pub selected_items: Vec<Uuid>,
    pub available_outfits: Vec<Uuid>,
    pub available_items: Vec<Uuid>,
}

impl ActorRecord {
    fn references(&self, layer: Uuid) -> bool {
        self.base == layer
            || self.available_outfits.contains(&layer)
            || self.available_items.contains(&layer)
    }
}

#[derive(Default)]
struct StoreInner {
    bases: HashMap<Uuid, Arc<ActorBase>>,
    outfits: HashMap<Uuid, Arc<ActorOutfit>>,
    items: HashMap<Uuid, Arc<ActorItem>>,
    actors: HashMap<Uuid, ActorRecord>,
    effective: HashMap<Uuid, Arc<EffectiveState>>,
}

impl StoreInner {
    fn compute(&self, actor: &ActorRecord) -> Result<EffectiveState> {
        let base = self
            .bases
            .get(&actor.base)
            .ok_or(SmaError::UnknownLayer(actor.base))?;
        let outfit = match actor.selected_outfit {
            Some(id) => Some(self.outfits.get(&id).ok_or(SmaError::UnknownLayer(id))?),
            None => None,
        };
        let items = actor
            .selected_items
            .iter()
            .map(|id| {
                self.items
                    .get(id)
                    .map(|item| item.as_ref())
                    .ok_or(SmaError::UnknownLayer(*id))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(recalculate(base, outfit.map(|o| o.as_ref()), &items))
    }

    fn refresh(&mut self, actor_id: Uuid) -> Result<()> {
        let actor = self
            .actors
            .get(&actor_id)
            .ok_or(SmaError::UnknownLayer(actor_id))?;
        let state = self.compute(actor)?;
        debug!("Recomputed effective state of actor {}", actor_id);
        self.effective.insert(actor_id, Arc::new(state));
        Ok(())
    }

    fn refresh_referencing(&mut self, layer: Uuid) -> Result<()> {
        let affected: Vec<Uuid> = self
            .actors
            .values()
            .filter(|actor| actor.references(layer))
            .map(|actor| actor.id)
            .collect();
        for actor_id in affected {
            self.refresh(actor_id)?;
        }
        Ok(())
    }

    fn in_use(&self, layer: Uuid) -> bool {
        self.actors.values().any(|actor| actor.references(layer))
    }

    /// Apply `change` to a copy of the record; commit only if the new
    /// record composes
    fn update_actor<F>(&mut self, actor_id: Uuid, change: F) -> Result<()>
    where
        F: FnOnce(&mut ActorRecord, &StoreInner) -> Result<()>,
    {
        let mut record = self
            .actors
            .get(&actor_id)
            .cloned()
            .ok_or(SmaError::UnknownLayer(actor_id))?;
        change(&mut record, self)?;
        let state = self.compute(&record)?;
        self.actors.insert(actor_id, record);
        self.effective.insert(actor_id, Arc::new(state));
        Ok(())
    }
}

/// Thread-safe layer registry
#[derive(Default)]
pub struct ActorDataStore {
    inner: RwLock<StoreInner>,
}

impl ActorDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a Base; actors using it are recomputed
    pub fn insert_base(&self, base: ActorBase) -> Result<Uuid> {
        let id = base.data.id;
        let mut inner = self.inner.write();
        inner.bases.insert(id, Arc::new(base));
        inner.refresh_referencing(id)?;
        info!("Registered base {}", id);
        Ok(id)
    }

    pub fn insert_outfit(&self, outfit: ActorOutfit) -> Result<Uuid> {
        let id = outfit.data.id;
        let mut inner = self.inner.write();
        inner.outfits.insert(id, Arc::new(outfit));
        inner.refresh_referencing(id)?;
        info!("Registered outfit {}", id);
        Ok(id)
    }

    pub fn insert_item(&self, item: ActorItem) -> Result<Uuid> {
        let id = item.data.id;
        let mut inner = self.inner.write();
        inner.items.insert(id, Arc::new(item));
        inner.refresh_referencing(id)?;
        info!("Registered item {}", id);
        Ok(id)
    }

    /// Remove a layer of any kind; refused while an actor references it
    pub fn remove_layer(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.in_use(id) {
            return Err(SmaError::LayerInUse(id));
        }
        let removed = inner.bases.remove(&id).is_some()
            || inner.outfits.remove(&id).is_some()
            || inner.items.remove(&id).is_some();
        if !removed {
            return Err(SmaError::UnknownLayer(id));
        }
        info!("Removed layer {}", id);
        Ok(())
    }

    /// Create an actor over an existing Base
    pub fn create_actor(&self, name: impl Into<String>, base: Uuid) -> Result<Uuid> {
        let record = ActorRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            base,
            selected_outfit: None,
            selected_items: Vec::new(),
            available_outfits: Vec::new(),
            available_items: Vec::new(),
        };
        self.insert_actor(record)
    }

    /// Create an actor from an imported descriptor; every referenced layer
    /// must already be registered
    pub fn create_actor_from_descriptor(&self, descriptor: &DescriptorDocument) -> Result<Uuid> {
        let mut available_outfits = descriptor.outfits.clone();
        if let Some(selected) = descriptor.selected_outfit {
            if !available_outfits.contains(&selected) {
                available_outfits.push(selected);
            }
        }
        let mut available_items = descriptor.items.clone();
        for selected in &descriptor.selected_items {
            if !available_items.contains(selected) {
                available_items.push(*selected);
            }
        }

        let record = ActorRecord {
            id: Uuid::new_v4(),
            name: descriptor.name.clone(),
            base: descriptor.base,
            selected_outfit: descriptor.selected_outfit,
            selected_items: descriptor.selected_items.clone(),
            available_outfits,
            available_items,
        };
        self.insert_actor(record)
    }

    fn insert_actor(&self, record: ActorRecord) -> Result<Uuid> {
        let mut inner = self.inner.write();
        for id in &record.available_outfits {
            if !inner.outfits.contains_key(id) {
                return Err(SmaError::UnknownLayer(*id));
            }
        }
        for id in &record.available_items {
            if !inner.items.contains_key(id) {
                return Err(SmaError::UnknownLayer(*id));
            }
        }
        let state = inner.compute(&record)?;
        let id = record.id;
        info!("Created actor {} ({:?})", id, record.name);
        inner.actors.insert(id, record);
        inner.effective.insert(id, Arc::new(state));
        Ok(id)
    }

    pub fn remove_actor(&self, actor_id: Uuid) -> Result<ActorRecord> {
        let mut inner = self.inner.write();
        inner.effective.remove(&actor_id);
        inner
            .actors
            .remove(&actor_id)
            .ok_or(SmaError::UnknownLayer(actor_id))
    }

    /// Select an outfit (or none); the outfit becomes available to the actor
    pub fn select_outfit(&self, actor_id: Uuid, outfit: Option<Uuid>) -> Result<()> {
        self.inner.write().update_actor(actor_id, |record, inner| {
            if let Some(id) = outfit {
                if !inner.outfits.contains_key(&id) {
                    return Err(SmaError::UnknownLayer(id));
                }
                if !record.available_outfits.contains(&id) {
                    record.available_outfits.push(id);
                }
            }
            record.selected_outfit = outfit;
            Ok(())
        })
    }

    /// Append an item to the selection; selecting twice is a no-op
    pub fn select_item(&self, actor_id: Uuid, item: Uuid) -> Result<()> {
        self.inner.write().update_actor(actor_id, |record, inner| {
            if !inner.items.contains_key(&item) {
                return Err(SmaError::UnknownLayer(item));
            }
            if !record.available_items.contains(&item) {
                record.available_items.push(item);
            }
            if !record.selected_items.contains(&item) {
                record.selected_items.push(item);
            }
            Ok(())
        })
    }

    pub fn deselect_item(&self, actor_id: Uuid, item: Uuid) -> Result<()> {
        self.inner.write().update_actor(actor_id, |record, _| {
            record.selected_items.retain(|id| *id != item);
            Ok(())
        })
    }

    /// Replace the item order; `order` must be a permutation of the current
    /// selection
    pub fn reorder_items(&self, actor_id: Uuid, order: Vec<Uuid>) -> Result<()> {
        self.inner.write().update_actor(actor_id, |record, _| {
            let mut current = record.selected_items.clone();
            let mut proposed = order.clone();
            current.sort();
            proposed.sort();
            if current != proposed {
                return Err(SmaError::Malformed(
                    "item order must be a permutation of the current selection".into(),
                ));
            }
            record.selected_items = order;
            Ok(())
        })
    }

    /// Drop a layer from an actor's available lists (and selection)
    pub fn detach_layer(&self, actor_id: Uuid, layer: Uuid) -> Result<()> {
        self.inner.write().update_actor(actor_id, |record, _| {
            if record.base == layer {
                return Err(SmaError::LayerInUse(layer));
            }
            record.available_outfits.retain(|id| *id != layer);
            record.available_items.retain(|id| *id != layer);
            record.selected_items.retain(|id| *id != layer);
            if record.selected_outfit == Some(layer) {
                record.selected_outfit = None;
            }
            Ok(())
        })
    }

    pub fn effective_state(&self, actor_id: Uuid) -> Result<Arc<EffectiveState>> {
        self.inner
            .read()
            .effective
            .get(&actor_id)
            .cloned()
            .ok_or(SmaError::UnknownLayer(actor_id))
    }

    pub fn actor(&self, actor_id: Uuid) -> Option<ActorRecord> {
        self.inner.read().actors.get(&actor_id).cloned()
    }

    pub fn actors(&self) -> Vec<ActorRecord> {
        let mut actors: Vec<_> = self.inner.read().actors.values().cloned().collect();
        actors.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        actors
    }

    pub fn base(&self, id: Uuid) -> Option<Arc<ActorBase>> {
        self.inner.read().bases.get(&id).cloned()
    }

    pub fn outfit(&self, id: Uuid) -> Option<Arc<ActorOutfit>> {
        self.inner.read().outfits.get(&id).cloned()
    }

    pub fn item(&self, id: Uuid) -> Option<Arc<ActorItem>> {
        self.inner.read().items.get(&id).cloned()
    }

    /// (bases, outfits, items)
    pub fn layer_counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.read();
        (inner.bases.len(), inner.outfits.len(), inner.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::LayerData;
    use crate::glamour::{EquipSlot, LayerFilter};
    use crate::metadata::MetadataSummary;
    use std::collections::BTreeMap;

    const HEAD: &str = "chara/equipment/e0001/model/c0101e0001_met.mdl";

    fn layer(name: &str, head_file: &str) -> LayerData {
        let mut mods = BTreeMap::new();
        mods.insert(HEAD.to_string(), head_file.to_string());
        LayerData::new(Uuid::new_v4(), MetadataSummary::new(name), mods)
    }

    fn setup() -> (ActorDataStore, Uuid, Uuid, Uuid) {
        let store = ActorDataStore::new();
        let base = store
            .insert_base(ActorBase { data: layer("base", "/base.mdl") })
            .unwrap();
        let item = store
            .insert_item(ActorItem {
                data: layer("hat", "/hat.mdl"),
                filter: LayerFilter::equipment([EquipSlot::Head]),
            })
            .unwrap();
        let actor = store.create_actor("Alex", base).unwrap();
        (store, base, item, actor)
    }

    #[test]
    fn test_select_recomputes_eagerly() {
        let (store, _, item, actor) = setup();
        assert_eq!(store.effective_state(actor).unwrap().mod_dict[HEAD], "/base.mdl");

        store.select_item(actor, item).unwrap();
        assert_eq!(store.effective_state(actor).unwrap().mod_dict[HEAD], "/hat.mdl");

        store.deselect_item(actor, item).unwrap();
        assert_eq!(store.effective_state(actor).unwrap().mod_dict[HEAD], "/base.mdl");
    }

    #[test]
    fn test_replacing_layer_refreshes_actor() {
        let (store, base, _, actor) = setup();
        let mut replacement = ActorBase { data: layer("base v2", "/base2.mdl") };
        replacement.data.id = base;
        store.insert_base(replacement).unwrap();
        assert_eq!(store.effective_state(actor).unwrap().mod_dict[HEAD], "/base2.mdl");
    }

    #[test]
    fn test_remove_layer_in_use_refused() {
        let (store, base, item, actor) = setup();
        store.select_item(actor, item).unwrap();

        assert!(matches!(store.remove_layer(base), Err(SmaError::LayerInUse(_))));
        assert!(matches!(store.remove_layer(item), Err(SmaError::LayerInUse(_))));

        store.detach_layer(actor, item).unwrap();
        store.remove_layer(item).unwrap();
        assert!(matches!(store.remove_layer(item), Err(SmaError::UnknownLayer(_))));
        assert_eq!(store.layer_counts(), (1, 0, 0));
    }

    #[test]
    fn test_unknown_references_rejected_without_change() {
        let (store, base, _, actor) = setup();
        assert!(store.create_actor("ghost", Uuid::new_v4()).is_err());
        assert!(store.select_outfit(actor, Some(Uuid::new_v4())).is_err());
        let record = store.actor(actor).unwrap();
        assert_eq!(record.base, base);
        assert_eq!(record.selected_outfit, None);
    }

    #[test]
    fn test_reorder_requires_permutation() {
        let (store, _, item, actor) = setup();
        let second = store
            .insert_item(ActorItem {
                data: layer("crown", "/crown.mdl"),
                filter: LayerFilter::equipment([EquipSlot::Head]),
            })
            .unwrap();
        store.select_item(actor, item).unwrap();
        store.select_item(actor, second).unwrap();
        assert_eq!(store.effective_state(actor).unwrap().mod_dict[HEAD], "/crown.mdl");

        store.reorder_items(actor, vec![second, item]).unwrap();
        assert_eq!(store.effective_state(actor).unwrap().mod_dict[HEAD], "/hat.mdl");

        assert!(store.reorder_items(actor, vec![item]).is_err());
    }

    #[test]
    fn test_descriptor_creates_actor() {
        let (store, base, item, _) = setup();
        let descriptor = DescriptorDocument {
            name: "from file".into(),
            base,
            outfits: vec![],
            items: vec![item],
            selected_outfit: None,
            selected_items: vec![item],
        };
        let actor = store.create_actor_from_descriptor(&descriptor).unwrap();
        assert_eq!(store.effective_state(actor).unwrap().mod_dict[HEAD], "/hat.mdl");

        let missing = DescriptorDocument {
            items: vec![Uuid::new_v4()],
            ..descriptor
        };
        assert!(store.create_actor_from_descriptor(&missing).is_err());
    }
}
