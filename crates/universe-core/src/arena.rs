//! In-memory working set owned by the tick orchestrator for the duration of a tick.

use crate::model::{Particle, ParticleId, TraitVector};
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashMap, HashSet};

new_key_type! {
    /// Generational handle into a [`WorldArena`].
    pub struct ParticleKey;
}

/// A particle together with its current trait vector.
#[derive(Debug, Clone)]
pub struct ParticleEntry {
    pub particle: Particle,
    pub traits: Option<TraitVector>,
    /// Set when `traits` holds a vector that has not been persisted yet.
    pub traits_changed: bool,
}

/// Slot-map backed particle collection with stable iteration order and dirty tracking.
#[derive(Debug, Default)]
pub struct WorldArena {
    slots: SlotMap<ParticleKey, ParticleEntry>,
    order: Vec<ParticleKey>,
    by_id: HashMap<ParticleId, ParticleKey>,
    dirty: HashSet<ParticleKey>,
    spawned: HashSet<ParticleKey>,
}

impl WorldArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an arena with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            order: Vec::with_capacity(capacity),
            by_id: HashMap::with_capacity(capacity),
            dirty: HashSet::new(),
            spawned: HashSet::new(),
        }
    }

    /// Build an arena from loaded particles and their current traits.
    pub fn from_loaded<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Particle, Option<TraitVector>)>,
    {
        let entries = entries.into_iter();
        let mut arena = Self::with_capacity(entries.size_hint().0);
        for (particle, traits) in entries {
            arena.insert(particle, traits);
        }
        arena
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert a loaded particle. An existing entry with the same id is replaced in place.
    pub fn insert(&mut self, particle: Particle, traits: Option<TraitVector>) -> ParticleKey {
        let entry = ParticleEntry {
            particle,
            traits,
            traits_changed: false,
        };
        if let Some(&key) = self.by_id.get(&entry.particle.id)
            && let Some(slot) = self.slots.get_mut(key)
        {
            *slot = entry;
            return key;
        }
        let id = entry.particle.id;
        let key = self.slots.insert(entry);
        self.order.push(key);
        self.by_id.insert(id, key);
        key
    }

    /// Insert a particle created during this tick. It is dirty and marked as spawned.
    pub fn spawn(&mut self, particle: Particle, traits: TraitVector) -> ParticleKey {
        let key = self.insert(particle, Some(traits));
        if let Some(entry) = self.slots.get_mut(key) {
            entry.traits_changed = true;
        }
        self.dirty.insert(key);
        self.spawned.insert(key);
        key
    }

    /// Handles in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = ParticleKey> + '_ {
        self.order.iter().copied()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ParticleKey, &ParticleEntry)> + '_ {
        self.order
            .iter()
            .filter_map(|&key| self.slots.get(key).map(|entry| (key, entry)))
    }

    #[must_use]
    pub fn get(&self, key: ParticleKey) -> Option<&ParticleEntry> {
        self.slots.get(key)
    }

    /// Mutable access. Callers that change the particle must call [`Self::mark_dirty`].
    pub fn get_mut(&mut self, key: ParticleKey) -> Option<&mut ParticleEntry> {
        self.slots.get_mut(key)
    }

    /// Exclusive access to two distinct entries at once.
    pub fn pair_mut(
        &mut self,
        a: ParticleKey,
        b: ParticleKey,
    ) -> Option<[&mut ParticleEntry; 2]> {
        self.slots.get_disjoint_mut([a, b])
    }

    #[must_use]
    pub fn key_of(&self, id: ParticleId) -> Option<ParticleKey> {
        self.by_id.get(&id).copied()
    }

    pub fn mark_dirty(&mut self, key: ParticleKey) {
        self.dirty.insert(key);
    }

    #[must_use]
    pub fn is_dirty(&self, key: ParticleKey) -> bool {
        self.dirty.contains(&key)
    }

    /// True for particles created during the current tick.
    #[must_use]
    pub fn is_spawned(&self, key: ParticleKey) -> bool {
        self.spawned.contains(&key)
    }

    /// Dirty entries in insertion order.
    pub fn dirty_entries(&self) -> impl Iterator<Item = (ParticleKey, &ParticleEntry)> + '_ {
        self.iter().filter(|(key, _)| self.dirty.contains(key))
    }

    /// Forget dirty and spawned markers once a tick has been persisted.
    pub fn clear_tick_marks(&mut self) {
        self.dirty.clear();
        self.spawned.clear();
        for entry in self.slots.values_mut() {
            entry.traits_changed = false;
        }
    }

    /// Drop every particle in a terminal state, preserving the order of the rest.
    pub fn retain_live(&mut self) -> usize {
        let before = self.order.len();
        let slots = &mut self.slots;
        let by_id = &mut self.by_id;
        self.order.retain(|&key| {
            let live = slots
                .get(key)
                .is_some_and(|entry| entry.particle.state.is_live());
            if !live && let Some(entry) = slots.remove(key) {
                by_id.remove(&entry.particle.id);
            }
            live
        });
        self.dirty.retain(|key| self.slots.contains_key(*key));
        self.spawned.retain(|key| self.slots.contains_key(*key));
        before - self.order.len()
    }

    /// Copies of every particle in insertion order.
    #[must_use]
    pub fn particles(&self) -> Vec<Particle> {
        self.iter().map(|(_, entry)| entry.particle.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParticleState, Position};
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    fn particle(n: u128) -> Particle {
        let now: DateTime<Utc> = DateTime::from_timestamp(0, 0).expect("timestamp");
        Particle::at(ParticleId(Uuid::from_u128(n)), Position::new(n as f64, 0.0), now)
    }

    #[test]
    fn insert_preserves_order_and_lookup() {
        let mut arena = WorldArena::new();
        let a = arena.insert(particle(1), None);
        let b = arena.insert(particle(2), Some(TraitVector::default()));
        assert_eq!(arena.keys().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(arena.key_of(ParticleId(Uuid::from_u128(2))), Some(b));
        assert!(!arena.is_dirty(a));
    }

    #[test]
    fn reinserting_an_id_replaces_the_entry() {
        let mut arena = WorldArena::new();
        let a = arena.insert(particle(1), None);
        let mut updated = particle(1);
        updated.energy = 12.0;
        assert_eq!(arena.insert(updated, None), a);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(a).map(|e| e.particle.energy), Some(12.0));
    }

    #[test]
    fn spawned_entries_are_dirty() {
        let mut arena = WorldArena::new();
        let key = arena.spawn(particle(3), TraitVector::default());
        assert!(arena.is_spawned(key));
        assert!(arena.is_dirty(key));
        assert!(arena.get(key).is_some_and(|e| e.traits_changed));
        arena.clear_tick_marks();
        assert!(!arena.is_spawned(key));
        assert!(!arena.is_dirty(key));
    }

    #[test]
    fn pair_access_rejects_aliasing() {
        let mut arena = WorldArena::new();
        let a = arena.insert(particle(1), None);
        let b = arena.insert(particle(2), None);
        assert!(arena.pair_mut(a, a).is_none());
        let [first, second] = arena.pair_mut(a, b).expect("disjoint");
        first.particle.energy = 1.0;
        second.particle.energy = 2.0;
        assert_eq!(arena.get(b).map(|e| e.particle.energy), Some(2.0));
    }

    #[test]
    fn from_loaded_keeps_load_order_and_traits() {
        let arena = WorldArena::from_loaded(vec![
            (particle(5), None),
            (particle(4), Some(TraitVector::uniform(0.3))),
        ]);
        let ids: Vec<u128> = arena.iter().map(|(_, e)| e.particle.id.0.as_u128()).collect();
        assert_eq!(ids, vec![5, 4]);
        let key = arena.key_of(ParticleId(Uuid::from_u128(4))).expect("key");
        assert!(arena.get(key).is_some_and(|e| e.traits.is_some() && !e.traits_changed));
        assert_eq!(arena.dirty_entries().count(), 0);
    }

    #[test]
    fn retain_live_drops_terminal_particles() {
        let mut arena = WorldArena::new();
        arena.insert(particle(1), None);
        let b = arena.insert(particle(2), None);
        arena.insert(particle(3), None);
        if let Some(entry) = arena.get_mut(b) {
            entry.particle.state = ParticleState::Merged;
        }
        arena.mark_dirty(b);
        assert_eq!(arena.retain_live(), 1);
        assert_eq!(arena.len(), 2);
        assert!(arena.key_of(ParticleId(Uuid::from_u128(2))).is_none());
        assert_eq!(arena.dirty_entries().count(), 0);
    }
}
