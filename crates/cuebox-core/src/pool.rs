//! Fixed-size pool of logical playback channels.
//!
//! The pool does the accounting only: which cue occupies which backend
//! channel, at what priority. Backend calls (stopping an evicted occupant,
//! starting the new one) stay with the caller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::ChannelId;
use crate::catalog::CueId;

/// Priority class of an occupant. Higher classes may evict lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background,
    Effect,
    GlobalOverlay,
    GlobalInterrupt,
}

/// Unique id of one playing instance, monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Occupant {
    pub channel: ChannelId,
    pub instance: InstanceId,
    pub cue: CueId,
    pub priority: Priority,
    pub looped: bool,
    /// Composed linear volume the channel was started with.
    pub volume: f32,
    pub file: PathBuf,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(usize);

/// A reserved slot. When the pool was full, `evicted` holds the occupant
/// that made room; its backend channel must be stopped by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub slot: Slot,
    pub evicted: Option<Occupant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolFull;

#[derive(Debug)]
pub struct ChannelPool {
    slots: Vec<Option<Occupant>>,
}

impl ChannelPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a slot for `priority`. A free slot wins; otherwise the
    /// lowest-priority, oldest occupant strictly below `priority` is evicted.
    /// Looped occupants are never evicted.
    pub fn acquire(&mut self, priority: Priority) -> Result<Grant, PoolFull> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            return Ok(Grant {
                slot: Slot(idx),
                evicted: None,
            });
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.as_ref().map(|o| (idx, o)))
            .filter(|(_, o)| o.priority < priority && !o.looped)
            .min_by_key(|(_, o)| (o.priority, o.instance))
            .map(|(idx, _)| idx)
            .ok_or(PoolFull)?;

        Ok(Grant {
            slot: Slot(victim),
            evicted: self.slots[victim].take(),
        })
    }

    pub fn assign(&mut self, slot: Slot, occupant: Occupant) {
        debug_assert!(
            self.slots.iter().flatten().all(|o| o.instance != occupant.instance),
            "instance ids must be unique"
        );
        if let Some(s) = self.slots.get_mut(slot.0) {
            *s = Some(occupant);
        }
    }

    pub fn release(&mut self, slot: Slot) -> Option<Occupant> {
        self.slots.get_mut(slot.0).and_then(Option::take)
    }

    /// Free whatever occupies `channel`. Unknown channels (already stopped,
    /// evicted or never ours) return `None`.
    pub fn release_channel(&mut self, channel: ChannelId) -> Option<Occupant> {
        self.drain_where(|o| o.channel == channel).pop()
    }

    /// Remove every occupant matching `pred`, oldest first.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&Occupant) -> bool) -> Vec<Occupant> {
        let mut out = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|o| pred(o)) {
                out.extend(slot.take());
            }
        }
        out.sort_by_key(|o| o.instance);
        out
    }

    /// Remove every occupant except those of class `except`.
    pub fn stop_all(&mut self, except: Option<Priority>) -> Vec<Occupant> {
        self.drain_where(|o| Some(o.priority) != except)
    }

    pub fn is_playing(&self, cue: CueId) -> bool {
        self.slots.iter().flatten().any(|o| o.cue == cue)
    }

    pub fn find_channel(&self, channel: ChannelId) -> Option<&Occupant> {
        self.slots.iter().flatten().find(|o| o.channel == channel)
    }

    /// Current occupants, oldest first.
    pub fn occupants(&self) -> Vec<&Occupant> {
        let mut out: Vec<&Occupant> = self.slots.iter().flatten().collect();
        out.sort_by_key(|o| o.instance);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupant(instance: u64, priority: Priority, looped: bool) -> Occupant {
        Occupant {
            channel: ChannelId(instance * 10),
            instance: InstanceId(instance),
            cue: CueId::Effect {
                theme: 'f',
                index: instance as usize,
            },
            priority,
            looped,
            volume: 1.0,
            file: PathBuf::from(format!("{instance}.wav")),
            label: format!("cue {instance}"),
        }
    }

    fn fill(pool: &mut ChannelPool, occupants: Vec<Occupant>) {
        for o in occupants {
            let grant = pool.acquire(o.priority).unwrap();
            assert!(grant.evicted.is_none());
            pool.assign(grant.slot, o);
        }
    }

    #[test]
    fn free_slots_first() {
        let mut pool = ChannelPool::new(2);
        assert!(pool.is_empty());
        fill(&mut pool, vec![occupant(1, Priority::Effect, false)]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.capacity(), 2);
        assert!(pool.is_playing(CueId::Effect { theme: 'f', index: 1 }));
    }

    #[test]
    fn evicts_lowest_priority_oldest_first() {
        let mut pool = ChannelPool::new(3);
        fill(
            &mut pool,
            vec![
                occupant(1, Priority::Effect, false),
                occupant(2, Priority::Background, false),
                occupant(3, Priority::Background, false),
            ],
        );

        let grant = pool.acquire(Priority::GlobalOverlay).unwrap();
        assert_eq!(grant.evicted.unwrap().instance, InstanceId(2));
        pool.assign(grant.slot, occupant(4, Priority::GlobalOverlay, false));

        let grant = pool.acquire(Priority::GlobalOverlay).unwrap();
        assert_eq!(grant.evicted.unwrap().instance, InstanceId(3));
        pool.assign(grant.slot, occupant(5, Priority::GlobalOverlay, false));

        let grant = pool.acquire(Priority::GlobalOverlay).unwrap();
        assert_eq!(grant.evicted.unwrap().instance, InstanceId(1));
    }

    #[test]
    fn never_evicts_equal_priority_or_loops() {
        let mut pool = ChannelPool::new(2);
        fill(
            &mut pool,
            vec![
                occupant(1, Priority::Effect, false),
                occupant(2, Priority::Background, true),
            ],
        );
        assert_eq!(pool.acquire(Priority::Effect), Err(PoolFull));
        assert_eq!(pool.acquire(Priority::Background), Err(PoolFull));

        let grant = pool.acquire(Priority::GlobalInterrupt).unwrap();
        assert_eq!(grant.evicted.unwrap().instance, InstanceId(1));
    }

    #[test]
    fn release_channel_is_idempotent() {
        let mut pool = ChannelPool::new(2);
        fill(&mut pool, vec![occupant(1, Priority::Effect, false)]);
        assert!(pool.release_channel(ChannelId(10)).is_some());
        assert!(pool.release_channel(ChannelId(10)).is_none());
        assert!(pool.release_channel(ChannelId(999)).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn stop_all_keeps_excepted_class() {
        let mut pool = ChannelPool::new(4);
        fill(
            &mut pool,
            vec![
                occupant(1, Priority::Background, false),
                occupant(2, Priority::GlobalInterrupt, false),
                occupant(3, Priority::Effect, true),
            ],
        );
        let stopped = pool.stop_all(Some(Priority::GlobalInterrupt));
        let ids: Vec<u64> = stopped.iter().map(|o| o.instance.0).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.stop_all(None).len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let mut pool = ChannelPool::new(3);
        for i in 0..20u64 {
            let priority = if i % 3 == 0 { Priority::GlobalOverlay } else { Priority::Effect };
            if let Ok(grant) = pool.acquire(priority) {
                pool.assign(grant.slot, occupant(i, priority, false));
            }
            assert!(pool.len() <= pool.capacity());
        }
    }
}
