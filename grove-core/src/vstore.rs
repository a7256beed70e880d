//! Per-node value storage
//!
//! Values live in a slab threaded as a doubly-linked list (stable insertion
//! order for iteration) and, once the store holds more than `HIGH_WATER`
//! entries, additionally in a hash index keyed by the value's key id. The
//! index is dropped, not left stale, once the count falls below `LOW_WATER`;
//! the gap between the two marks is a hysteresis band so a store oscillating
//! around one threshold does not thrash the index.
//!
//! Invariant: whenever the index exists, the set of keys reachable by a
//! linear scan of the list equals the set reachable through the index.
//!
//! Ownership lives here as well: a value with an owner is private to that
//! client. The access check (`AccessDenied` vs `NotFound`) belongs to the
//! calling layer; iteration takes the viewing client so foreign private
//! values can be skipped.

use crate::error::Result;
use crate::hashidx::HashIndex;
use crate::ids::ClientId;
use crate::key::Key;
use crate::value::TreeValue;

/// Build the auxiliary hash index once the entry count exceeds this
pub(crate) const HIGH_WATER: usize = 10;

/// Drop the auxiliary hash index once the entry count falls below this
pub(crate) const LOW_WATER: usize = 5;

/// One named value
#[derive(Debug)]
pub(crate) struct ValueCell {
    pub key: Key,
    pub payload: TreeValue,
    /// `Some` marks the value private to that client
    pub owner: Option<ClientId>,
    prev: Option<u32>,
    next: Option<u32>,
}

impl ValueCell {
    /// True if `viewer` may see this value
    pub fn visible_to(&self, viewer: ClientId) -> bool {
        match self.owner {
            None => true,
            Some(owner) => owner == viewer,
        }
    }
}

enum Slot {
    Used(ValueCell),
    Free { next_free: Option<u32> },
}

/// Ordered list of named values with an on-demand hash index
#[derive(Default)]
pub(crate) struct ValueStore {
    slots: Vec<Slot>,
    free: Option<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    /// key id -> slot, present only above the water line
    index: Option<HashIndex<u32, u32>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cell(&self, slot: u32) -> &ValueCell {
        match &self.slots[slot as usize] {
            Slot::Used(cell) => cell,
            Slot::Free { .. } => panic!("value slot {slot} is free"),
        }
    }

    pub fn cell_mut(&mut self, slot: u32) -> &mut ValueCell {
        match &mut self.slots[slot as usize] {
            Slot::Used(cell) => cell,
            Slot::Free { .. } => panic!("value slot {slot} is free"),
        }
    }

    /// Find the slot holding `key`, via the index when present
    pub fn find(&self, key: &Key) -> Option<u32> {
        match &self.index {
            Some(idx) => idx.get(key.id()).copied(),
            None => {
                let mut cur = self.head;
                while let Some(i) = cur {
                    let cell = self.cell(i);
                    if cell.key == *key {
                        return Some(i);
                    }
                    cur = cell.next;
                }
                None
            }
        }
    }

    /// Find `key` or append a fresh public value at the list tail.
    /// Returns the slot and whether it was newly created.
    pub fn create_or_find(&mut self, key: &Key) -> Result<(u32, bool)> {
        if let Some(slot) = self.find(key) {
            return Ok((slot, false));
        }
        let cell = ValueCell {
            key: key.clone(),
            payload: TreeValue::String(std::sync::Arc::from("")),
            owner: None,
            prev: self.tail,
            next: None,
        };
        let slot = self.alloc(cell);
        match self.tail {
            Some(t) => {
                if let Slot::Used(tc) = &mut self.slots[t as usize] {
                    tc.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        if let Some(idx) = &mut self.index {
            idx.insert(key.id(), slot)?;
        } else if self.len > HIGH_WATER {
            self.build_index()?;
        }
        Ok((slot, true))
    }

    fn alloc(&mut self, cell: ValueCell) -> u32 {
        match self.free {
            Some(i) => {
                let next_free = match self.slots[i as usize] {
                    Slot::Free { next_free } => next_free,
                    Slot::Used(_) => None,
                };
                self.free = next_free;
                self.slots[i as usize] = Slot::Used(cell);
                i
            }
            None => {
                let i = self.slots.len() as u32;
                self.slots.push(Slot::Used(cell));
                i
            }
        }
    }

    fn build_index(&mut self) -> Result<()> {
        let mut idx = HashIndex::new();
        let mut cur = self.head;
        while let Some(i) = cur {
            let cell = self.cell(i);
            idx.insert(cell.key.id(), i)?;
            cur = cell.next;
        }
        tracing::trace!(values = self.len, "value store promoted to hash index");
        self.index = Some(idx);
        Ok(())
    }

    /// Remove the value in `slot`, maintaining list, index, and the
    /// low-water demotion rule.
    pub fn remove_slot(&mut self, slot: u32) -> ValueCell {
        let old = std::mem::replace(
            &mut self.slots[slot as usize],
            Slot::Free {
                next_free: self.free,
            },
        );
        self.free = Some(slot);
        let cell = match old {
            Slot::Used(cell) => cell,
            Slot::Free { .. } => panic!("value slot {slot} is free"),
        };
        match cell.prev {
            Some(p) => {
                if let Slot::Used(pc) = &mut self.slots[p as usize] {
                    pc.next = cell.next;
                }
            }
            None => self.head = cell.next,
        }
        match cell.next {
            Some(n) => {
                if let Slot::Used(nc) = &mut self.slots[n as usize] {
                    nc.prev = cell.prev;
                }
            }
            None => self.tail = cell.prev,
        }
        self.len -= 1;
        if let Some(idx) = &mut self.index {
            idx.remove_where(cell.key.id(), |s| *s == slot);
            if self.len < LOW_WATER {
                tracing::trace!(values = self.len, "value store dropped hash index");
                self.index = None;
            }
        }
        cell
    }

    /// In-order iteration over every cell (no owner filtering)
    pub fn iter(&self) -> ValueIter<'_> {
        ValueIter {
            store: self,
            cur: self.head,
        }
    }

    /// Keys visible to `viewer`, in insertion order
    pub fn keys_for(&self, viewer: ClientId) -> Vec<Key> {
        self.iter()
            .filter(|cell| cell.visible_to(viewer))
            .map(|cell| cell.key.clone())
            .collect()
    }
}

pub(crate) struct ValueIter<'a> {
    store: &'a ValueStore,
    cur: Option<u32>,
}

impl<'a> Iterator for ValueIter<'a> {
    type Item = &'a ValueCell;

    fn next(&mut self) -> Option<&'a ValueCell> {
        let i = self.cur?;
        let cell = self.store.cell(i);
        self.cur = cell.next;
        Some(cell)
    }
}
