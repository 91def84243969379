//! Mutation-stable sequence of IR nodes
//!
//! Nodes live in an arena of slots and are linked into a doubly linked list through slot indices.
//! Handles ([`EntryId`]) carry the generation of the slot they were created for, so inserting or
//! removing a node never invalidates handles to any other node, while a handle to a removed node is
//! recognized as stale instead of silently aliasing whatever reuses its slot.

use super::MethodItemEntry;
use std::fmt;
use std::ops::{Index, IndexMut};

const NIL: u32 = u32::MAX;

/// Stable handle to a node of a [`FatMethod`]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)?;
        if self.generation > 0 {
            write!(f, "'{}", self.generation)?;
        }
        Ok(())
    }
}

struct Slot {
    generation: u32,
    entry: Option<MethodItemEntry>,
    prev: u32,
    next: u32,
}

pub struct FatMethod {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl Default for FatMethod {
    fn default() -> FatMethod {
        FatMethod::new()
    }
}

impl FatMethod {
    pub fn new() -> FatMethod {
        FatMethod {
            slots: vec![],
            free: vec![],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Is the handle still referring to a node of this sequence?
    pub fn contains(&self, id: EntryId) -> bool {
        self.slots
            .get(id.index as usize)
            .map_or(false, |slot| slot.generation == id.generation && slot.entry.is_some())
    }

    fn handle(&self, index: u32) -> Option<EntryId> {
        if index == NIL {
            None
        } else {
            Some(EntryId {
                index,
                generation: self.slots[index as usize].generation,
            })
        }
    }

    fn live_slot(&self, id: EntryId) -> &Slot {
        assert!(self.contains(id), "stale method item handle {:?}", id);
        &self.slots[id.index as usize]
    }

    pub fn get(&self, id: EntryId) -> Option<&MethodItemEntry> {
        if self.contains(id) {
            self.slots[id.index as usize].entry.as_ref()
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut MethodItemEntry> {
        if self.contains(id) {
            self.slots[id.index as usize].entry.as_mut()
        } else {
            None
        }
    }

    pub fn first(&self) -> Option<EntryId> {
        self.handle(self.head)
    }

    pub fn last(&self) -> Option<EntryId> {
        self.handle(self.tail)
    }

    pub fn next(&self, id: EntryId) -> Option<EntryId> {
        self.handle(self.live_slot(id).next)
    }

    pub fn prev(&self, id: EntryId) -> Option<EntryId> {
        self.handle(self.live_slot(id).prev)
    }

    fn allocate(&mut self, entry: MethodItemEntry) -> u32 {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                    prev: NIL,
                    next: NIL,
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Link a fresh slot between `prev` and `next` (either may be `NIL`)
    fn link(&mut self, index: u32, prev: u32, next: u32) -> EntryId {
        {
            let slot = &mut self.slots[index as usize];
            slot.prev = prev;
            slot.next = next;
        }
        if prev == NIL {
            self.head = index;
        } else {
            self.slots[prev as usize].next = index;
        }
        if next == NIL {
            self.tail = index;
        } else {
            self.slots[next as usize].prev = index;
        }
        EntryId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    pub fn push_back(&mut self, entry: MethodItemEntry) -> EntryId {
        let index = self.allocate(entry);
        let tail = self.tail;
        self.link(index, tail, NIL)
    }

    pub fn push_front(&mut self, entry: MethodItemEntry) -> EntryId {
        let index = self.allocate(entry);
        let head = self.head;
        self.link(index, NIL, head)
    }

    /// Insert before `pos`, or at the end when `pos` is `None`
    pub fn insert_before(&mut self, pos: Option<EntryId>, entry: MethodItemEntry) -> EntryId {
        match pos {
            None => self.push_back(entry),
            Some(pos) => {
                let prev = self.live_slot(pos).prev;
                let index = self.allocate(entry);
                self.link(index, prev, pos.index)
            }
        }
    }

    /// Insert after `pos`, or at the front when `pos` is `None`
    pub fn insert_after(&mut self, pos: Option<EntryId>, entry: MethodItemEntry) -> EntryId {
        match pos {
            None => self.push_front(entry),
            Some(pos) => {
                let next = self.live_slot(pos).next;
                let index = self.allocate(entry);
                self.link(index, pos.index, next)
            }
        }
    }

    /// Unlink and return a node. Its handle (and only its handle) becomes stale.
    pub fn remove(&mut self, id: EntryId) -> MethodItemEntry {
        let (prev, next) = {
            let slot = self.live_slot(id);
            (slot.prev, slot.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }

        let slot = &mut self.slots[id.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.prev = NIL;
        slot.next = NIL;
        self.free.push(id.index);
        self.len -= 1;
        match slot.entry.take() {
            Some(entry) => entry,
            None => unreachable!("live slot without entry"),
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            method: self,
            next: self.head,
        }
    }

    /// Snapshot of the handles in sequence order
    pub fn ids(&self) -> Vec<EntryId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl Index<EntryId> for FatMethod {
    type Output = MethodItemEntry;

    fn index(&self, id: EntryId) -> &MethodItemEntry {
        match self.get(id) {
            Some(entry) => entry,
            None => panic!("stale method item handle {:?}", id),
        }
    }
}

impl IndexMut<EntryId> for FatMethod {
    fn index_mut(&mut self, id: EntryId) -> &mut MethodItemEntry {
        match self.get_mut(id) {
            Some(entry) => entry,
            None => panic!("stale method item handle {:?}", id),
        }
    }
}

pub struct Iter<'a> {
    method: &'a FatMethod,
    next: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (EntryId, &'a MethodItemEntry);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let index = self.next;
        let slot = &self.method.slots[index as usize];
        self.next = slot.next;
        let id = EntryId {
            index,
            generation: slot.generation,
        };
        slot.entry.as_ref().map(|entry| (id, entry))
    }
}

impl fmt::Debug for FatMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
