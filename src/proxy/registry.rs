//! Registry of live connection records.
//!
//! Records live in a slab of reusable slots. A handle carries the slot index
//! plus a generation counter, so a handle that outlives its record is detected
//! instead of silently addressing the slot's next tenant. Insertion order is
//! kept by threading doubly-linked neighbor indices through the occupied
//! slots, which gives constant-time append and constant-time removal by
//! handle.
//!
//! The registry is not synchronized. It belongs to the single task that owns
//! the proxy instance, and every mutation goes through `&mut self`.

use std::fmt;
use std::mem;

use crate::error::{CoreResult, ProxyError};

/// Handle to a record held by a [`ConnectionRegistry`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    /// Returns the raw slot index value.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation counter.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionHandle({}:{})", self.index, self.generation)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}.{}", self.index, self.generation)
    }
}

/// A slot in the registry, either holding a live record or free for reuse.
#[derive(Debug)]
enum Slot<T> {
    Occupied {
        payload: T,
        /// Slot index of the record allocated immediately before this one
        /// that is still live. `None` for the head of the order chain.
        prev: Option<u32>,
        /// Slot index of the next live record in allocation order.
        /// `None` for the tail.
        next: Option<u32>,
        generation: u32,
    },
    Vacant {
        next_free: Option<u32>,
        generation: u32,
    },
}

/// Insertion-ordered storage for the connection records of one proxy
/// instance.
///
/// New records are appended behind the current tail; removal by handle
/// relinks the record's neighbors without touching the rest of the chain.
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    capacity: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Creates a registry that will hold at most `capacity` live records.
    ///
    /// Fails with [`ProxyError::Allocation`] when the requested capacity is
    /// zero or beyond the addressable slot range.
    pub fn with_capacity(capacity: usize) -> CoreResult<Self> {
        if capacity == 0 {
            return Err(ProxyError::Allocation(
                "connection registry capacity must be at least 1".to_string(),
            ));
        }
        if capacity > u32::MAX as usize {
            return Err(ProxyError::Allocation(format!(
                "connection registry capacity {} exceeds the addressable slot range",
                capacity
            )));
        }
        Ok(Self {
            slots: Vec::new(),
            free_head: None,
            head: None,
            tail: None,
            len: 0,
            capacity,
        })
    }

    /// Returns the number of live records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no records are live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the maximum number of records that may be live at once.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a record and returns its handle. The new record becomes the
    /// tail of the order chain.
    pub fn allocate(&mut self, payload: T) -> CoreResult<ConnectionHandle> {
        self.allocate_with(|_| payload)
    }

    /// Appends a record produced by `build` and returns its handle.
    ///
    /// The closure receives the handle assigned to the record, so callers can
    /// construct payloads that embed their own handle without placeholder
    /// updates. When the registry is at capacity the closure is never run.
    pub fn allocate_with<F>(&mut self, build: F) -> CoreResult<ConnectionHandle>
    where
        F: FnOnce(ConnectionHandle) -> T,
    {
        if self.len == self.capacity {
            return Err(ProxyError::Allocation(format!(
                "connection registry at capacity ({} records)",
                self.capacity
            )));
        }

        let prev_tail = self.tail;
        let handle = if let Some(free_index) = self.free_head {
            let (generation, next_free) = match &self.slots[free_index as usize] {
                Slot::Vacant {
                    next_free,
                    generation,
                } => (*generation, *next_free),
                Slot::Occupied { .. } => unreachable!("free list pointed to an occupied slot"),
            };
            let handle = ConnectionHandle {
                index: free_index,
                generation,
            };
            let payload = build(handle);
            self.free_head = next_free;
            self.slots[free_index as usize] = Slot::Occupied {
                payload,
                prev: prev_tail,
                next: None,
                generation,
            };
            handle
        } else {
            let index =
                u32::try_from(self.slots.len()).expect("slot index exceeds addressable range");
            let handle = ConnectionHandle {
                index,
                generation: 0,
            };
            let payload = build(handle);
            self.slots.push(Slot::Occupied {
                payload,
                prev: prev_tail,
                next: None,
                generation: 0,
            });
            handle
        };

        match prev_tail {
            None => {
                debug_assert!(self.head.is_none(), "head set while the order chain is empty");
                self.head = Some(handle.index);
            }
            Some(tail_index) => {
                debug_assert!(self.head.is_some(), "head unset while records are live");
                match &mut self.slots[tail_index as usize] {
                    Slot::Occupied { next, .. } => {
                        debug_assert!(next.is_none(), "tail record has a successor");
                        *next = Some(handle.index);
                    }
                    Slot::Vacant { .. } => unreachable!("tail points to a vacant slot"),
                }
            }
        }
        self.tail = Some(handle.index);
        self.len += 1;
        Ok(handle)
    }

    /// Removes the record identified by `handle` and returns its payload.
    ///
    /// The record's neighbors are relinked around it; the rest of the order
    /// chain is untouched.
    ///
    /// # Panics
    ///
    /// Panics if the handle was never issued by this registry or its record
    /// was already removed. Handles are single-use by contract.
    pub fn deallocate(&mut self, handle: ConnectionHandle) -> T {
        let (prev, next) = match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied {
                prev,
                next,
                generation,
                ..
            }) if *generation == handle.generation => (*prev, *next),
            _ => panic!("{handle} does not identify a live connection record"),
        };

        if self.head == Some(handle.index) {
            self.head = next;
        }
        if self.tail == Some(handle.index) {
            self.tail = prev;
        }
        if let Some(prev_index) = prev {
            match &mut self.slots[prev_index as usize] {
                Slot::Occupied { next: prev_next, .. } => *prev_next = next,
                Slot::Vacant { .. } => unreachable!("linked predecessor is vacant"),
            }
        }
        if let Some(next_index) = next {
            match &mut self.slots[next_index as usize] {
                Slot::Occupied { prev: next_prev, .. } => *next_prev = prev,
                Slot::Vacant { .. } => unreachable!("linked successor is vacant"),
            }
        }

        let old_slot = mem::replace(
            &mut self.slots[handle.index as usize],
            Slot::Vacant {
                next_free: self.free_head,
                generation: handle.generation.wrapping_add(1),
            },
        );
        self.free_head = Some(handle.index);
        self.len -= 1;

        match old_slot {
            Slot::Occupied { payload, .. } => payload,
            Slot::Vacant { .. } => unreachable!(),
        }
    }

    /// Returns a reference to the payload of a live record, or `None` if the
    /// handle is stale.
    #[must_use]
    pub fn get(&self, handle: ConnectionHandle) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied {
                payload,
                generation,
                ..
            } if *generation == handle.generation => Some(payload),
            _ => None,
        }
    }

    /// Returns a mutable reference to the payload of a live record, or
    /// `None` if the handle is stale.
    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied {
                payload,
                generation,
                ..
            } if *generation == handle.generation => Some(payload),
            _ => None,
        }
    }

    /// Returns true if the handle identifies a live record.
    #[must_use]
    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Handle of the oldest live record.
    #[must_use]
    pub fn head(&self) -> Option<ConnectionHandle> {
        self.head.map(|index| self.handle_at(index))
    }

    /// Handle of the most recently allocated live record.
    #[must_use]
    pub fn tail(&self) -> Option<ConnectionHandle> {
        self.tail.map(|index| self.handle_at(index))
    }

    /// Handle of the record allocated after `handle` that is still live.
    #[must_use]
    pub fn next_of(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied {
                next, generation, ..
            } if *generation == handle.generation => next.map(|index| self.handle_at(index)),
            _ => None,
        }
    }

    /// Handle of the record allocated before `handle` that is still live.
    #[must_use]
    pub fn prev_of(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied {
                prev, generation, ..
            } if *generation == handle.generation => prev.map(|index| self.handle_at(index)),
            _ => None,
        }
    }

    /// Iterates over live records in allocation order.
    pub fn iter(&self) -> OrderedIter<'_, T> {
        OrderedIter {
            registry: self,
            cursor: self.head,
        }
    }

    /// Drops every live payload in allocation order and resets the registry
    /// to empty.
    ///
    /// No per-record relinking happens during the sweep; the whole chain is
    /// discarded once the walk finishes. Returns the number of records
    /// released.
    pub(crate) fn drain_for_teardown(&mut self) -> usize {
        let mut released = 0;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index as usize];
            match slot {
                Slot::Occupied {
                    next, generation, ..
                } => {
                    let next = *next;
                    let generation = *generation;
                    // the payload drops here, keeping release in allocation order
                    *slot = Slot::Vacant {
                        next_free: None,
                        generation: generation.wrapping_add(1),
                    };
                    released += 1;
                    cursor = next;
                }
                Slot::Vacant { .. } => unreachable!("ordered walk reached a vacant slot"),
            }
        }
        self.slots.clear();
        self.free_head = None;
        self.head = None;
        self.tail = None;
        self.len = 0;
        released
    }

    /// Verifies the structural invariants of the order chain, panicking on
    /// violation: the head has no predecessor, the tail has no successor, and
    /// the chain from head to tail visits every live record exactly once with
    /// consistent back links.
    pub fn assert_invariants(&self) {
        match (self.head, self.tail) {
            (None, None) => {
                assert_eq!(self.len, 0, "order chain empty with {} live records", self.len);
            }
            (Some(head), Some(tail)) => {
                let mut visited = vec![false; self.slots.len()];
                let mut expected_prev: Option<u32> = None;
                let mut count = 0usize;
                let mut last = head;
                let mut cursor = Some(head);
                while let Some(index) = cursor {
                    match &self.slots[index as usize] {
                        Slot::Occupied { prev, next, .. } => {
                            assert_eq!(
                                *prev, expected_prev,
                                "record at slot {} has a broken back link",
                                index
                            );
                            assert!(
                                !visited[index as usize],
                                "record at slot {} linked more than once",
                                index
                            );
                            visited[index as usize] = true;
                            count += 1;
                            last = index;
                            expected_prev = Some(index);
                            cursor = *next;
                        }
                        Slot::Vacant { .. } => {
                            panic!("order chain reaches a vacant slot at {}", index)
                        }
                    }
                }
                assert_eq!(last, tail, "order chain does not end at the tail record");
                assert_eq!(
                    count, self.len,
                    "order chain visits {} records, {} are live",
                    count, self.len
                );
            }
            _ => panic!("exactly one of head/tail is set"),
        }
    }

    fn handle_at(&self, index: u32) -> ConnectionHandle {
        match &self.slots[index as usize] {
            Slot::Occupied { generation, .. } => ConnectionHandle {
                index,
                generation: *generation,
            },
            Slot::Vacant { .. } => unreachable!("order chain endpoint points to a vacant slot"),
        }
    }
}

/// Iterator over live records in allocation order.
pub struct OrderedIter<'a, T> {
    registry: &'a ConnectionRegistry<T>,
    cursor: Option<u32>,
}

impl<'a, T> Iterator for OrderedIter<'a, T> {
    type Item = (ConnectionHandle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        match &self.registry.slots[index as usize] {
            Slot::Occupied {
                payload,
                next,
                generation,
                ..
            } => {
                self.cursor = *next;
                Some((
                    ConnectionHandle {
                        index,
                        generation: *generation,
                    },
                    payload,
                ))
            }
            Slot::Vacant { .. } => unreachable!("ordered walk reached a vacant slot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct DropProbe {
        tag: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.tag);
        }
    }

    fn probe(tag: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> DropProbe {
        DropProbe {
            tag,
            log: Rc::clone(log),
        }
    }

    fn order_of<T>(registry: &ConnectionRegistry<T>) -> Vec<ConnectionHandle> {
        registry.iter().map(|(handle, _)| handle).collect()
    }

    #[test]
    fn allocate_and_get() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        let handle = registry.allocate(42).unwrap();
        assert_eq!(registry.get(handle), Some(&42));
        assert_eq!(registry.len(), 1);
        registry.assert_invariants();
    }

    #[test]
    fn allocate_appends_behind_tail() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        let a = registry.allocate("a").unwrap();
        let b = registry.allocate("b").unwrap();
        let c = registry.allocate("c").unwrap();

        assert_eq!(registry.head(), Some(a));
        assert_eq!(registry.tail(), Some(c));
        assert_eq!(order_of(&registry), vec![a, b, c]);
        assert_eq!(registry.next_of(a), Some(b));
        assert_eq!(registry.prev_of(c), Some(b));
        assert_eq!(registry.prev_of(a), None);
        assert_eq!(registry.next_of(c), None);
        registry.assert_invariants();
    }

    #[test]
    fn deallocate_middle_relinks_neighbors() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        let a = registry.allocate("a").unwrap();
        let b = registry.allocate("b").unwrap();
        let c = registry.allocate("c").unwrap();

        assert_eq!(registry.deallocate(b), "b");

        assert_eq!(order_of(&registry), vec![a, c]);
        assert_eq!(registry.head(), Some(a));
        assert_eq!(registry.tail(), Some(c));
        assert_eq!(registry.next_of(a), Some(c));
        assert_eq!(registry.prev_of(c), Some(a));
        registry.assert_invariants();
    }

    #[test]
    fn deallocate_head_advances_head() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        let a = registry.allocate("a").unwrap();
        let b = registry.allocate("b").unwrap();

        registry.deallocate(a);

        assert_eq!(registry.head(), Some(b));
        assert_eq!(registry.tail(), Some(b));
        assert_eq!(registry.prev_of(b), None);
        registry.assert_invariants();
    }

    #[test]
    fn deallocate_tail_retreats_tail() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        let a = registry.allocate("a").unwrap();
        let b = registry.allocate("b").unwrap();

        registry.deallocate(b);

        assert_eq!(registry.head(), Some(a));
        assert_eq!(registry.tail(), Some(a));
        assert_eq!(registry.next_of(a), None);
        registry.assert_invariants();
    }

    #[test]
    fn deallocate_only_record_empties_chain() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        let a = registry.allocate("a").unwrap();

        registry.deallocate(a);

        assert!(registry.is_empty());
        assert_eq!(registry.head(), None);
        assert_eq!(registry.tail(), None);
        registry.assert_invariants();
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        let a = registry.allocate(1).unwrap();
        registry.deallocate(a);
        let b = registry.allocate(2).unwrap();

        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(registry.get(a), None);
        assert_eq!(registry.get(b), Some(&2));
        assert!(!registry.contains(a));
        assert!(registry.contains(b));
    }

    #[test]
    #[should_panic(expected = "does not identify a live connection record")]
    fn stale_handle_deallocate_panics() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        let a = registry.allocate(1).unwrap();
        registry.deallocate(a);
        registry.deallocate(a);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = ConnectionRegistry::<u8>::with_capacity(0).unwrap_err();
        assert!(matches!(err, ProxyError::Allocation(_)));
    }

    #[test]
    fn capacity_exhaustion_leaves_registry_unchanged() {
        let mut registry = ConnectionRegistry::with_capacity(2).unwrap();
        let a = registry.allocate("a").unwrap();
        let b = registry.allocate("b").unwrap();

        let err = registry.allocate("c").unwrap_err();
        assert!(matches!(err, ProxyError::Allocation(_)));

        assert_eq!(registry.len(), 2);
        assert_eq!(order_of(&registry), vec![a, b]);
        registry.assert_invariants();
    }

    #[test]
    fn full_registry_never_runs_the_build_closure() {
        let mut registry = ConnectionRegistry::with_capacity(1).unwrap();
        registry.allocate(0).unwrap();

        let mut built = false;
        let result = registry.allocate_with(|_| {
            built = true;
            1
        });
        assert!(result.is_err());
        assert!(!built);
    }

    #[test]
    fn allocate_then_deallocate_restores_structure() {
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();
        registry.allocate("a").unwrap();
        let b = registry.allocate("b").unwrap();
        registry.deallocate(b);
        registry.allocate("c").unwrap();

        let head = registry.head();
        let tail = registry.tail();
        let order = order_of(&registry);

        let d = registry.allocate("d").unwrap();
        registry.deallocate(d);

        assert_eq!(registry.head(), head);
        assert_eq!(registry.tail(), tail);
        assert_eq!(order_of(&registry), order);
        registry.assert_invariants();
    }

    #[test]
    fn allocate_with_passes_assigned_handle() {
        let mut registry = ConnectionRegistry::with_capacity(4).unwrap();
        let handle = registry.allocate_with(|h| h.index()).unwrap();
        assert_eq!(registry.get(handle), Some(&handle.index()));
    }

    #[test]
    fn teardown_releases_in_allocation_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = ConnectionRegistry::with_capacity(8).unwrap();

        let _a = registry.allocate(probe("a", &log)).unwrap();
        let b = registry.allocate(probe("b", &log)).unwrap();
        let _c = registry.allocate(probe("c", &log)).unwrap();
        let _d = registry.allocate(probe("d", &log)).unwrap();

        drop(registry.deallocate(b));
        let released = registry.drain_for_teardown();

        assert_eq!(released, 3);
        assert!(registry.is_empty());
        assert_eq!(registry.head(), None);
        assert_eq!(registry.tail(), None);
        assert_eq!(*log.borrow(), vec!["b", "a", "c", "d"]);
        registry.assert_invariants();
    }

    #[test]
    fn invariants_hold_through_churn() {
        let mut registry = ConnectionRegistry::with_capacity(4).unwrap();
        let mut live = Vec::new();

        for round in 0..32u32 {
            if registry.len() < registry.capacity() && (round % 3 != 0 || live.is_empty()) {
                live.push(registry.allocate(round).unwrap());
            } else {
                let handle = live.remove((round as usize) % live.len());
                registry.deallocate(handle);
            }
            registry.assert_invariants();
            assert_eq!(registry.len(), live.len());
        }
    }
}
