use super::bucket_array::NIL;

/// The most-recently-used sentinel.
pub(crate) const HEAD: u32 = 0;

/// The least-recently-used sentinel.
pub(crate) const TAIL: u32 = 1;

/// Links of a single slot.
///
/// `generation` identifies the node occupying the slot when it was linked, so that a stale handle
/// to a removed node cannot move the node that reuses the slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Link {
    prev: u32,
    next: u32,
    generation: u64,
    linked: bool,
}

impl Link {
    const UNLINKED: Link = Link {
        prev: NIL,
        next: NIL,
        generation: 0,
        linked: false,
    };
}

/// [`LruList`] is a doubly linked list threaded through the slot indices of a
/// [`BucketArray`](super::bucket_array::BucketArray).
///
/// `links[HEAD].next ... links[TAIL].prev` is the MRU to LRU order. The sentinels are never
/// unlinked.
#[derive(Debug)]
pub(crate) struct LruList {
    links: Vec<Link>,
    len: usize,
}

impl LruList {
    /// Creates an empty [`LruList`] with only the two sentinels linked.
    pub(crate) fn new() -> Self {
        let mut links = vec![Link::UNLINKED; 2];
        links[HEAD as usize] = Link {
            prev: NIL,
            next: TAIL,
            generation: 0,
            linked: true,
        };
        links[TAIL as usize] = Link {
            prev: HEAD,
            next: NIL,
            generation: 0,
            linked: true,
        };
        Self { links, len: 0 }
    }

    /// Returns the number of linked nodes excluding the sentinels.
    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of slots the list has link storage for, an upper bound on the length of
    /// any walk.
    #[inline]
    pub(crate) fn num_links(&self) -> usize {
        self.links.len()
    }

    /// Returns `true` if the slot is linked with the given generation.
    #[inline]
    pub(crate) fn is_linked(&self, slot: u32, generation: u64) -> bool {
        self.links
            .get(slot as usize)
            .is_some_and(|l| l.linked && l.generation == generation)
    }

    /// Returns the generation recorded for a linked slot.
    #[inline]
    pub(crate) fn generation(&self, slot: u32) -> Option<u64> {
        self.links
            .get(slot as usize)
            .filter(|l| l.linked)
            .map(|l| l.generation)
    }

    /// Returns the neighbor closer to the MRU end.
    #[inline]
    pub(crate) fn prev(&self, slot: u32) -> u32 {
        self.links.get(slot as usize).map_or(NIL, |l| l.prev)
    }

    /// Returns the neighbor closer to the LRU end.
    #[inline]
    pub(crate) fn next(&self, slot: u32) -> u32 {
        self.links.get(slot as usize).map_or(NIL, |l| l.next)
    }

    /// Links the slot at the MRU end, moving it there if it is already linked.
    pub(crate) fn push_front(&mut self, slot: u32, generation: u64) {
        debug_assert!(slot != HEAD && slot != TAIL);
        if self.links.len() <= slot as usize {
            self.links.resize(slot as usize + 1, Link::UNLINKED);
        }
        if self.links[slot as usize].linked {
            self.detach(slot);
        }
        let first = self.links[HEAD as usize].next;
        self.links[slot as usize] = Link {
            prev: HEAD,
            next: first,
            generation,
            linked: true,
        };
        self.links[first as usize].prev = slot;
        self.links[HEAD as usize].next = slot;
        self.len += 1;
    }

    /// Moves a linked slot to the MRU end.
    ///
    /// Returns `false` if the slot is not linked with the given generation.
    pub(crate) fn touch(&mut self, slot: u32, generation: u64) -> bool {
        if !self.is_linked(slot, generation) {
            return false;
        }
        if self.links[HEAD as usize].next != slot {
            self.detach(slot);
            self.push_front(slot, generation);
        }
        true
    }

    /// Unlinks the slot if it is linked with the given generation.
    pub(crate) fn unlink(&mut self, slot: u32, generation: u64) -> bool {
        if !self.is_linked(slot, generation) {
            return false;
        }
        self.detach(slot);
        true
    }

    /// Unlinks every node, leaving only the sentinels.
    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    /// Drops link storage for slots at or beyond `num_slots`.
    ///
    /// The slots must already be unlinked.
    pub(crate) fn truncate(&mut self, num_slots: usize) {
        let num_slots = num_slots.max(2);
        debug_assert!(self.links.iter().skip(num_slots).all(|l| !l.linked));
        self.links.truncate(num_slots);
        self.links.shrink_to_fit();
    }

    /// Returns the slots from the LRU end to the MRU end.
    ///
    /// The walk is bounded by the link storage size so that a corrupted cycle terminates.
    #[cfg(test)]
    pub(crate) fn iter_from_tail(&self) -> impl Iterator<Item = u32> + '_ {
        let mut current = self.prev(TAIL);
        let mut remaining = self.links.len();
        std::iter::from_fn(move || {
            if current == HEAD || current == NIL || remaining == 0 {
                return None;
            }
            remaining -= 1;
            let slot = current;
            current = self.prev(slot);
            Some(slot)
        })
    }

    /// Returns the slots from the MRU end to the LRU end.
    pub(crate) fn iter_from_head(&self) -> impl Iterator<Item = u32> + '_ {
        let mut current = self.next(HEAD);
        let mut remaining = self.links.len();
        std::iter::from_fn(move || {
            if current == TAIL || current == NIL || remaining == 0 {
                return None;
            }
            remaining -= 1;
            let slot = current;
            current = self.next(slot);
            Some(slot)
        })
    }

    fn detach(&mut self, slot: u32) {
        let Link { prev, next, .. } = self.links[slot as usize];
        if let Some(p) = self.links.get_mut(prev as usize) {
            p.next = next;
        }
        if let Some(n) = self.links.get_mut(next as usize) {
            n.prev = prev;
        }
        self.links[slot as usize] = Link::UNLINKED;
        self.len -= 1;
    }

    /// Overwrites the links of a slot without maintaining its neighbors.
    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, slot: u32) {
        if let Some(l) = self.links.get_mut(slot as usize) {
            l.prev = NIL;
            l.next = NIL;
        }
    }
}

impl Default for LruList {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
