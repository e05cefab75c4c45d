use super::lru_list::{HEAD, TAIL};
use super::Node;
use equivalent::Equivalent;
use std::sync::Arc;

/// The null slot index.
pub(crate) const NIL: u32 = u32::MAX;

/// The minimum number of buckets.
const MINIMUM_BUCKETS: usize = 16;

/// A slot of the node slab.
///
/// `next` chains the slot into its bucket; it is meaningful only while `node` is occupied.
#[derive(Debug)]
struct Slot<K, T> {
    node: Option<Arc<Node<K, T>>>,
    next: u32,
}

/// [`BucketArray`] is a power-of-two array of bucket chains over a slab of nodes.
///
/// Nodes are addressed by stable slot indices; the first two slot indices are reserved for the
/// [`LruList`](super::lru_list::LruList) sentinels and never hold a node.
#[derive(Debug)]
pub(crate) struct BucketArray<K, T> {
    heads: Vec<u32>,
    slots: Vec<Slot<K, T>>,
    vacant: Vec<u32>,
    len: usize,
    threshold: usize,
    load_factor: f64,
    next_generation: u64,
}

impl<K, T> BucketArray<K, T> {
    /// Creates a new [`BucketArray`] able to hold `capacity` nodes without growing.
    pub(crate) fn new(capacity: usize, load_factor: f64) -> Self {
        let load_factor = if load_factor.is_finite() && load_factor > 0.0 {
            load_factor.min(4.0)
        } else {
            0.75
        };
        let num_buckets = Self::buckets_for(capacity, load_factor);
        let mut slots = Vec::new();
        slots.extend([HEAD, TAIL].map(|_| Slot {
            node: None,
            next: NIL,
        }));
        Self {
            heads: vec![NIL; num_buckets],
            slots,
            vacant: Vec::new(),
            len: 0,
            threshold: Self::threshold_for(num_buckets, load_factor),
            load_factor,
            next_generation: 1,
        }
    }

    /// Returns the number of nodes.
    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of buckets.
    #[inline]
    pub(crate) fn num_buckets(&self) -> usize {
        self.heads.len()
    }

    /// Returns the number of slab slots including the reserved ones.
    #[cfg(test)]
    pub(crate) fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of nodes the array holds before it grows.
    #[inline]
    pub(crate) const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Returns the node in the slot.
    #[inline]
    pub(crate) fn node(&self, slot: u32) -> Option<&Arc<Node<K, T>>> {
        self.slots.get(slot as usize).and_then(|s| s.node.as_ref())
    }

    /// Iterates over all nodes in slot order.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Arc<Node<K, T>>> {
        self.slots.iter().filter_map(|s| s.node.as_ref())
    }

    /// Finds the node associated with the key.
    pub(crate) fn find<Q>(&self, hash: u64, key: &Q) -> Option<&Arc<Node<K, T>>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let mut current = self.heads[self.bucket_index(hash)];
        while current != NIL {
            let slot = &self.slots[current as usize];
            if let Some(node) = slot.node.as_ref() {
                if node.hash == hash && key.equivalent(&node.key) {
                    return Some(node);
                }
            }
            current = slot.next;
        }
        None
    }

    /// Inserts a new node at the head of its bucket.
    ///
    /// The caller must have checked that the key is absent.
    pub(crate) fn insert(&mut self, hash: u64, key: K, payload: T) -> Arc<Node<K, T>> {
        let slot = match self.vacant.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.slots.len()).unwrap_or(NIL);
                assert_ne!(slot, NIL, "slot index space exhausted");
                self.slots.push(Slot {
                    node: None,
                    next: NIL,
                });
                slot
            }
        };
        let generation = self.next_generation;
        self.next_generation += 1;
        let node = Arc::new(Node {
            hash,
            slot,
            generation,
            key,
            payload,
        });
        let index = self.bucket_index(hash);
        self.slots[slot as usize] = Slot {
            node: Some(node.clone()),
            next: self.heads[index],
        };
        self.heads[index] = slot;
        self.len += 1;
        node
    }

    /// Removes the node associated with the key.
    pub(crate) fn remove<Q>(&mut self, hash: u64, key: &Q) -> Option<Arc<Node<K, T>>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let slot = self.find(hash, key)?.slot;
        self.remove_slot(hash, slot)
    }

    /// Removes the given node if it is still in the array.
    pub(crate) fn remove_node(&mut self, node: &Node<K, T>) -> Option<Arc<Node<K, T>>> {
        match self.node(node.slot) {
            Some(current) if current.generation == node.generation => {
                self.remove_slot(node.hash, node.slot)
            }
            _ => None,
        }
    }

    /// Removes every node.
    pub(crate) fn clear(&mut self) -> Vec<Arc<Node<K, T>>> {
        let removed = self
            .slots
            .iter_mut()
            .filter_map(|s| s.node.take())
            .collect::<Vec<_>>();
        self.slots.truncate(2);
        self.vacant.clear();
        self.heads.iter_mut().for_each(|h| *h = NIL);
        self.len = 0;
        removed
    }

    /// Returns `true` if the number of nodes exceeds the growth threshold.
    #[inline]
    pub(crate) fn needs_growth(&self) -> bool {
        self.len > self.threshold
    }

    /// Doubles the number of buckets until the nodes fit under the threshold.
    ///
    /// Each chain is split into a low and a high chain by the newly significant hash bit; the
    /// relative order of nodes within a chain is preserved.
    ///
    /// Returns `true` if the array grew.
    pub(crate) fn grow(&mut self) -> bool {
        let mut grown = false;
        while self.needs_growth() && self.heads.len() < (1_usize << (usize::BITS - 2)) {
            let old_len = self.heads.len();
            self.heads.resize(old_len * 2, NIL);
            for index in 0..old_len {
                let (low, high) = self.split(self.heads[index], old_len as u64);
                self.heads[index] = low;
                self.heads[index + old_len] = high;
            }
            self.threshold = Self::threshold_for(self.heads.len(), self.load_factor);
            grown = true;
        }
        grown
    }

    /// Halves the number of buckets while the array is sparsely populated, and releases vacant
    /// slots at the end of the slab.
    ///
    /// Returns the new number of slab slots if anything was released.
    pub(crate) fn pinch(&mut self) -> Option<usize> {
        let mut pinched = false;
        while self.heads.len() > MINIMUM_BUCKETS
            && self.len < Self::threshold_for(self.heads.len(), self.load_factor) / 8
        {
            let new_len = self.heads.len() / 2;
            for index in 0..new_len {
                let high = self.heads[index + new_len];
                if high == NIL {
                    continue;
                }
                let mut last = self.heads[index];
                if last == NIL {
                    self.heads[index] = high;
                    continue;
                }
                while self.slots[last as usize].next != NIL {
                    last = self.slots[last as usize].next;
                }
                self.slots[last as usize].next = high;
            }
            self.heads.truncate(new_len);
            self.heads.shrink_to_fit();
            self.threshold = Self::threshold_for(new_len, self.load_factor);
            pinched = true;
        }

        let occupied_end = self
            .slots
            .iter()
            .rposition(|s| s.node.is_some())
            .map_or(2, |p| p + 1);
        if occupied_end < self.slots.len() {
            self.slots.truncate(occupied_end);
            self.slots.shrink_to_fit();
            self.vacant.retain(|s| (*s as usize) < occupied_end);
            pinched = true;
        }
        pinched.then_some(self.slots.len())
    }

    /// Returns the length of the longest bucket chain.
    #[cfg(test)]
    pub(crate) fn longest_chain(&self) -> usize {
        self.heads
            .iter()
            .map(|&head| {
                let mut len = 0;
                let mut current = head;
                while current != NIL {
                    len += 1;
                    current = self.slots[current as usize].next;
                }
                len
            })
            .max()
            .unwrap_or(0)
    }

    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    fn bucket_index(&self, hash: u64) -> usize {
        (hash as usize) & (self.heads.len() - 1)
    }

    fn remove_slot(&mut self, hash: u64, slot: u32) -> Option<Arc<Node<K, T>>> {
        let index = self.bucket_index(hash);
        let next = self.slots[slot as usize].next;
        if self.heads[index] == slot {
            self.heads[index] = next;
        } else {
            let mut current = self.heads[index];
            while current != NIL && self.slots[current as usize].next != slot {
                current = self.slots[current as usize].next;
            }
            if current == NIL {
                return None;
            }
            self.slots[current as usize].next = next;
        }
        let removed = self.slots[slot as usize].node.take();
        self.slots[slot as usize].next = NIL;
        self.vacant.push(slot);
        self.len -= 1;
        removed
    }

    fn split(&mut self, mut current: u32, bit: u64) -> (u32, u32) {
        let (mut low_head, mut low_tail) = (NIL, NIL);
        let (mut high_head, mut high_tail) = (NIL, NIL);
        while current != NIL {
            let next = self.slots[current as usize].next;
            self.slots[current as usize].next = NIL;
            let high = self.slots[current as usize]
                .node
                .as_ref()
                .is_some_and(|n| n.hash & bit != 0);
            let (head, tail) = if high {
                (&mut high_head, &mut high_tail)
            } else {
                (&mut low_head, &mut low_tail)
            };
            if *tail == NIL {
                *head = current;
            } else {
                self.slots[*tail as usize].next = current;
            }
            *tail = current;
            current = next;
        }
        (low_head, high_head)
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn buckets_for(capacity: usize, load_factor: f64) -> usize {
        let wanted = (capacity as f64 / load_factor).ceil() as usize;
        wanted
            .min(1_usize << (usize::BITS - 2))
            .next_power_of_two()
            .max(MINIMUM_BUCKETS)
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn threshold_for(num_buckets: usize, load_factor: f64) -> usize {
        ((num_buckets as f64) * load_factor) as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn find_all(array: &BucketArray<u64, ()>, keys: &[u64]) -> bool {
        keys.iter().all(|k| array.find(*k, k).is_some_and(|n| n.key == *k))
    }

    #[test]
    fn reserved_slots() {
        let mut array: BucketArray<u64, ()> = BucketArray::new(0, 0.75);
        let node = array.insert(7, 7, ());
        assert_eq!(node.slot, 2);
        assert!(array.node(HEAD).is_none());
        assert!(array.node(TAIL).is_none());
        assert_eq!(array.num_buckets(), MINIMUM_BUCKETS);
    }

    #[test]
    fn grow_splits_chains() {
        let mut array: BucketArray<u64, ()> = BucketArray::new(0, 0.75);
        let keys = (0..1024_u64).collect::<Vec<_>>();
        for k in &keys {
            array.insert(*k, *k, ());
            array.grow();
        }
        assert_eq!(array.len(), 1024);
        assert!(array.num_buckets() >= 1024);
        assert!(!array.needs_growth());
        assert!(find_all(&array, &keys));
        // Identity hashes over a contiguous range spread evenly.
        assert!(array.longest_chain() <= 1);
    }

    #[test]
    fn pinch_merges_and_releases() {
        let mut array: BucketArray<u64, ()> = BucketArray::new(0, 0.75);
        for k in 0..4096_u64 {
            array.insert(k.wrapping_mul(0x9E37_79B9_7F4A_7C15), k, ());
            array.grow();
        }
        let grown = array.num_buckets();
        for k in 8..4096_u64 {
            assert!(array.remove(k.wrapping_mul(0x9E37_79B9_7F4A_7C15), &k).is_some());
        }
        assert!(array.pinch().is_some());
        assert!(array.num_buckets() < grown);
        assert!(array.num_slots() <= 2 + 8);
        for k in 0..8_u64 {
            assert!(array.find(k.wrapping_mul(0x9E37_79B9_7F4A_7C15), &k).is_some());
        }
    }

    proptest! {
        #[test]
        fn insert_remove(ops in prop::collection::vec((0_u64..128, any::<bool>()), 0..512)) {
            let mut array: BucketArray<u64, ()> = BucketArray::new(0, 0.75);
            let mut model = std::collections::BTreeSet::new();
            for (k, remove) in ops {
                let hash = k.wrapping_mul(31);
                if remove {
                    prop_assert_eq!(array.remove(hash, &k).is_some(), model.remove(&k));
                } else if array.find(hash, &k).is_none() {
                    array.insert(hash, k, ());
                    array.grow();
                    model.insert(k);
                }
                prop_assert_eq!(array.len(), model.len());
            }
            for k in &model {
                prop_assert!(array.find(k.wrapping_mul(31), k).is_some());
            }
            array.pinch();
            for k in &model {
                prop_assert!(array.find(k.wrapping_mul(31), k).is_some());
            }
            prop_assert_eq!(array.nodes().count(), model.len());
        }
    }
}
