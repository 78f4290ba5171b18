//! Access-ordered index of cache entries
//!
//! Entries live in a slab of doubly linked nodes, threaded from the least
//! recently used (head) to the most recently used (tail), with a hash map from
//! key to slab slot. Touching, inserting, removing and finding the eviction
//! candidate are all O(1) apart from skipping entries that are being edited.

use std::collections::HashMap;

const NIL: usize = usize::MAX;

/// Metadata for one cached key
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub key: String,
    /// Committed byte length of each slot
    pub lengths: Vec<u64>,
    /// True once the entry has been committed at least once
    pub readable: bool,
    /// Id of the live editor, if any. Recovered DIRTY markers use
    /// [`RECOVERED_EDITOR`] since their writer no longer exists.
    pub current_editor: Option<u64>,
    /// Sequence number of the most recent successful commit
    pub sequence_number: u64,
}

/// Editor id given to DIRTY records found during journal replay.
pub(crate) const RECOVERED_EDITOR: u64 = 0;

impl Entry {
    pub fn new(key: &str, value_count: usize) -> Self {
        Self {
            key: key.to_string(),
            lengths: vec![0; value_count],
            readable: false,
            current_editor: None,
            sequence_number: 0,
        }
    }

    pub fn total_length(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

#[derive(Debug)]
struct Node {
    entry: Entry,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
pub(crate) struct EntryIndex {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    slots: HashMap<String, usize>,
    head: usize,
    tail: usize,
}

impl EntryIndex {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            slots: HashMap::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Look up an entry without changing its recency
    pub fn get(&self, key: &str) -> Option<&Entry> {
        let slot = *self.slots.get(key)?;
        self.nodes[slot].as_ref().map(|node| &node.entry)
    }

    /// Mutable lookup without changing recency
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        let slot = *self.slots.get(key)?;
        self.nodes[slot].as_mut().map(|node| &mut node.entry)
    }

    /// Move the entry to the most recently used end
    pub fn touch(&mut self, key: &str) -> bool {
        match self.slots.get(key) {
            Some(&slot) => {
                self.unlink(slot);
                self.push_back(slot);
                true
            }
            None => false,
        }
    }

    /// Touch the entry for `key`, creating an empty one at the most recently
    /// used end if it does not exist yet
    pub fn get_or_insert(&mut self, key: &str, value_count: usize) -> &mut Entry {
        let slot = match self.slots.get(key) {
            Some(&slot) => {
                self.unlink(slot);
                slot
            }
            None => {
                let node = Node {
                    entry: Entry::new(key, value_count),
                    prev: NIL,
                    next: NIL,
                };
                let slot = match self.free.pop() {
                    Some(slot) => {
                        self.nodes[slot] = Some(node);
                        slot
                    }
                    None => {
                        self.nodes.push(Some(node));
                        self.nodes.len() - 1
                    }
                };
                self.slots.insert(key.to_string(), slot);
                slot
            }
        };
        self.push_back(slot);
        &mut self.node_mut(slot).entry
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let slot = self.slots.remove(key)?;
        self.unlink(slot);
        self.free.push(slot);
        self.nodes[slot].take().map(|node| node.entry)
    }

    /// Least recently used entry that is not being edited
    pub fn eviction_candidate(&self) -> Option<&Entry> {
        self.iter().find(|entry| entry.current_editor.is_none())
    }

    /// Entries from least to most recently used
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            index: self,
            cursor: self.head,
        }
    }

    fn node(&self, slot: usize) -> &Node {
        self.nodes[slot]
            .as_ref()
            .unwrap_or_else(|| unreachable!("linked slot {} is vacant", slot))
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.nodes[slot]
            .as_mut()
            .unwrap_or_else(|| unreachable!("linked slot {} is vacant", slot))
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }

        let node = self.node_mut(slot);
        node.prev = NIL;
        node.next = NIL;
    }

    fn push_back(&mut self, slot: usize) {
        let tail = self.tail;
        {
            let node = self.node_mut(slot);
            node.prev = tail;
            node.next = NIL;
        }

        if tail == NIL {
            self.head = slot;
        } else {
            self.node_mut(tail).next = slot;
        }
        self.tail = slot;
    }
}

pub(crate) struct Iter<'a> {
    index: &'a EntryIndex,
    cursor: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Entry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = self.index.node(self.cursor);
        self.cursor = node.next;
        Some(&node.entry)
    }
}
