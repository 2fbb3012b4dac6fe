//! Process-local blacklist of failed proxies with explicit expiry.
//!
//! Entries live in an arena of slots. Each insertion stamps the slot with a
//! fresh generation and queues `(expiry, slot, generation)`; a queued entry
//! whose generation no longer matches its slot was superseded and is skipped.
//! Since every entry gets the same TTL the queue stays ordered by expiry.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Slot {
    address: String,
    generation: u64,
}

#[derive(Debug)]
pub struct Blacklist {
    ttl: Duration,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    expiry: VecDeque<(Instant, usize, u64)>,
    next_generation: u64,
}

impl Blacklist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            expiry: VecDeque::new(),
            next_generation: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Blacklist `address` for one TTL from now, renewing an existing entry.
    pub fn insert(&mut self, address: &str) {
        self.purge_expired();
        let generation = self.next_generation;
        self.next_generation += 1;

        let existing = self.index.get(address).copied();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let slot = self.free.pop().unwrap_or_else(|| {
                    self.slots.push(None);
                    self.slots.len() - 1
                });
                self.index.insert(address.to_string(), slot);
                slot
            }
        };
        self.slots[slot] = Some(Slot {
            address: address.to_string(),
            generation,
        });
        self.expiry.push_back((Instant::now() + self.ttl, slot, generation));
    }

    pub fn contains(&mut self, address: &str) -> bool {
        self.purge_expired();
        self.index.contains_key(address)
    }

    pub fn len(&mut self) -> usize {
        self.purge_expired();
        self.index.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose TTL has elapsed.
    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        while let Some(&(expires, slot, generation)) = self.expiry.front() {
            if expires > now {
                break;
            }
            self.expiry.pop_front();
            let current = self.slots[slot].as_ref().map(|s| s.generation);
            if current != Some(generation) {
                continue;
            }
            if let Some(entry) = self.slots[slot].take() {
                self.index.remove(&entry.address);
                self.free.push(slot);
            }
        }
    }
}
