//! # Reply Cache
//!
//! Remembers the acknowledgement of recently applied mutations by request
//! token, so a retried mutation whose first reply was lost is answered from
//! the cache instead of being applied twice.
//!
//! The cache is bounded; the oldest token is forgotten first. Retries arrive
//! within one operation deadline, so a few thousand entries cover far more
//! in-flight mutations than any single client keeps.

use std::collections::VecDeque;

use ahash::RandomState;
use hashbrown::HashMap;

use radx_common::{Ack, RequestToken};

/// Default number of remembered tokens.
pub const DEFAULT_REPLY_CAPACITY: usize = 8192;

/// Bounded token -> ack map with FIFO eviction.
#[derive(Debug)]
pub struct ReplyCache {
    acks: HashMap<RequestToken, Ack, RandomState>,
    order: VecDeque<RequestToken>,
    capacity: usize,
}

impl ReplyCache {
    /// Creates a cache holding at most `capacity` tokens (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ReplyCache {
            acks: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the recorded ack for `token`, if any.
    pub fn get(&self, token: &RequestToken) -> Option<Ack> {
        self.acks.get(token).copied()
    }

    /// Records the ack for an applied mutation, evicting the oldest entry when full.
    pub fn insert(&mut self, token: RequestToken, ack: Ack) {
        if self.acks.insert(token, ack).is_some() {
            return;
        }
        self.order.push_back(token);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.acks.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }
}

impl Default for ReplyCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_REPLY_CAPACITY)
    }
}
