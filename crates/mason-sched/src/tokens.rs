//! Concurrency tokens.
//!
//! Each queue consumes tokens of one resource class; a worker is only spawned
//! once a token is reserved, and the token is held for the whole job lifetime
//! including retries.

/// The shared resource a queue's workers consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// Network-bound source operations (track, fetch, pull).
    Fetch,
    /// CPU-bound build jobs.
    Build,
    /// Artifact uploads.
    Push,
}

impl ResourceClass {
    fn index(self) -> usize {
        match self {
            ResourceClass::Fetch => 0,
            ResourceClass::Build => 1,
            ResourceClass::Push => 2,
        }
    }
}

/// Counting semaphore per resource class, owned by the scheduler loop.
#[derive(Debug)]
pub struct TokenPool {
    capacity: [usize; 3],
    in_use: [usize; 3],
}

impl TokenPool {
    /// Create a pool; every capacity is clamped to at least one token.
    pub fn new(fetchers: usize, builders: usize, pushers: usize) -> Self {
        TokenPool {
            capacity: [fetchers.max(1), builders.max(1), pushers.max(1)],
            in_use: [0; 3],
        }
    }

    /// Try to reserve one token of `class`.
    pub fn reserve(&mut self, class: ResourceClass) -> bool {
        let i = class.index();
        if self.in_use[i] < self.capacity[i] {
            self.in_use[i] += 1;
            true
        } else {
            false
        }
    }

    /// Return a token of `class` to the pool.
    pub fn release(&mut self, class: ResourceClass) {
        let i = class.index();
        debug_assert!(self.in_use[i] > 0, "released a token that was never reserved");
        self.in_use[i] = self.in_use[i].saturating_sub(1);
    }

    /// Tokens of `class` currently reserved.
    pub fn in_use(&self, class: ResourceClass) -> usize {
        self.in_use[class.index()]
    }

    /// Configured capacity of `class`.
    pub fn capacity(&self, class: ResourceClass) -> usize {
        self.capacity[class.index()]
    }
}
