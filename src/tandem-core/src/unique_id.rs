//! Collision-free identifiers for playlist entries.
//!
//! IDs are drawn from an injected random source and checked against the set of
//! live IDs; a collision simply draws again. Because new IDs are independent
//! random values, a released ID can be handed out again without any
//! generation bookkeeping.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::num::ParseIntError;
use std::rc::Rc;
use std::str::FromStr;
use thiserror::Error;

/// A 64-bit entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(pub u64);

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UniqueId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(UniqueId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UniqueIdError {
    #[error("unique id {0} is already in use")]
    Duplicate(UniqueId),
}

/// Allocator scope shared by the playlists of one set.
pub type SharedIdAllocator = Rc<RefCell<UniqueIdAllocator>>;

pub struct UniqueIdAllocator {
    in_use: HashSet<UniqueId>,
    rng: Box<dyn RngCore>,
}

impl fmt::Debug for UniqueIdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueIdAllocator")
            .field("in_use", &self.in_use.len())
            .finish_non_exhaustive()
    }
}

impl Default for UniqueIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl UniqueIdAllocator {
    /// Allocator seeded from OS entropy.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: impl RngCore + 'static) -> Self {
        Self {
            in_use: HashSet::new(),
            rng: Box::new(rng),
        }
    }

    /// Deterministic allocator, for tests and reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn shared(self) -> SharedIdAllocator {
        Rc::new(RefCell::new(self))
    }

    /// Draw a fresh ID that is not currently live and register it.
    pub fn create_new(&mut self) -> UniqueId {
        loop {
            let candidate = UniqueId(self.rng.next_u64());
            if self.in_use.insert(candidate) {
                return candidate;
            }
            tracing::trace!(id = %candidate, "unique id collision, drawing again");
        }
    }

    /// Register an ID that was handed out earlier, e.g. one read back from disk.
    pub fn insert(&mut self, id: UniqueId) -> Result<(), UniqueIdError> {
        if self.in_use.insert(id) {
            Ok(())
        } else {
            Err(UniqueIdError::Duplicate(id))
        }
    }

    /// Release an ID. Returns false if it was not live.
    pub fn erase(&mut self, id: UniqueId) -> bool {
        self.in_use.remove(&id)
    }

    pub fn contains(&self, id: UniqueId) -> bool {
        self.in_use.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}
