//! Time primitives.
//!
//! Hybrid logical stamps for triple ordering. Tick is milliseconds pushed
//! monotone past everything the clock has seen; client id breaks ties.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::identity::ClientId;

/// Hybrid timestamp - the ordering primitive for triples.
///
/// Total order: `(tick, client)`. Ties on tick are broken by client id,
/// which is unique per writer, so the order over commits is total.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub tick: u64,
    pub client: ClientId,
}

impl Stamp {
    pub fn new(tick: u64, client: ClientId) -> Self {
        Self { tick, client }
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tick
            .cmp(&other.tick)
            .then_with(|| self.client.cmp(&other.client))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tick, self.client)
    }
}

/// Wall-clock source. Swappable so tests can freeze time.
pub trait WallSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

struct SystemWall;

impl WallSource for SystemWall {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Issues strictly monotone stamps for one client.
///
/// `next` never repeats or goes backwards, even when the wall clock does.
pub struct Clock {
    client: ClientId,
    last: AtomicU64,
    wall: Arc<dyn WallSource>,
}

impl Clock {
    pub fn new(client: ClientId) -> Self {
        Self::with_wall(client, Arc::new(SystemWall))
    }

    pub fn with_wall(client: ClientId, wall: Arc<dyn WallSource>) -> Self {
        Self {
            client,
            last: AtomicU64::new(0),
            wall,
        }
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// Next stamp: `max(wall_ms, last + 1)`.
    pub fn next(&self) -> Stamp {
        let now = self.wall.now_ms();
        let mut prev = self.last.load(AtomicOrdering::Acquire);
        loop {
            let tick = now.max(prev + 1);
            match self.last.compare_exchange(
                prev,
                tick,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return Stamp::new(tick, self.client.clone()),
                Err(current) => prev = current,
            }
        }
    }

    /// Fold a remote stamp into the clock so local stamps stay ahead of it.
    pub fn observe(&self, stamp: &Stamp) {
        self.last.fetch_max(stamp.tick, AtomicOrdering::AcqRel);
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Clock({}, last={})",
            self.client,
            self.last.load(AtomicOrdering::Relaxed)
        )
    }
}
