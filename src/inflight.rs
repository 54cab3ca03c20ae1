// In-flight id allocator
//
// A 64-slot atomic bitset. Each slot identifies one round of command buffer
// usage that has been handed out and not yet confirmed consumed by the GPU.
// The bitset only orders destruction timing, never other memory accesses,
// so every operation is relaxed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of rounds that may be outstanding at once, per queue
pub const MAX_IN_FLIGHT: usize = 64;

/// Identifies one outstanding round of command buffer usage.
///
/// Ids are recycled once their round is consumed, so an id is only unique
/// among the rounds outstanding at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InFlightId(u8);

impl InFlightId {
    pub fn new(index: usize) -> Option<Self> {
        (index < MAX_IN_FLIGHT).then_some(Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// This id's bit in an in-flight bitset
    pub fn bit(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for InFlightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lock-free allocator for in-flight ids
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    bits: AtomicU64,
    /// Monotonic; biases the search away from recently issued ids
    counter: AtomicU64,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free id, or `None` when all 64 are outstanding.
    ///
    /// Bits below `counter % 64` count as used this cycle and are only
    /// searched when everything above the hint is taken. Consecutive rounds
    /// therefore tend to get different ids even when earlier ids have been
    /// released, which keeps GC stamps from aliasing recycled rounds.
    pub fn try_acquire(&self) -> Option<InFlightId> {
        let hint = self.counter.fetch_add(1, Ordering::Relaxed) % MAX_IN_FLIGHT as u64;
        let recently_used = (1u64 << hint) - 1;

        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let mut free = !(current | recently_used);
            if free == 0 {
                free = !current;
            }
            if free == 0 {
                return None;
            }

            let index = free.trailing_zeros();
            let claimed = current | (1u64 << index);
            match self.bits.compare_exchange_weak(
                current,
                claimed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return InFlightId::new(index as usize),
                Err(actual) => current = actual,
            }
        }
    }

    /// Return an id to the pool. Releasing a clear bit is harmless.
    pub fn release(&self, id: InFlightId) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let released = current & !id.bit();
            match self.bits.compare_exchange_weak(
                current,
                released,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// The current in-flight bitset
    pub fn snapshot(&self) -> u64 {
        self.bits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn fresh_registry_hands_out_ascending_ids() {
        let registry = InFlightRegistry::new();
        let ids: Vec<_> = (0..4).map(|_| registry.try_acquire().unwrap().index()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(registry.snapshot(), 0b1111);
    }

    #[test]
    fn released_ids_are_not_reissued_immediately() {
        let registry = InFlightRegistry::new();
        let a = registry.try_acquire().unwrap();
        let b = registry.try_acquire().unwrap();
        registry.release(a);
        registry.release(b);

        let c = registry.try_acquire().unwrap();
        let d = registry.try_acquire().unwrap();
        assert_eq!(registry.snapshot(), (1 << 2) | (1 << 3));
        assert_ne!(c, a);
        assert_ne!(d, b);
    }

    #[test]
    fn sixty_fifth_acquire_fails_until_a_release() {
        let registry = InFlightRegistry::new();
        let ids: Vec<_> = (0..MAX_IN_FLIGHT)
            .map(|_| registry.try_acquire().expect("slot available"))
            .collect();
        assert_eq!(registry.snapshot(), u64::MAX);
        assert!(registry.try_acquire().is_none());

        registry.release(ids[17]);
        let id = registry.try_acquire().expect("released slot");
        assert_eq!(id, ids[17]);
        assert!(registry.try_acquire().is_none());
    }

    #[test]
    fn search_wraps_below_the_hint() {
        let registry = InFlightRegistry::new();
        let ids: Vec<_> = (0..MAX_IN_FLIGHT).map(|_| registry.try_acquire().unwrap()).collect();
        registry.release(ids[0]);
        // Counter is far past zero, the only free bit sits below the hint
        for _ in 0..10 {
            let id = registry.try_acquire().unwrap();
            assert_eq!(id.index(), 0);
            registry.release(id);
        }
    }

    #[test]
    fn releasing_a_clear_bit_is_harmless() {
        let registry = InFlightRegistry::new();
        let a = registry.try_acquire().unwrap();
        registry.release(a);
        registry.release(a);
        assert_eq!(registry.snapshot(), 0);
    }

    #[test]
    fn snapshot_tracks_random_sequences() {
        let registry = InFlightRegistry::new();
        let mut held: HashSet<InFlightId> = HashSet::new();
        let mut rng = rand::thread_rng();

        for _ in 0..10_000 {
            if rng.gen_bool(0.55) {
                match registry.try_acquire() {
                    Some(id) => assert!(held.insert(id), "{} handed out twice", id),
                    None => assert_eq!(held.len(), MAX_IN_FLIGHT),
                }
            } else if let Some(&id) = held.iter().next() {
                held.remove(&id);
                registry.release(id);
            }

            let expected = held.iter().fold(0u64, |bits, id| bits | id.bit());
            assert_eq!(registry.snapshot(), expected);
        }
    }

    #[test]
    fn concurrent_owners_never_share_an_id() {
        let registry = Arc::new(InFlightRegistry::new());

        for _ in 0..50 {
            // Eight threads race for eight ids each; together they fill the set
            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    std::thread::spawn(move || {
                        (0..8)
                            .map(|_| registry.try_acquire().expect("slot available"))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let mut seen = HashSet::new();
            let mut all = Vec::new();
            for thread in threads {
                for id in thread.join().unwrap() {
                    assert!(seen.insert(id), "{} handed to two owners", id);
                    all.push(id);
                }
            }
            assert_eq!(registry.snapshot(), u64::MAX);
            assert!(registry.try_acquire().is_none());

            let releasers: Vec<_> = all
                .chunks(8)
                .map(|chunk| {
                    let registry = registry.clone();
                    let chunk = chunk.to_vec();
                    std::thread::spawn(move || chunk.into_iter().for_each(|id| registry.release(id)))
                })
                .collect();
            for releaser in releasers {
                releaser.join().unwrap();
            }
            assert_eq!(registry.snapshot(), 0);
        }
    }
}
