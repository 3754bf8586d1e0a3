use std::collections::HashMap;

use crate::ids::ClientId;

/// Per-client token bucket (§4.4).
///
/// Capacity is `inflow * capacity_factor`. A bucket is lazily created at
/// full capacity on the first mention of a cid and never expires — the set
/// of known clients only grows, until the process restarts.
///
/// The boundary check is strict `<`, not `<=`: a cost equal to the current
/// bucket level is rejected. This is preserved deliberately (§9 Open
/// Questions) rather than "fixed" to `<=`, since the distillation this
/// crate was built from explicitly calls out that the strict check is
/// intentional, observable behavior, not a bug.
pub struct RateLimiter {
    capacity: f64,
    inflow: f64,
    buckets: HashMap<ClientId, f64>,
}

impl RateLimiter {
    pub fn new(inflow: f64, capacity_factor: f64) -> Self {
        Self {
            capacity: inflow * capacity_factor,
            inflow,
            buckets: HashMap::new(),
        }
    }

    /// Returns `true` (accepted, tokens deducted) or `false` (rejected,
    /// bucket left untouched).
    pub fn check(&mut self, cid: &ClientId, cost: f64) -> bool {
        let bucket = self.buckets.entry(cid.clone()).or_insert(self.capacity);
        if cost < *bucket {
            *bucket -= cost;
            true
        } else {
            false
        }
    }

    /// Periodic refill: add `inflow` to every known bucket, capped at
    /// `capacity`. Called on a fixed tick by the owning worker.
    pub fn add_tokens_all(&mut self) {
        for bucket in self.buckets.values_mut() {
            *bucket = (*bucket + self.inflow).min(self.capacity);
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(s: &str) -> ClientId {
        ClientId::from_raw_bytes(s.as_bytes())
    }

    #[test]
    fn first_mention_starts_at_full_capacity() {
        let mut rl = RateLimiter::new(10.0, 2.0);
        assert_eq!(rl.capacity(), 20.0);
        assert!(rl.check(&cid("a"), 19.0));
    }

    #[test]
    fn rejects_at_exact_capacity() {
        let mut rl = RateLimiter::new(10.0, 2.0); // capacity == 20
        assert!(!rl.check(&cid("a"), 20.0));
    }

    #[test]
    fn accepts_one_below_capacity() {
        let mut rl = RateLimiter::new(10.0, 2.0); // capacity == 20
        assert!(rl.check(&cid("a"), 19.0));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let mut rl = RateLimiter::new(10.0, 1.0); // capacity == 10
        rl.check(&cid("a"), 1.0); // bucket now 9
        rl.add_tokens_all();
        rl.add_tokens_all();
        assert!(!rl.check(&cid("a"), 10.0)); // still capped at 10, strict <
    }

    #[test]
    fn buckets_are_independent_per_client() {
        let mut rl = RateLimiter::new(5.0, 1.0);
        assert!(rl.check(&cid("a"), 4.0));
        assert!(rl.check(&cid("b"), 4.0));
    }
}
