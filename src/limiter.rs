use std::collections::HashMap;
use std::sync::Mutex;

/// Per-identity write cooldown.
///
/// One ledger is shared by every mutating entry point, so a client cannot
/// interleave chat sends and document writes to get around the cooldown.
#[derive(Debug)]
pub struct RateLimiter {
    cooldown_ms: u64,
    last_accepted: Mutex<HashMap<String, u64>>,
}

impl RateLimiter {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            cooldown_ms,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms
    }

    /// Admit a write at `now_ms`, recording it as the identity's latest.
    /// Returns false without touching the ledger while the cooldown runs.
    pub fn admit(&self, identity: &str, now_ms: u64) -> bool {
        let mut ledger = match self.last_accepted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(&last) = ledger.get(identity) {
            if now_ms.saturating_sub(last) < self.cooldown_ms {
                return false;
            }
        }
        ledger.insert(identity.to_string(), now_ms);
        true
    }

    /// Drop entries whose last write is older than `max_age_ms`.
    pub fn sweep(&self, now_ms: u64, max_age_ms: u64) -> usize {
        let mut ledger = match self.last_accepted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = ledger.len();
        ledger.retain(|_, last| now_ms.saturating_sub(*last) <= max_age_ms);
        before - ledger.len()
    }

    pub fn len(&self) -> usize {
        self.last_accepted.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
