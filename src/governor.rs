//! Enforces a per-client and a global concurrent-job cap.
//!
//! A small keyed counter guarded by one lock, plus a global atomic; tokens
//! decrement both on `Drop` so a panicking or early-returning caller can't
//! leak a reservation.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("concurrency cap reached")]
pub struct Rejected;

struct Inner {
    per_client_cap: u32,
    global_cap: u32,
    per_client: Mutex<HashMap<String, u32>>,
    global: AtomicU32,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyGovernor {
    inner: Arc<Inner>,
}

impl ConcurrencyGovernor {
    pub fn new(per_client_cap: u32, global_cap: u32) -> ConcurrencyGovernor {
        ConcurrencyGovernor {
            inner: Arc::new(Inner {
                per_client_cap,
                global_cap,
                per_client: Mutex::new(HashMap::new()),
                global: AtomicU32::new(0),
            }),
        }
    }

    /// Reserves a slot for `key` (the client identity, e.g. remote IP).
    /// Non-blocking: returns [`Rejected`] immediately if either cap is hit.
    pub fn try_enter(&self, key: &str) -> Result<Token, Rejected> {
        let mut per_client = self.inner.per_client.lock();
        let current = per_client.get(key).copied().unwrap_or(0);
        if current >= self.inner.per_client_cap {
            return Err(Rejected);
        }
        // Reserve the global slot before committing the per-client entry so
        // a racing global-cap rejection never leaves a per-client count bumped.
        let mut global = self.inner.global.load(Ordering::Relaxed);
        loop {
            if global >= self.inner.global_cap {
                return Err(Rejected);
            }
            match self.inner.global.compare_exchange_weak(
                global,
                global + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => global = observed,
            }
        }
        per_client.insert(key.to_string(), current + 1);
        Ok(Token {
            inner: self.inner.clone(),
            key: key.to_string(),
        })
    }
}

/// A live reservation. Releases both counters when dropped.
#[derive(Debug)]
pub struct Token {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for Token {
    fn drop(&mut self) {
        let mut per_client = self.inner.per_client.lock();
        if let Some(count) = per_client.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                per_client.remove(&self.key);
            }
        }
        self.inner.global.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_client_cap_is_enforced() {
        let gov = ConcurrencyGovernor::new(2, 100);
        let a = gov.try_enter("client-a").unwrap();
        let b = gov.try_enter("client-a").unwrap();
        assert!(gov.try_enter("client-a").is_err());
        drop(a);
        let c = gov.try_enter("client-a").unwrap();
        drop(b);
        drop(c);
    }

    #[test]
    fn global_cap_is_enforced_across_clients() {
        let gov = ConcurrencyGovernor::new(10, 2);
        let _a = gov.try_enter("client-a").unwrap();
        let _b = gov.try_enter("client-b").unwrap();
        assert!(gov.try_enter("client-c").is_err());
    }

    #[test]
    fn different_clients_have_independent_counters() {
        let gov = ConcurrencyGovernor::new(1, 100);
        let _a = gov.try_enter("client-a").unwrap();
        assert!(gov.try_enter("client-b").is_ok());
    }

    #[test]
    fn dropping_token_frees_both_counters() {
        let gov = ConcurrencyGovernor::new(1, 1);
        {
            let _a = gov.try_enter("client-a").unwrap();
            assert!(gov.try_enter("client-b").is_err());
        }
        assert!(gov.try_enter("client-b").is_ok());
    }
}
