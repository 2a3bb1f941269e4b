//! Single-use nonce store for SIWE challenge binding.
//!
//! Nonces are 16 random bytes rendered as 32 hex characters. A nonce is
//! `issued` on creation and leaves that state exactly once, through the
//! atomic check-and-set in [`NonceStore::consume`]. The store is an
//! in-process map guarded by one mutex, which is sufficient for a
//! single-instance deployment; a multi-instance deployment must replace it
//! with a store offering conditional writes.

use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Number of random bytes in a nonce (rendered as 32 hex characters).
const NONCE_BYTES: usize = 16;

/// How many times `issue` retries on a collision before giving up. With a
/// 128-bit space this is unreachable in practice.
const ISSUE_RETRIES: usize = 3;

/// Interval between background sweeps of expired and consumed entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceState {
    Issued,
    Consumed,
}

#[derive(Debug, Clone, Copy)]
struct NonceRecord {
    issued_at: Instant,
    state: NonceState,
}

/// Error returned by [`NonceStore::issue`].
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    /// Repeated collisions with live nonces; retryable.
    #[error("nonce collision persisted across retries")]
    Collision,
}

/// Error returned by [`NonceStore::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConsumeError {
    /// The nonce was never issued, or has been swept.
    #[error("nonce not found")]
    NotFound,
    /// The nonce outlived its TTL without being consumed.
    #[error("nonce expired")]
    Expired,
    /// The nonce was already consumed by an earlier verification.
    #[error("nonce already consumed")]
    AlreadyConsumed,
}

/// In-memory store of issued nonces with TTL expiry.
#[derive(Debug)]
pub struct NonceStore {
    inner: Mutex<HashMap<String, NonceRecord>>,
    ttl: Duration,
}

impl NonceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// TTL applied to issued nonces, exposed for the `expiresIn` response field.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Draws a fresh nonce from the thread CSPRNG and records it as issued.
    pub fn issue(&self) -> Result<String, IssueError> {
        let mut rng = rand::rng();
        let mut guard = self.inner.lock().expect("nonce store mutex poisoned");
        for _ in 0..ISSUE_RETRIES {
            let mut bytes = [0u8; NONCE_BYTES];
            rng.fill_bytes(&mut bytes);
            let nonce = hex::encode(bytes);
            let collision = guard
                .get(&nonce)
                .is_some_and(|record| record.state == NonceState::Issued);
            if collision {
                continue;
            }
            guard.insert(
                nonce.clone(),
                NonceRecord {
                    issued_at: Instant::now(),
                    state: NonceState::Issued,
                },
            );
            return Ok(nonce);
        }
        Err(IssueError::Collision)
    }

    /// Atomically consumes a nonce.
    ///
    /// Succeeds only if the nonce exists, is still within its TTL, and is in
    /// the issued state. This is the sole transition out of `issued`; under
    /// any interleaving of concurrent callers, at most one sees `Ok`.
    pub fn consume(&self, nonce: &str) -> Result<(), ConsumeError> {
        let mut guard = self.inner.lock().expect("nonce store mutex poisoned");
        let record = guard.get_mut(nonce).ok_or(ConsumeError::NotFound)?;
        match record.state {
            NonceState::Consumed => Err(ConsumeError::AlreadyConsumed),
            NonceState::Issued => {
                if record.issued_at.elapsed() > self.ttl {
                    // Lazy eviction: the sweeper would drop it anyway.
                    guard.remove(nonce);
                    Err(ConsumeError::Expired)
                } else {
                    record.state = NonceState::Consumed;
                    Ok(())
                }
            }
        }
    }

    /// Removes expired issued nonces and consumed nonces past the TTL.
    fn sweep(&self) {
        let ttl = self.ttl;
        let mut guard = self.inner.lock().expect("nonce store mutex poisoned");
        guard.retain(|_, record| record.issued_at.elapsed() <= ttl);
    }

    /// Spawns the periodic sweeper, stopping when `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => store.sweep(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("nonce store mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_produces_32_hex_chars() {
        let store = NonceStore::new(Duration::from_secs(300));
        let nonce = store.issue().expect("issue");
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn consume_is_single_use() {
        let store = NonceStore::new(Duration::from_secs(300));
        let nonce = store.issue().expect("issue");
        assert_eq!(store.consume(&nonce), Ok(()));
        assert_eq!(store.consume(&nonce), Err(ConsumeError::AlreadyConsumed));
    }

    #[test]
    fn consume_unknown_nonce_fails() {
        let store = NonceStore::new(Duration::from_secs(300));
        assert_eq!(
            store.consume("3299fc077a123060ec462faa24375dc4"),
            Err(ConsumeError::NotFound)
        );
    }

    #[test]
    fn consume_expired_nonce_fails() {
        let store = NonceStore::new(Duration::from_millis(0));
        let nonce = store.issue().expect("issue");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.consume(&nonce), Err(ConsumeError::Expired));
    }

    #[test]
    fn concurrent_consumers_only_one_succeeds() {
        let store = Arc::new(NonceStore::new(Duration::from_secs(300)));
        let nonce = store.issue().expect("issue");
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let nonce = nonce.clone();
            handles.push(std::thread::spawn(move || store.consume(&nonce).is_ok()));
        }
        let successes = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn sweep_drops_stale_entries() {
        let store = NonceStore::new(Duration::from_millis(0));
        store.issue().expect("issue");
        std::thread::sleep(Duration::from_millis(5));
        store.sweep();
        assert_eq!(store.len(), 0);
    }
}
