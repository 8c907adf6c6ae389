//! Explicit in-flight membership for (natural key, text hash) pairs, plus a per-text
//! gate so one text is scored at most once at a time across keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::{Duration, Instant};

use pulse_core::{NaturalKey, TextHash};
use tokio::sync::{Mutex, OwnedMutexGuard};

type TextGates = Arc<StdMutex<HashMap<TextHash, Arc<Mutex<()>>>>>;

fn lock_gates(gates: &TextGates) -> StdMutexGuard<'_, HashMap<TextHash, Arc<Mutex<()>>>> {
    gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held while a text is being scored. Dropping it wakes the next waiter for the same
/// text and forgets the gate once nobody else references it.
#[derive(Debug)]
pub struct TextGuard {
    gates: TextGates,
    text_hash: TextHash,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TextGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut gates = lock_gates(&self.gates);
        if gates.get(&self.text_hash).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(&self.text_hash);
        }
    }
}

/// Proof of registration; only the matching token may release or act on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

impl LeaseToken {
    pub fn get(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    token: LeaseToken,
    expires_at: Instant,
}

/// Shared by every run in the process. Entries expire after `lease`, so a holder that
/// died without releasing never blocks the pair forever.
#[derive(Debug)]
pub struct InFlightRegistry {
    lease: Duration,
    next_token: AtomicU64,
    entries: Mutex<HashMap<(NaturalKey, TextHash), Entry>>,
    text_gates: TextGates,
}

impl InFlightRegistry {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            next_token: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            text_gates: Arc::default(),
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Register the pair unless a live entry already exists.
    pub async fn try_acquire(&self, key: &NaturalKey, text_hash: &TextHash) -> Option<LeaseToken> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let slot = (key.clone(), text_hash.clone());
        if entries.get(&slot).is_some_and(|e| e.expires_at > now) {
            return None;
        }
        let token = LeaseToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        entries.insert(
            slot,
            Entry {
                token,
                expires_at: now + self.lease,
            },
        );
        Some(token)
    }

    /// True while `token` owns a live entry for the pair.
    pub async fn is_holder(&self, key: &NaturalKey, text_hash: &TextHash, token: LeaseToken) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .get(&(key.clone(), text_hash.clone()))
            .is_some_and(|e| e.token == token && e.expires_at > now)
    }

    pub async fn release(&self, key: &NaturalKey, text_hash: &TextHash, token: LeaseToken) -> bool {
        let mut entries = self.entries.lock().await;
        let slot = (key.clone(), text_hash.clone());
        if entries.get(&slot).is_some_and(|e| e.token == token) {
            entries.remove(&slot);
            true
        } else {
            false
        }
    }

    /// Wait until no other task in this process is scoring `text_hash`, then hold the
    /// text until the returned guard drops.
    pub async fn lock_text(&self, text_hash: &TextHash) -> TextGuard {
        let gate = lock_gates(&self.text_gates)
            .entry(text_hash.clone())
            .or_default()
            .clone();
        let guard = gate.lock_owned().await;
        TextGuard {
            gates: self.text_gates.clone(),
            text_hash: text_hash.clone(),
            guard: Some(guard),
        }
    }

    pub fn text_gate_count(&self) -> usize {
        lock_gates(&self.text_gates).len()
    }

    pub async fn live_count(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.expires_at > now);
        entries.len()
    }
}
