//! Process-wide usage accounting.
//!
//! [`UsageCounters`] is the only mutable state shared between requests. It
//! is created once at startup, handed to the embedding adapter, generation
//! orchestrator and query pipeline as an `Arc`, and mutated exclusively
//! through atomic increments after a provider call has returned. No lock is
//! ever held across network I/O.
//!
//! [`UsageCounters::snapshot`] produces a serializable, point-in-time copy
//! for the `/usage` endpoint; [`UsageCounters::reset`] zeroes everything.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Capability;

/// Approximate characters-per-token ratio, used when a provider does not
/// report token usage.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a piece of text.
pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}

/// Counters for one provider tier of one capability.
#[derive(Debug, Default)]
struct TierCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    tokens: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.tokens.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct CapabilityCounters {
    primary: TierCounters,
    secondary: TierCounters,
    fallbacks: AtomicU64,
}

impl CapabilityCounters {
    fn tier(&self, position: usize) -> &TierCounters {
        if position == 0 {
            &self.primary
        } else {
            &self.secondary
        }
    }

    fn snapshot(&self) -> CapabilitySnapshot {
        CapabilitySnapshot {
            primary: self.primary.snapshot(),
            secondary: self.secondary.snapshot(),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.primary.reset();
        self.secondary.reset();
        self.fallbacks.store(0, Ordering::Relaxed);
    }
}

/// Atomic usage counters shared by every request.
#[derive(Debug)]
pub struct UsageCounters {
    chat_requests: AtomicU64,
    rejected_requests: AtomicU64,
    degraded_answers: AtomicU64,
    embedding: CapabilityCounters,
    generation: CapabilityCounters,
    since: AtomicI64,
}

impl Default for UsageCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageCounters {
    pub fn new() -> Self {
        Self {
            chat_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            degraded_answers: AtomicU64::new(0),
            embedding: CapabilityCounters::default(),
            generation: CapabilityCounters::default(),
            since: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    fn capability(&self, capability: Capability) -> &CapabilityCounters {
        match capability {
            Capability::Embedding => &self.embedding,
            Capability::Generation => &self.generation,
        }
    }

    pub fn record_chat_request(&self) {
        self.chat_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded_answers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful call to the tier at `position` (0 = primary).
    pub fn record_success(&self, capability: Capability, position: usize, tokens: u64) {
        let tier = self.capability(capability).tier(position);
        tier.requests.fetch_add(1, Ordering::Relaxed);
        tier.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Record a failed call to the tier at `position`.
    pub fn record_failure(&self, capability: Capability, position: usize) {
        let tier = self.capability(capability).tier(position);
        tier.requests.fetch_add(1, Ordering::Relaxed);
        tier.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a call was served through the fallback tier.
    pub fn record_fallback(&self, capability: Capability) {
        self.capability(capability)
            .fallbacks
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let since = DateTime::from_timestamp(self.since.load(Ordering::Relaxed), 0)
            .unwrap_or_default();
        UsageSnapshot {
            since,
            chat_requests: self.chat_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            degraded_answers: self.degraded_answers.load(Ordering::Relaxed),
            embedding: self.embedding.snapshot(),
            generation: self.generation.snapshot(),
        }
    }

    /// Zero every counter and restart the `since` clock.
    pub fn reset(&self) {
        self.chat_requests.store(0, Ordering::Relaxed);
        self.rejected_requests.store(0, Ordering::Relaxed);
        self.degraded_answers.store(0, Ordering::Relaxed);
        self.embedding.reset();
        self.generation.reset();
        self.since.store(Utc::now().timestamp(), Ordering::Relaxed);
    }
}

/// Serializable copy of [`UsageCounters`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub since: DateTime<Utc>,
    pub chat_requests: u64,
    pub rejected_requests: u64,
    pub degraded_answers: u64,
    pub embedding: CapabilitySnapshot,
    pub generation: CapabilitySnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySnapshot {
    pub primary: TierSnapshot,
    pub secondary: TierSnapshot,
    pub fallbacks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub tokens: u64,
}
