//! In-flight transaction tracking.
//!
//! One slot per transaction kind: a second submission of a kind that is already
//! in flight is refused. Slots are released by dropping the `PendingGuard`, so
//! a failed, panicked or cancelled action can never leave a slot occupied.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    error::{Result, SessionError},
    lock,
    state::{now_ms, SessionEvent},
    types::TxHash,
};

/// User-initiated transaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Buy,
    Approve,
    Stake,
    Withdraw,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxKind::Buy => "buy",
            TxKind::Approve => "approve",
            TxKind::Stake => "stake",
            TxKind::Withdraw => "withdraw",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    pub kind: TxKind,
    pub submitted_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<TxHash>,
}

/// Slot table keyed by kind. Each claim gets a sequence number so a stale
/// guard or ticket never touches a later claim of the same kind.
#[derive(Default)]
pub struct PendingTransactions {
    slots: Mutex<HashMap<TxKind, (u64, PendingTransaction)>>,
    next_seq: AtomicU64,
}

/// Holds a kind's slot; dropping it clears the slot.
#[must_use]
pub struct PendingGuard {
    kind: TxKind,
    seq: u64,
    set: Arc<PendingTransactions>,
}

/// Handed to a submit action so it can attach the hash once the wallet returns it.
#[derive(Clone)]
pub struct TxTicket {
    kind: TxKind,
    seq: u64,
    set: Arc<PendingTransactions>,
    events: broadcast::Sender<SessionEvent>,
}

impl PendingTransactions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot for `kind`, or fail with `AlreadyPending`.
    pub fn try_begin(self: &Arc<Self>, kind: TxKind) -> Result<PendingGuard> {
        let mut slots = lock(&self.slots);
        if slots.contains_key(&kind) {
            return Err(SessionError::AlreadyPending(kind));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            kind,
            (
                seq,
                PendingTransaction {
                    kind,
                    submitted_at_ms: now_ms(),
                    hash: None,
                },
            ),
        );
        Ok(PendingGuard {
            kind,
            seq,
            set: Arc::clone(self),
        })
    }

    pub fn is_pending(&self, kind: TxKind) -> bool {
        lock(&self.slots).contains_key(&kind)
    }

    pub fn snapshot(&self) -> Vec<PendingTransaction> {
        let mut list: Vec<PendingTransaction> =
            lock(&self.slots).values().map(|(_, p)| p.clone()).collect();
        list.sort_by_key(|p| p.submitted_at_ms);
        list
    }

    fn record_hash(&self, kind: TxKind, seq: u64, hash: TxHash) -> bool {
        match lock(&self.slots).get_mut(&kind) {
            Some((slot_seq, slot)) if *slot_seq == seq => {
                slot.hash = Some(hash);
                true
            }
            _ => false,
        }
    }

    fn release(&self, kind: TxKind, seq: u64) {
        let mut slots = lock(&self.slots);
        if slots.get(&kind).is_some_and(|(slot_seq, _)| *slot_seq == seq) {
            slots.remove(&kind);
        }
    }
}

impl PendingGuard {
    pub fn kind(&self) -> TxKind {
        self.kind
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.set.release(self.kind, self.seq);
    }
}

impl TxTicket {
    pub(crate) fn new(
        guard: &PendingGuard,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            kind: guard.kind,
            seq: guard.seq,
            set: Arc::clone(&guard.set),
            events,
        }
    }

    pub fn kind(&self) -> TxKind {
        self.kind
    }

    pub fn record_hash(&self, hash: TxHash) {
        if self.set.record_hash(self.kind, self.seq, hash) {
            tracing::info!(kind = %self.kind, hash = %hash, "transaction submitted");
            let _ = self.events.send(SessionEvent::TxSubmitted {
                kind: self.kind,
                hash,
            });
        }
    }
}
