//! The slot-based distributed-transaction coordinator.
//!
//! A transaction wraps exactly one operation plus the set of slot
//! participants it fans out to, and surfaces durability progress through
//! two user callbacks: one when the first participant reports durability,
//! one when all of them have (or when the transaction fails, identifying
//! the first dead peer).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use static_assertions::const_assert;
use tinyvec::ArrayVec;

use crate::errors::{DtmError, Result};
use crate::oper::{Op, UpdateSpec};
use crate::types::{InstanceId, UpdateRule, Version};

/// Upper bound on the participants of one transaction.
pub const MAX_SLOTS: usize = 16;
const_assert!(MAX_SLOTS <= 16);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DtxState {
    /// Empty transaction.
    Init,
    /// Carries an operation.
    InProgress,
    /// Every participant acknowledged receipt.
    Executed,
    /// At least one participant reported durability.
    Persistent,
    /// Every participant reported durability.
    Stable,
    /// Released by the user.
    Done,
    /// A participant died underneath the transaction.
    Failed,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Participant {
    pub rem: InstanceId,
    /// The owner's slot version when the participant joined.
    pub slot_ver: Version,
    pub done: bool,
}

/// Callback payload: the transaction state and, for failures, the first
/// peer that took the transaction down.
#[derive(Clone, Copy, Debug)]
pub struct DtxStatus {
    pub state: DtxState,
    pub failed: Option<InstanceId>,
}

pub type DtxCallback = Box<dyn Fn(&DtxStatus) + Send + Sync>;

pub struct Dtx0 {
    on_persistent: DtxCallback,
    on_stable: DtxCallback,
    inner: Mutex<DtxInner>,
}

struct DtxInner {
    state: DtxState,
    failed: Option<InstanceId>,
    op: Weak<Op>,
    has_op: bool,
    persistent_seen: bool,
    participants: ArrayVec<[Participant; MAX_SLOTS]>,
}

impl Dtx0 {
    pub fn new(on_persistent: DtxCallback, on_stable: DtxCallback) -> Arc<Dtx0> {
        Arc::new(Dtx0 {
            on_persistent,
            on_stable,
            inner: Mutex::new(DtxInner {
                state: DtxState::Init,
                failed: None,
                op: Weak::new(),
                has_op: false,
                persistent_seen: false,
                participants: ArrayVec::new(),
            }),
        })
    }

    /// Attaches the operation. One operation per transaction; a stronger
    /// transaction needs a new one. For every peer the operation reaches,
    /// a slot participant is recorded at the owner's current slot
    /// version, and a slot update ordering the operation is added.
    ///
    /// Must run after the updates joined the operation and before it is
    /// prepared.
    pub fn add(self: &Arc<Self>, op: &Arc<Op>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.has_op {
            return Err(DtmError::Internal("one operation per transaction"));
        }
        let peers = op.participants();
        if peers.len() > MAX_SLOTS {
            return Err(DtmError::Internal("too many participants"));
        }
        if !peers.is_empty() {
            let dtm = op
                .dtm()
                .ok_or(DtmError::Internal("operation outlived its instance"))?;
            op.add(UpdateSpec {
                history: dtm.slot().clone(),
                rule: UpdateRule::Inc,
                ver: None,
                payload: Vec::new(),
            })?;
            let slot_ver = dtm.slot().high_ver();
            for rem in peers {
                inner.participants.push(Participant {
                    rem,
                    slot_ver,
                    done: false,
                });
            }
        }
        inner.op = Arc::downgrade(op);
        inner.has_op = true;
        inner.state = DtxState::InProgress;
        drop(inner);
        op.set_dtx(self);
        Ok(())
    }

    /// Reserved; closing is currently implied by `add`.
    pub fn close(&self) {}

    /// Marks a stable transaction released.
    pub fn done(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != DtxState::Stable {
            return Err(DtmError::Internal("releasing an unstable transaction"));
        }
        inner.state = DtxState::Done;
        Ok(())
    }

    pub fn state(&self) -> DtxState {
        self.inner.lock().state
    }

    pub fn status(&self) -> DtxStatus {
        let inner = self.inner.lock();
        DtxStatus {
            state: inner.state,
            failed: inner.failed,
        }
    }

    pub fn op(&self) -> Option<Arc<Op>> {
        self.inner.lock().op.upgrade()
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().participants.len()
    }

    pub(crate) fn note_inprogress(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DtxState::Init {
            inner.state = DtxState::InProgress;
        }
    }

    pub(crate) fn note_executed(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DtxState::InProgress {
            inner.state = DtxState::Executed;
        }
    }

    /// One participant reported durability.
    pub(crate) fn note_persistent(&self, peer: InstanceId) {
        let (fire_persistent, fire_stable, status) = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, DtxState::Failed | DtxState::Done) {
                return;
            }
            match inner.participants.iter_mut().find(|p| p.rem == peer) {
                Some(p) if !p.done => p.done = true,
                _ => return,
            }
            let first = !inner.persistent_seen;
            inner.persistent_seen = true;
            let all = inner.participants.iter().all(|p| p.done);
            if first && inner.state < DtxState::Persistent {
                inner.state = DtxState::Persistent;
            }
            if all {
                inner.state = DtxState::Stable;
            }
            (
                first,
                all,
                DtxStatus {
                    state: inner.state,
                    failed: inner.failed,
                },
            )
        };
        if fire_persistent {
            (self.on_persistent)(&status);
        }
        if fire_stable {
            (self.on_stable)(&status);
        }
    }

    /// A participant died. Terminal unless the transaction already
    /// stabilised; the first dead peer is what the user gets to see.
    pub(crate) fn note_failed(&self, peer: Option<InstanceId>) {
        let status = {
            let mut inner = self.inner.lock();
            if inner.state >= DtxState::Stable {
                return;
            }
            inner.state = DtxState::Failed;
            if inner.failed.is_none() {
                inner.failed = peer;
            }
            DtxStatus {
                state: inner.state,
                failed: inner.failed,
            }
        };
        (self.on_stable)(&status);
    }
}

impl std::fmt::Debug for Dtx0 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Dtx0")
            .field("state", &inner.state)
            .field("participants", &inner.participants.len())
            .finish()
    }
}
