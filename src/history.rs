//! The history / update model: a named, totally-ordered, versioned
//! sequence of updates with a durability cursor.
//!
//! A history is the smallest unit of synchronisation in the transaction
//! manager. Every mutation of its update list happens under the
//! per-history lock; paths that need several histories take the locks in
//! ascending `(type id, id)` order, and notices triggered by a state
//! change are collected under the lock but emitted after it is dropped.
//!
//! The update list is kept in two regions: a prefix of entries with
//! assigned versions, strictly sorted by version, followed by a tail of
//! entries whose version is not decided yet (local updates on mirror
//! histories waiting for the owner to mint their version).

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::errors::{DtmError, Result};
use crate::htype::{self, HistoryKind};
use crate::oper::Op;
use crate::remote::wire::HistoryAddr;
use crate::remote::Remote;
use crate::types::{InstanceId, UpState, UpdateRule, Version};

/// History behaviour flags.
///
/// `owned` marks the version-minting side; `eager` makes durability
/// progress fan out to the sibling mirrors of the same operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistoryFlags {
    pub owned: bool,
    pub eager: bool,
}

/// One ordering record within one history.
#[derive(Clone, Debug)]
pub struct Up {
    pub ver: Version,
    pub orig_ver: Version,
    pub rule: UpdateRule,
    pub state: UpState,
    /// Placeholder inserted for a version referenced before its update
    /// arrived; cleared once the authoritative data fills it.
    pub unknown: bool,
    pub(crate) tag: u64,
    pub(crate) op: Weak<Op>,
}

impl Up {
    pub fn assigned(&self) -> bool {
        self.ver != 0
    }

    fn placeholder(ver: Version) -> Up {
        Up {
            ver,
            orig_ver: 0,
            rule: UpdateRule::Inc,
            state: UpState::Future,
            unknown: true,
            tag: 0,
            op: Weak::new(),
        }
    }
}

/// Outcome of applying one wire-described update to a history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillOutcome {
    /// A placeholder or rolled-back entry took the data.
    Filled,
    /// The entry already carried the data; nothing changed.
    Existing,
    /// The entry (and any gap placeholders below it) was newly inserted.
    Inserted,
}

/// An update promoted to `Persistent` by a cursor advance, reported to the
/// kind-specific hooks.
pub(crate) struct Promoted {
    pub ver: Version,
    pub op: Weak<Op>,
}

pub struct History {
    kind: HistoryKind,
    id: InstanceId,
    rem: RwLock<Weak<Remote>>,
    inner: Mutex<HistoryInner>,
}

pub struct HistoryInner {
    pub(crate) flags: HistoryFlags,
    pub(crate) high_ver: Version,
    pub(crate) persistent: Version,
    pub(crate) sealed: bool,
    ups: Vec<Up>,
}

impl History {
    pub(crate) fn new(kind: HistoryKind, id: InstanceId, flags: HistoryFlags) -> Arc<History> {
        Arc::new(History {
            kind,
            id,
            rem: RwLock::new(Weak::new()),
            inner: Mutex::new(HistoryInner {
                flags,
                high_ver: 0,
                persistent: 0,
                sealed: false,
                ups: Vec::new(),
            }),
        })
    }

    pub fn kind(&self) -> HistoryKind {
        self.kind
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn type_id(&self) -> u8 {
        self.kind.type_id()
    }

    pub fn rem(&self) -> Option<Arc<Remote>> {
        self.rem.read().upgrade()
    }

    pub(crate) fn set_rem(&self, rem: &Arc<Remote>) {
        *self.rem.write() = Arc::downgrade(rem);
    }

    /// Takes the per-history lock. Callers touching several histories must
    /// acquire them in ascending `(type id, id)` order.
    pub fn lock(&self) -> MutexGuard<'_, HistoryInner> {
        self.inner.lock()
    }

    /// Sort key for multi-history lock acquisition.
    pub(crate) fn lock_rank(&self) -> (u8, InstanceId) {
        (self.type_id(), self.id)
    }

    /// How the receiver of a notice names this history: conjugate type id
    /// plus the history id.
    pub fn wire_addr(&self) -> HistoryAddr {
        HistoryAddr {
            htype: self.kind.remote_type_id(),
            id: self.id,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.lock().flags.owned
    }

    /// Whether the history was sealed: no further updates join it.
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    pub fn high_ver(&self) -> Version {
        self.lock().high_ver
    }

    pub fn persistent_cursor(&self) -> Version {
        self.lock().persistent
    }

    pub fn find(&self, ver: Version) -> Option<Up> {
        self.lock().find(ver).cloned()
    }

    pub fn earliest(&self) -> Option<Up> {
        self.lock().earliest().cloned()
    }

    pub fn later(&self, ver: Version) -> Option<Up> {
        self.lock().later(ver).cloned()
    }

    /// Marks everything up to `upto` durable on the owner.
    ///
    /// Idempotent: a cursor that has already passed `upto` leaves the
    /// history untouched. Updates are promoted in version order, then the
    /// kind-specific durability hooks run (without the history lock held):
    /// an eager owned history fans the progress out to the mirrors of each
    /// affected operation, a mirror forwards it to the slot of the same
    /// operation.
    pub fn mark_persistent(self: &Arc<Self>, upto: Version) -> Result<()> {
        let promoted = self.lock().mark_persistent(upto)?;
        if promoted.is_empty() {
            return Ok(());
        }
        htype::on_persistent(self, &promoted);
        Ok(())
    }

    /// Rewinds `high_ver` to `ver`; updates strictly above are parked in
    /// `Limbo`. No user callbacks fire.
    pub fn reset(self: &Arc<Self>, ver: Version) {
        let dropped = self.lock().rewind(ver);
        debug!(
            history = self.kind.name(),
            ver, dropped, "history reset"
        );
    }

    /// Rolls the history back to `ver`: updates strictly above go to
    /// `Limbo` in reverse version order and the operations owning them are
    /// told, newest first.
    pub fn undo(self: &Arc<Self>, upto: Version) {
        let ops = self.lock().undo(upto);
        let failed_peer = self.rem().map(|r| r.target());
        for op in &ops {
            if let Some(op) = op.upgrade() {
                op.on_undone(failed_peer);
            }
        }
    }

    /// Seals the history: no further updates. Slots and the local FOL can
    /// never be sealed; asking is an invariant violation.
    pub fn seal(self: &Arc<Self>) -> Result<()> {
        htype::on_fixed(self)
    }

    #[cfg(test)]
    pub(crate) fn check_sorted(&self) -> bool {
        self.lock().check_sorted()
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("History")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("high_ver", &inner.high_ver)
            .field("persistent", &inner.persistent)
            .field("ups", &inner.ups.len())
            .finish()
    }
}

impl HistoryInner {
    fn assigned_len(&self) -> usize {
        self.ups.iter().take_while(|up| up.assigned()).count()
    }

    pub(crate) fn assigned(&self) -> &[Up] {
        &self.ups[..self.assigned_len()]
    }

    pub(crate) fn ups(&self) -> &[Up] {
        &self.ups
    }

    pub fn find(&self, ver: Version) -> Option<&Up> {
        let assigned = self.assigned();
        let pos = assigned.binary_search_by_key(&ver, |up| up.ver).ok()?;
        Some(&assigned[pos])
    }

    fn find_mut(&mut self, ver: Version) -> Option<&mut Up> {
        let len = self.assigned_len();
        let pos = self.ups[..len]
            .binary_search_by_key(&ver, |up| up.ver)
            .ok()?;
        Some(&mut self.ups[pos])
    }

    pub fn earliest(&self) -> Option<&Up> {
        self.assigned().first()
    }

    pub fn later(&self, ver: Version) -> Option<&Up> {
        let assigned = self.assigned();
        let pos = assigned.partition_point(|up| up.ver <= ver);
        assigned.get(pos)
    }

    /// Links a fresh update at the unassigned tail.
    pub(crate) fn add_future(&mut self, tag: u64, rule: UpdateRule, op: Weak<Op>) {
        self.ups.push(Up {
            ver: 0,
            orig_ver: 0,
            rule,
            state: UpState::Future,
            unknown: false,
            tag,
            op,
        });
    }

    /// Optimistic-concurrency token: the version a prepare is based upon.
    pub(crate) fn token(&self) -> Version {
        self.high_ver
    }

    fn take_unassigned(&mut self, tag: u64) -> Option<Up> {
        let len = self.assigned_len();
        let pos = self.ups[len..].iter().position(|up| up.tag == tag)?;
        Some(self.ups.remove(len + pos))
    }

    fn place_assigned(&mut self, up: Up) {
        debug_assert!(up.assigned());
        let len = self.assigned_len();
        let pos = self.ups[..len].partition_point(|cur| cur.ver < up.ver);
        self.ups.insert(pos, up);
    }

    /// Mints the next version for the tagged update of an owned history.
    /// Any rolled-back leftover occupying the minted version is dropped.
    pub(crate) fn mint(&mut self, tag: u64) -> Result<(Version, Version)> {
        let orig = self.high_ver;
        let ver = orig + 1;
        if let Some(stale) = self.find(ver) {
            if stale.state != UpState::Limbo {
                return Err(DtmError::Internal("minted version already live"));
            }
            let len = self.assigned_len();
            let pos = self.ups[..len]
                .binary_search_by_key(&ver, |up| up.ver)
                .unwrap();
            self.ups.remove(pos);
            debug!(ver, "dropping rolled-back update for reminted version");
        }
        let mut up = self
            .take_unassigned(tag)
            .ok_or(DtmError::Internal("no pending update for tag"))?;
        up.ver = ver;
        up.orig_ver = orig;
        up.state = UpState::InProgress;
        self.place_assigned(up);
        self.high_ver = ver;
        Ok((ver, orig))
    }

    /// Accepts an externally supplied version for the tagged update of a
    /// non-owned history. The version must be above `high_ver` (gaps are
    /// bridged with unknown placeholders) or name an existing placeholder.
    pub(crate) fn supply(
        &mut self,
        tag: u64,
        ver: Version,
        orig_ver: Version,
        rule: UpdateRule,
    ) -> Result<()> {
        if ver == 0 {
            // version left for the owner to decide; the update stays in
            // the unassigned tail but is considered in flight
            return self
                .raise_state_by_tag(tag, UpState::InProgress)
                .then_some(())
                .ok_or(DtmError::Internal("no pending update for tag"));
        }
        if ver > self.high_ver {
            for gap in self.high_ver + 1..ver {
                self.place_assigned(Up::placeholder(gap));
            }
            let mut up = self
                .take_unassigned(tag)
                .ok_or(DtmError::Internal("no pending update for tag"))?;
            up.ver = ver;
            up.orig_ver = orig_ver;
            up.rule = rule;
            up.state = UpState::Future;
            self.place_assigned(up);
            self.high_ver = ver;
            self.promote_ready();
            return Ok(());
        }
        match self.find(ver) {
            Some(existing) if existing.unknown || existing.state == UpState::Limbo => {
                // a placeholder the cursor already passed keeps its state
                let inherited = if existing.unknown && existing.state > UpState::Future {
                    existing.state
                } else {
                    UpState::Future
                };
                let mut up = self
                    .take_unassigned(tag)
                    .ok_or(DtmError::Internal("no pending update for tag"))?;
                up.ver = ver;
                up.orig_ver = orig_ver;
                up.rule = rule;
                up.state = inherited;
                let len = self.assigned_len();
                let pos = self.ups[..len]
                    .binary_search_by_key(&ver, |cur| cur.ver)
                    .unwrap();
                self.ups[pos] = up;
                self.promote_ready();
                Ok(())
            }
            Some(existing) if existing.tag == tag => Ok(()),
            _ => Err(DtmError::Ver {
                ver,
                high: self.high_ver,
            }),
        }
    }

    /// Applies wire-carried update data without a local update to attach
    /// it to: fills a placeholder, revives a rolled-back entry, or inserts
    /// the version (bridging gaps with placeholders).
    pub(crate) fn fill(
        &mut self,
        ver: Version,
        orig_ver: Version,
        rule: UpdateRule,
    ) -> FillOutcome {
        if ver == 0 {
            return FillOutcome::Existing;
        }
        if let Some(up) = self.find_mut(ver) {
            if up.unknown {
                up.orig_ver = orig_ver;
                up.rule = rule;
                up.unknown = false;
                self.promote_ready();
                return FillOutcome::Filled;
            }
            if up.state == UpState::Limbo {
                up.orig_ver = orig_ver;
                up.rule = rule;
                up.state = UpState::Future;
                self.promote_ready();
                if self.high_ver < ver {
                    self.high_ver = ver;
                }
                return FillOutcome::Filled;
            }
            return FillOutcome::Existing;
        }
        let base = self.assigned().last().map_or(0, |up| up.ver);
        for gap in base + 1..ver {
            self.place_assigned(Up::placeholder(gap));
        }
        let mut up = Up::placeholder(ver);
        up.orig_ver = orig_ver;
        up.rule = rule;
        up.unknown = false;
        self.place_assigned(up);
        if self.high_ver < ver {
            self.high_ver = ver;
        }
        self.promote_ready();
        FillOutcome::Inserted
    }

    /// Assigns wire-carried data to the unassigned update of the given
    /// operation, once the owner's minted version becomes known.
    pub(crate) fn assign_for_op(
        &mut self,
        op: &Weak<Op>,
        ver: Version,
        orig_ver: Version,
        rule: UpdateRule,
    ) -> Option<u64> {
        let len = self.assigned_len();
        let pos = self.ups[len..]
            .iter()
            .position(|up| Weak::ptr_eq(&up.op, op))?;
        let mut up = self.ups.remove(len + pos);
        let tag = up.tag;
        up.ver = ver;
        up.orig_ver = orig_ver;
        up.rule = rule;
        if up.state < UpState::InProgress {
            up.state = UpState::InProgress;
        }
        if let Some(stale) = self.find(ver) {
            // a placeholder for this version may have been bridged in
            if stale.unknown || stale.state == UpState::Limbo {
                let at = self.ups[..self.assigned_len()]
                    .binary_search_by_key(&ver, |cur| cur.ver)
                    .unwrap();
                self.ups.remove(at);
            }
        }
        self.place_assigned(up);
        if self.high_ver < ver {
            self.high_ver = ver;
        }
        self.promote_ready();
        Some(tag)
    }

    /// Raises the state of the tagged update, never lowering it. Returns
    /// false if the tag is not linked here.
    pub(crate) fn raise_state_by_tag(&mut self, tag: u64, floor: UpState) -> bool {
        match self.ups.iter_mut().find(|up| up.tag == tag) {
            Some(up) => {
                if up.state < floor {
                    up.state = floor;
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn state_by_tag(&self, tag: u64) -> Option<UpState> {
        self.ups.iter().find(|up| up.tag == tag).map(|up| up.state)
    }

    /// Promotes queued updates whose predecessors are all known and
    /// executable, in version order. This is what makes slot-ordered
    /// operations execute in slot order regardless of arrival order.
    fn promote_ready(&mut self) {
        let mut prev_ready = true;
        let len = self.assigned_len();
        for up in &mut self.ups[..len] {
            if up.state == UpState::Future && prev_ready && !up.unknown {
                up.state = UpState::InProgress;
            }
            prev_ready = !up.unknown && up.state >= UpState::InProgress;
        }
    }

    fn mark_persistent(&mut self, upto: Version) -> Result<Vec<Promoted>> {
        if upto <= self.persistent {
            return Ok(Vec::new());
        }
        if upto > self.high_ver {
            return Err(DtmError::Proto("persistent cursor beyond high version"));
        }
        let mut promoted = Vec::new();
        let len = self.assigned_len();
        for up in &mut self.ups[..len] {
            if up.ver > upto {
                break;
            }
            if up.state == UpState::Limbo {
                warn!(ver = up.ver, "skipping rolled-back update on cursor advance");
                continue;
            }
            if up.state < UpState::Persistent {
                up.state = UpState::Persistent;
                promoted.push(Promoted {
                    ver: up.ver,
                    op: up.op.clone(),
                });
            }
        }
        self.persistent = upto;
        Ok(promoted)
    }

    fn rewind(&mut self, ver: Version) -> usize {
        let mut dropped = 0;
        let len = self.assigned_len();
        for up in self.ups[..len].iter_mut().rev() {
            if up.ver <= ver {
                break;
            }
            if up.state != UpState::Limbo {
                up.state = UpState::Limbo;
                dropped += 1;
            }
        }
        self.high_ver = self.high_ver.min(ver);
        self.persistent = self.persistent.min(ver);
        dropped
    }

    fn undo(&mut self, upto: Version) -> Vec<Weak<Op>> {
        let mut ops: Vec<Weak<Op>> = Vec::new();
        let len = self.assigned_len();
        for up in self.ups[..len].iter_mut().rev() {
            if up.ver <= upto {
                break;
            }
            if up.state != UpState::Limbo {
                up.state = UpState::Limbo;
                if !ops.iter().any(|known| Weak::ptr_eq(known, &up.op)) {
                    ops.push(up.op.clone());
                }
            }
        }
        self.high_ver = self.high_ver.min(upto);
        self.persistent = self.persistent.min(upto);
        ops
    }

    /// Unlinks the tagged update; used when its operation is destroyed.
    pub(crate) fn detach(&mut self, tag: u64) {
        if let Some(pos) = self.ups.iter().position(|up| up.tag == tag) {
            self.ups.remove(pos);
        }
    }

    #[cfg(test)]
    pub(crate) fn check_sorted(&self) -> bool {
        let assigned = self.assigned();
        assigned.windows(2).all(|w| w[0].ver < w[1].ver)
            && self.ups[self.assigned_len()..].iter().all(|up| !up.assigned())
            && self.persistent <= self.high_ver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::id_from_u128;

    fn owned() -> Arc<History> {
        History::new(
            HistoryKind::Fol,
            id_from_u128(1),
            HistoryFlags {
                owned: true,
                eager: true,
            },
        )
    }

    fn mirror() -> Arc<History> {
        History::new(HistoryKind::RemoteFol, id_from_u128(2), HistoryFlags::default())
    }

    #[test]
    fn test_mint_consecutive() {
        let h = owned();
        let mut inner = h.lock();
        for tag in 1..=5u64 {
            inner.add_future(tag, UpdateRule::Inc, Weak::new());
            let (ver, orig) = inner.mint(tag).unwrap();
            assert_eq!(ver, tag);
            assert_eq!(orig, tag - 1);
        }
        assert_eq!(inner.high_ver, 5);
        assert!(inner.check_sorted());
        drop(inner);

        assert_eq!(h.earliest().unwrap().ver, 1);
        assert_eq!(h.later(3).unwrap().ver, 4);
        assert!(h.find(6).is_none());
    }

    #[test]
    fn test_supply_strictly_above_or_placeholder() {
        let h = mirror();
        let mut inner = h.lock();
        inner.add_future(1, UpdateRule::Inc, Weak::new());
        inner.supply(1, 3, 2, UpdateRule::Inc).unwrap();

        // versions 1 and 2 became unknown placeholders
        assert!(inner.find(1).unwrap().unknown);
        assert!(inner.find(2).unwrap().unknown);
        assert_eq!(inner.high_ver, 3);
        // the gapped update is queued, not executable
        assert_eq!(inner.find(3).unwrap().state, UpState::Future);

        // a second update cannot reuse a live version
        inner.add_future(2, UpdateRule::Inc, Weak::new());
        assert_eq!(
            inner.supply(2, 3, 2, UpdateRule::Inc).unwrap_err(),
            DtmError::Ver { ver: 3, high: 3 }
        );
        // ... but may fill a placeholder
        inner.supply(2, 1, 0, UpdateRule::Inc).unwrap();
        assert!(!inner.find(1).unwrap().unknown);
        assert_eq!(inner.find(1).unwrap().state, UpState::InProgress);
        assert!(inner.check_sorted());
    }

    #[test]
    fn test_promote_follows_version_order() {
        let h = mirror();
        let mut inner = h.lock();
        // version 2 arrives first and must wait
        inner.add_future(22, UpdateRule::Inc, Weak::new());
        inner.supply(22, 2, 1, UpdateRule::Inc).unwrap();
        assert_eq!(inner.find(2).unwrap().state, UpState::Future);

        // version 1 arrives and unblocks it
        inner.add_future(11, UpdateRule::Inc, Weak::new());
        inner.supply(11, 1, 0, UpdateRule::Inc).unwrap();
        assert_eq!(inner.find(1).unwrap().state, UpState::InProgress);
        assert_eq!(inner.find(2).unwrap().state, UpState::InProgress);
    }

    #[test]
    fn test_persistent_cursor_idempotent() {
        let h = owned();
        {
            let mut inner = h.lock();
            for tag in 1..=5u64 {
                inner.add_future(tag, UpdateRule::Inc, Weak::new());
                inner.mint(tag).unwrap();
            }
            let promoted = inner.mark_persistent(4).unwrap();
            assert_eq!(promoted.len(), 4);
            assert_eq!(inner.persistent, 4);

            // duplicate delivery: no additional effect
            assert!(inner.mark_persistent(4).unwrap().is_empty());
            assert!(inner.mark_persistent(3).unwrap().is_empty());
            assert_eq!(inner.persistent, 4);

            let promoted = inner.mark_persistent(5).unwrap();
            assert_eq!(promoted.len(), 1);
            assert_eq!(promoted[0].ver, 5);
        }
        assert_eq!(h.persistent_cursor(), 5);
        assert!(h.find(2).unwrap().state == UpState::Persistent);
    }

    #[test]
    fn test_persistent_beyond_high_rejected() {
        let h = owned();
        let mut inner = h.lock();
        inner.add_future(1, UpdateRule::Inc, Weak::new());
        inner.mint(1).unwrap();
        assert!(matches!(
            inner.mark_persistent(9),
            Err(DtmError::Proto(_))
        ));
    }

    #[test]
    fn test_undo_and_remint() {
        let h = owned();
        let mut inner = h.lock();
        for tag in 1..=4u64 {
            inner.add_future(tag, UpdateRule::Inc, Weak::new());
            inner.mint(tag).unwrap();
        }
        inner.mark_persistent(2).unwrap();

        let ops = inner.undo(2);
        assert!(ops.iter().all(|op| op.upgrade().is_none()));
        assert_eq!(inner.high_ver, 2);
        assert_eq!(inner.persistent, 2);
        assert_eq!(inner.find(3).unwrap().state, UpState::Limbo);
        assert_eq!(inner.find(4).unwrap().state, UpState::Limbo);
        assert_eq!(inner.find(2).unwrap().state, UpState::Persistent);

        // minting after the rollback reuses version 3 and drops the corpse
        inner.add_future(9, UpdateRule::Inc, Weak::new());
        let (ver, orig) = inner.mint(9).unwrap();
        assert_eq!((ver, orig), (3, 2));
        assert_eq!(inner.find(3).unwrap().tag, 9);
        assert!(inner.check_sorted());
    }

    #[test]
    fn test_undo_to_zero_clears() {
        let h = owned();
        let mut inner = h.lock();
        inner.add_future(1, UpdateRule::Inc, Weak::new());
        inner.mint(1).unwrap();
        inner.undo(0);
        assert_eq!(inner.high_ver, 0);
        assert_eq!(inner.find(1).unwrap().state, UpState::Limbo);
    }

    #[test]
    fn test_fill_revives_and_restores() {
        let h = mirror();
        let mut inner = h.lock();
        inner.add_future(1, UpdateRule::New, Weak::new());
        inner.supply(1, 1, 0, UpdateRule::New).unwrap();
        inner.add_future(2, UpdateRule::Inc, Weak::new());
        inner.supply(2, 2, 1, UpdateRule::Inc).unwrap();
        let before: Vec<_> = inner.assigned().iter().map(|u| (u.ver, u.rule)).collect();

        inner.undo(0);
        assert_eq!(inner.high_ver, 0);

        // replay in order restores the pre-undo picture
        assert_eq!(inner.fill(1, 0, UpdateRule::New), FillOutcome::Filled);
        assert_eq!(inner.fill(2, 1, UpdateRule::Inc), FillOutcome::Filled);
        let after: Vec<_> = inner.assigned().iter().map(|u| (u.ver, u.rule)).collect();
        assert_eq!(before, after);
        assert_eq!(inner.high_ver, 2);
        assert_eq!(inner.find(1).unwrap().state, UpState::InProgress);
    }

    #[test]
    fn test_fill_gap_stays_unknown() {
        let h = mirror();
        let mut inner = h.lock();
        for tag in 1..=5u64 {
            inner.add_future(tag, UpdateRule::Inc, Weak::new());
            inner.supply(tag, tag, tag - 1, UpdateRule::Inc).unwrap();
        }
        // a replayed version far above the high water mark
        assert_eq!(inner.fill(7, 6, UpdateRule::Inc), FillOutcome::Inserted);
        assert!(inner.find(6).unwrap().unknown);
        assert!(!inner.find(7).unwrap().unknown);
        assert_eq!(inner.high_ver, 7);
        // version 7 stays queued behind the unknown gap
        assert_eq!(inner.find(7).unwrap().state, UpState::Future);

        // the second replay fills the gap and unblocks
        assert_eq!(inner.fill(6, 5, UpdateRule::Inc), FillOutcome::Filled);
        assert!(!inner.find(6).unwrap().unknown);
        assert_eq!(inner.find(7).unwrap().state, UpState::InProgress);
        assert!(inner.check_sorted());
    }
}
