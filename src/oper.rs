//! The operation engine: a bag of updates across several histories that
//! progresses through a single derived state.
//!
//! An operation is assembled (`add`), prepared (versions assigned under
//! the history locks, first conflicting preparation wins), and closed
//! (sealed and handed to the remote layer). From then on its state is a
//! pure function of the states of its updates.
//!
//! Lock discipline: the operation lock may be held while taking history
//! locks (always in ascending `(type id, id)` order), never the other way
//! round. Paths starting from a history collect the affected operations
//! under the history lock and call back into them after dropping it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use itertools::Itertools;
use parking_lot::Mutex;

use crate::dtm::Dtm;
use crate::dtx0::Dtx0;
use crate::errors::{DtmError, Result};
use crate::history::History;
use crate::htype::{self, HistoryKind};
use crate::remote::wire::{Notice, OpDescr, UpdateData, UpdateDescr};
use crate::remote::{Comm, CommState, Remote, SendOutcome};
use crate::types::{InstanceId, UpState, UpdateRule, Version};

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

fn next_tag() -> u64 {
    NEXT_TAG.fetch_add(1, Ordering::Relaxed)
}

/// One update as handed to [`Op::add`].
pub struct UpdateSpec {
    pub history: Arc<History>,
    pub rule: UpdateRule,
    /// Externally decided version for a non-owned history; `None` leaves
    /// the version for the owner to mint.
    pub ver: Option<Version>,
    /// Opaque request body shipped to the owner of the history.
    pub payload: Vec<u8>,
}

/// User-visible update: the ordering record of one history joined with
/// the request payload and the transmission record.
pub struct Update {
    tag: u64,
    history: Arc<History>,
    rule: UpdateRule,
    supplied: Option<Version>,
    /// Version the preparation is based upon, captured when the update
    /// was added to its owned history.
    token: Version,
    ver: Version,
    orig_ver: Version,
    payload: Vec<u8>,
    comm: Comm,
}

impl Update {
    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    pub fn ver(&self) -> Version {
        self.ver
    }

    pub fn comm(&self) -> Comm {
        self.comm
    }

    fn wire_data(&self) -> UpdateData {
        UpdateData {
            ver: self.ver,
            orig_ver: self.orig_ver,
            rule: self.rule,
        }
    }
}

pub struct Op {
    dtm: Weak<Dtm>,
    inner: Mutex<OpInner>,
}

struct OpInner {
    updates: Vec<Update>,
    dtx: Weak<Dtx0>,
    prepared: bool,
    closed: bool,
}

impl Op {
    pub fn new(dtm: &Arc<Dtm>) -> Arc<Op> {
        Arc::new(Op {
            dtm: Arc::downgrade(dtm),
            inner: Mutex::new(OpInner {
                updates: Vec::new(),
                dtx: Weak::new(),
                prepared: false,
                closed: false,
            }),
        })
    }

    pub(crate) fn dtm(&self) -> Option<Arc<Dtm>> {
        self.dtm.upgrade()
    }

    /// Attaches a new update: links an ordering record into its history
    /// and records the optimistic base version for owned histories.
    ///
    /// At most one slot update may join an operation.
    pub fn add(self: &Arc<Self>, spec: UpdateSpec) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.prepared {
            return Err(DtmError::Internal("updates cannot join a prepared operation"));
        }
        if spec.history.kind() == HistoryKind::Slot
            && inner
                .updates
                .iter()
                .any(|u| u.history.kind() == HistoryKind::Slot)
        {
            return Err(DtmError::Internal("operation already carries a slot update"));
        }
        let tag = next_tag();
        let token = {
            let mut h = spec.history.lock();
            if h.sealed {
                return Err(DtmError::Proto("history is sealed"));
            }
            let token = h.token();
            h.add_future(tag, spec.rule, Arc::downgrade(self));
            token
        };
        htype::on_update(&spec.history);
        inner.updates.push(Update {
            tag,
            history: spec.history,
            rule: spec.rule,
            supplied: spec.ver,
            token,
            ver: 0,
            orig_ver: 0,
            payload: spec.payload,
            comm: Comm::default(),
        });
        Ok(())
    }

    /// Assigns versions to every update, atomically across all involved
    /// histories. Either every update is prepared or none is: the first
    /// version conflict aborts the whole preparation.
    pub fn prepare(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.prepared {
            return Err(DtmError::Internal("operation prepared twice"));
        }
        if inner.updates.is_empty() {
            return Err(DtmError::Internal("preparing an empty operation"));
        }

        // one guard per distinct history, taken in ascending rank order
        let hists: Vec<Arc<History>> = inner
            .updates
            .iter()
            .map(|u| u.history.clone())
            .sorted_by_key(|h| h.lock_rank())
            .collect();
        let mut hists = hists;
        hists.dedup_by(|a, b| a.lock_rank() == b.lock_rank());
        let mut guards: Vec<_> = hists.iter().map(|h| h.lock()).collect();
        let guard_of = |u: &Update| {
            hists
                .binary_search_by_key(&u.history.lock_rank(), |h| h.lock_rank())
                .unwrap()
        };

        // validate everything before touching anything
        let base: Vec<Version> = guards.iter().map(|g| g.token()).collect();
        let mut virt = base.clone();
        for u in &inner.updates {
            let g = guard_of(u);
            if guards[g].flags.owned {
                if u.token != base[g] {
                    return Err(DtmError::Ver {
                        ver: u.token,
                        high: base[g],
                    });
                }
                virt[g] += 1;
            } else if let Some(ver) = u.supplied {
                let reusable = matches!(
                    guards[g].find(ver),
                    Some(up) if up.unknown || up.state == UpState::Limbo
                );
                if ver <= virt[g] && !reusable {
                    return Err(DtmError::Ver {
                        ver,
                        high: virt[g],
                    });
                }
                virt[g] = virt[g].max(ver);
            }
        }

        for i in 0..inner.updates.len() {
            let g = guard_of(&inner.updates[i]);
            let u = &mut inner.updates[i];
            if guards[g].flags.owned {
                let (ver, orig) = guards[g].mint(u.tag)?;
                u.ver = ver;
                u.orig_ver = orig;
            } else if let Some(ver) = u.supplied {
                let orig = match u.rule {
                    UpdateRule::Inc => ver.saturating_sub(1),
                    UpdateRule::New => 0,
                };
                guards[g].supply(u.tag, ver, orig, u.rule)?;
                u.ver = ver;
                u.orig_ver = orig;
            } else {
                guards[g].supply(u.tag, 0, 0, u.rule)?;
            }
        }
        inner.prepared = true;
        drop(guards);

        let dtx = inner.dtx.clone();
        drop(inner);
        if let Some(dtx) = dtx.upgrade() {
            dtx.note_inprogress();
        }
        Ok(())
    }

    /// Seals the operation and hands its remote-bound updates to the
    /// transport. Local updates are executed on the spot. Transport
    /// failures are transient: they are logged and recovered by replay on
    /// reconnect, the close itself does not fail.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let (descr, locals, sends) = {
            let mut inner = self.inner.lock();
            if !inner.prepared {
                return Err(DtmError::Internal("closing an unprepared operation"));
            }
            if inner.closed {
                return Err(DtmError::Internal("operation closed twice"));
            }
            inner.closed = true;
            let descr = descr_of(&inner.updates);
            let mut locals = Vec::new();
            let mut sends: Vec<(Arc<Remote>, Vec<u8>, Vec<u64>)> = Vec::new();
            for u in &inner.updates {
                match u.history.rem() {
                    None => locals.push((u.history.clone(), u.tag)),
                    Some(rem) => match sends
                        .iter_mut()
                        .find(|(known, ..)| known.target() == rem.target())
                    {
                        Some((_, payload, tags)) => {
                            if payload.is_empty() {
                                *payload = u.payload.clone();
                            }
                            tags.push(u.tag);
                        }
                        None => sends.push((rem, u.payload.clone(), vec![u.tag])),
                    },
                }
            }
            (descr, locals, sends)
        };

        for (history, tag) in &locals {
            history.lock().raise_state_by_tag(*tag, UpState::Volatile);
        }

        let mut delivered = Vec::new();
        let mut posted_tags = Vec::new();
        for (rem, payload, tags) in sends {
            match rem.send(&descr, payload) {
                Ok(SendOutcome::Delivered) => {
                    delivered.push(rem.target());
                    posted_tags.extend(tags);
                }
                Ok(SendOutcome::Posted) => posted_tags.extend(tags),
                Err(err) => {
                    warn!(peer = %rem.target(), %err, "first transmission failed");
                }
            }
        }
        {
            let mut inner = self.inner.lock();
            for u in inner.updates.iter_mut() {
                if posted_tags.contains(&u.tag) {
                    u.comm.state = CommState::Posted;
                }
            }
        }
        for peer in delivered {
            self.delivered(peer);
        }
        Ok(())
    }

    /// Acknowledgement that the peer received this operation's updates:
    /// they leave flight and become volatile on the owner.
    pub fn delivered(self: &Arc<Self>, peer: InstanceId) {
        let acked: Vec<(Arc<History>, u64)> = {
            let inner = self.inner.lock();
            inner
                .updates
                .iter()
                .filter(|u| u.history.rem().is_some_and(|r| r.target() == peer))
                .map(|u| (u.history.clone(), u.tag))
                .collect()
        };
        for (history, tag) in acked {
            history.lock().raise_state_by_tag(tag, UpState::Volatile);
        }
        self.notify_progress();
    }

    /// Retransmits the updates bound to `peer`. The in-flight item is
    /// cancelled and re-posted with a short deadline so the transport can
    /// coalesce it into a better batch; the receiver observes at most one
    /// of the two postings.
    pub fn resend(self: &Arc<Self>, peer: InstanceId) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.closed {
            return Err(DtmError::Internal("resending an open operation"));
        }
        let descr = descr_of(&inner.updates);
        let mut target = None;
        for u in inner.updates.iter_mut() {
            let Some(rem) = u.history.rem() else { continue };
            if rem.target() != peer {
                continue;
            }
            let state = u
                .history
                .lock()
                .state_by_tag(u.tag)
                .unwrap_or(UpState::Pruned);
            if !matches!(
                state,
                UpState::InProgress | UpState::Volatile | UpState::Persistent
            ) {
                return Err(DtmError::Internal("resend outside the in-flight window"));
            }
            u.comm.state = match u.comm.state {
                CommState::Posted | CommState::Reposted => CommState::Cancelled,
                other => other,
            };
            target = Some((rem, u.payload.clone()));
        }
        let Some((rem, payload)) = target else {
            return Err(DtmError::Proto("no updates bound to that peer"));
        };
        rem.resend(&descr, payload)?;
        for u in inner.updates.iter_mut() {
            if u.comm.state == CommState::Cancelled {
                u.comm.state = CommState::Reposted;
                u.comm.deadline = Some(crate::remote::RESEND_DEADLINE);
            }
        }
        Ok(())
    }

    /// The derived state of the operation: a deterministic function of the
    /// states of its updates.
    pub fn state(&self) -> UpState {
        let snapshot: Vec<(UpState, bool)> = {
            let inner = self.inner.lock();
            inner
                .updates
                .iter()
                .map(|u| {
                    let h = u.history.lock();
                    (
                        h.state_by_tag(u.tag).unwrap_or(UpState::Pruned),
                        h.flags.owned,
                    )
                })
                .collect()
        };
        derive_state(&snapshot)
    }

    pub fn update_count(&self) -> usize {
        self.inner.lock().updates.len()
    }

    /// Distinct peers the operation's mirror updates point at.
    pub fn participants(&self) -> Vec<InstanceId> {
        let inner = self.inner.lock();
        inner
            .updates
            .iter()
            .filter_map(|u| u.history.rem())
            .map(|rem| rem.target())
            .unique()
            .collect()
    }

    pub(crate) fn set_dtx(&self, dtx: &Arc<Dtx0>) {
        self.inner.lock().dtx = Arc::downgrade(dtx);
    }

    pub(crate) fn dtx(&self) -> Option<Arc<Dtx0>> {
        self.inner.lock().dtx.upgrade()
    }

    pub(crate) fn descr(&self) -> OpDescr {
        descr_of(&self.inner.lock().updates)
    }

    /// The operation's version on the given history, if assigned.
    pub fn ver_on(&self, history: &Arc<History>) -> Option<Version> {
        let inner = self.inner.lock();
        inner
            .updates
            .iter()
            .find(|u| Arc::ptr_eq(&u.history, history) && u.ver != 0)
            .map(|u| u.ver)
    }

    /// Records the version the owner minted for one of our mirror-bound
    /// updates, learnt from a durability notice.
    pub(crate) fn note_assigned(&self, history: &Arc<History>, tag: u64, ver: Version) {
        let mut inner = self.inner.lock();
        if let Some(u) = inner
            .updates
            .iter_mut()
            .find(|u| u.tag == tag && Arc::ptr_eq(&u.history, history))
        {
            u.ver = ver;
            u.orig_ver = match u.rule {
                UpdateRule::Inc => ver.saturating_sub(1),
                UpdateRule::New => 0,
            };
        }
    }

    /// Re-derives progress and forwards it to the owning transaction.
    pub(crate) fn notify_progress(self: &Arc<Self>) {
        let state = self.state();
        if state >= UpState::Stable {
            let hists: Vec<Arc<History>> = {
                let inner = self.inner.lock();
                inner.updates.iter().map(|u| u.history.clone()).collect()
            };
            for h in &hists {
                htype::on_stable(h);
            }
        }
        let Some(dtx) = self.dtx() else { return };
        if state >= UpState::Volatile {
            dtx.note_executed();
        }
    }

    /// One of this operation's histories was rolled back underneath it.
    pub(crate) fn on_undone(self: &Arc<Self>, failed_peer: Option<InstanceId>) {
        if let Some(dtx) = self.dtx() {
            dtx.note_failed(failed_peer);
        }
    }

    pub(crate) fn mark_local_executed(self: &Arc<Self>) {
        let locals: Vec<(Arc<History>, u64)> = {
            let inner = self.inner.lock();
            inner
                .updates
                .iter()
                .filter(|u| u.history.rem().is_none())
                .map(|u| (u.history.clone(), u.tag))
                .collect()
        };
        for (history, tag) in locals {
            history.lock().raise_state_by_tag(tag, UpState::Volatile);
        }
    }
}

impl Drop for Op {
    fn drop(&mut self) {
        let updates = std::mem::take(&mut self.inner.get_mut().updates);
        for u in &updates {
            u.history.lock().detach(u.tag);
        }
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Op")
            .field("updates", &self.inner.lock().updates.len())
            .finish()
    }
}

fn descr_of(updates: &[Update]) -> OpDescr {
    OpDescr {
        updates: updates
            .iter()
            .map(|u| UpdateDescr {
                id: u.history.wire_addr(),
                data: u.wire_data(),
            })
            .collect(),
    }
}

fn derive_state(ups: &[(UpState, bool)]) -> UpState {
    if ups.is_empty() {
        return UpState::Limbo;
    }
    let min_all = ups.iter().map(|(s, _)| *s).min().unwrap();
    if min_all == UpState::Limbo {
        return UpState::Limbo;
    }
    if !ups.iter().any(|(s, _)| *s >= UpState::InProgress) {
        return UpState::Future;
    }
    if min_all < UpState::Volatile {
        return UpState::InProgress;
    }
    if min_all >= UpState::Persistent {
        return UpState::Stable;
    }
    let has_owned = ups.iter().any(|(_, owned)| *owned);
    let owned_durable = ups
        .iter()
        .filter(|(_, owned)| *owned)
        .all(|(s, _)| *s >= UpState::Persistent);
    if has_owned && owned_durable {
        return UpState::Persistent;
    }
    UpState::Volatile
}

/// Durability fan-out of an eager owned history: every peer participating
/// in the operation learns that this version is durable, together with the
/// full operation descriptor so it can advance its replica.
pub(crate) fn fan_out_persistent(op: &Arc<Op>, h: &Arc<History>, ver: Version) {
    let (descr, remotes) = {
        let inner = op.inner.lock();
        let descr = descr_of(&inner.updates);
        let remotes: Vec<Arc<Remote>> = inner
            .updates
            .iter()
            .filter_map(|u| u.history.rem())
            .fold(Vec::new(), |mut acc, rem| {
                if !acc.iter().any(|known: &Arc<Remote>| known.target() == rem.target()) {
                    acc.push(rem);
                }
                acc
            });
        (descr, remotes)
    };
    for rem in remotes {
        if let Err(err) = rem.notify_persistent(h, ver, Some(descr.clone())) {
            warn!(peer = %rem.target(), %err, "durability fan-out failed");
        }
    }
}

/// A mirror update became durable on its owner. The slot update of the
/// same operation inherits the durability (slots have none of their own),
/// and the owning transaction counts the participant.
pub(crate) fn on_mirror_persistent(op: &Arc<Op>, h: &Arc<History>) {
    let peer = h.rem().map(|r| r.target());
    let slot: Option<(Arc<History>, u64)> = {
        let inner = op.inner.lock();
        inner
            .updates
            .iter()
            .find(|u| {
                matches!(
                    u.history.kind(),
                    HistoryKind::Slot | HistoryKind::RemoteSlot
                )
            })
            .map(|u| (u.history.clone(), u.tag))
    };
    if let Some((slot, tag)) = slot {
        slot.lock().raise_state_by_tag(tag, UpState::Persistent);
    }
    if let (Some(dtx), Some(peer)) = (op.dtx(), peer) {
        dtx.note_persistent(peer);
    }
}

/// Builds the local counterpart of a received operation request: one
/// update per descriptor entry that names a history known here. The local
/// FOL update takes the request payload; mirror entries track the sender's
/// histories. Versions the sender did not know are minted here.
pub(crate) fn apply_request(
    dtm: &Arc<Dtm>,
    descr: &OpDescr,
    payload: &[u8],
) -> Result<Arc<Op>> {
    let op = Op::new(dtm);
    let mut matched = false;
    for ud in &descr.updates {
        let history = match htype::find_history(dtm, &ud.id) {
            Ok(h) => h,
            Err(_) => {
                debug!(
                    htype = ud.id.htype,
                    id = %ud.id.id,
                    "request names a history unknown here"
                );
                continue;
            }
        };
        let body = if history.kind() == HistoryKind::Fol {
            payload.to_vec()
        } else {
            Vec::new()
        };
        op.add(UpdateSpec {
            history,
            rule: ud.data.rule,
            ver: (!ud.data.is_unknown()).then_some(ud.data.ver),
            payload: body,
        })?;
        matched = true;
    }
    if !matched {
        return Err(DtmError::Proto("request matches no local history"));
    }
    op.prepare()?;
    op.mark_local_executed();
    Ok(op)
}

/// Applies one replayed operation during recovery. The descriptor restores
/// every history entry it names; gaps below a restored version surface as
/// unknown placeholders until a later replay fills them.
pub(crate) fn apply_redo(dtm: &Arc<Dtm>, h: &Arc<History>, notice: &Notice) -> Result<()> {
    let descr = notice
        .op
        .as_ref()
        .ok_or(DtmError::Proto("replay notice without descriptor"))?;
    for ud in &descr.updates {
        if ud.data.is_unknown() {
            continue;
        }
        let Ok(other) = htype::find_history(dtm, &ud.id) else {
            continue;
        };
        other
            .lock()
            .fill(ud.data.ver, ud.data.orig_ver, ud.data.rule);
    }
    if notice.is_last {
        debug!(history = h.kind().name(), id = %h.id(), "replay batch complete");
    }
    Ok(())
}

/// Rolls back every in-flight operation that references the dead peer,
/// undoing their versions on every involved history and telling the other
/// participants. Returns how many operations were rolled back.
pub(crate) fn undo_for_peer(dtm: &Arc<Dtm>, rem: &Arc<Remote>) -> usize {
    let affected: Vec<Arc<Op>> = {
        let rfol = rem.rfol();
        let inner = rfol.lock();
        let mut ops: Vec<Arc<Op>> = Vec::new();
        for up in inner.ups() {
            if !matches!(
                up.state,
                UpState::InProgress | UpState::Volatile | UpState::Persistent
            ) {
                continue;
            }
            if let Some(op) = up.op.upgrade() {
                if !ops.iter().any(|known| Arc::ptr_eq(known, &op)) {
                    ops.push(op);
                }
            }
        }
        ops
    };

    for op in &affected {
        if let Some(dtx) = op.dtx() {
            dtx.note_failed(Some(rem.target()));
        }
        let rollbacks: Vec<(Arc<History>, Version)> = {
            let inner = op.inner.lock();
            inner
                .updates
                .iter()
                .filter(|u| u.ver != 0)
                .map(|u| (u.history.clone(), u.ver.saturating_sub(1)))
                .collect()
        };
        for (history, upto) in rollbacks {
            history.undo(upto);
            if history.is_owned() {
                // every peer rewinds its mirror, the dead one included:
                // if it ever comes back it must not replay the corpse
                for mirror in dtm.mirrors(crate::htype::HTYPE_FOL_REM) {
                    let Some(other) = mirror.rem() else { continue };
                    if let Err(err) = other.undo(&history, upto) {
                        warn!(peer = %other.target(), %err, "undo notice failed");
                    }
                }
            }
        }
    }
    affected.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::id_from_u128;

    fn dtm(raw: u128) -> Arc<Dtm> {
        Dtm::new(id_from_u128(raw))
    }

    #[test]
    fn test_prepare_mints_on_owned() {
        let a = dtm(0x11);
        let op = Op::new(&a);
        op.add(UpdateSpec {
            history: a.fol().clone(),
            rule: UpdateRule::Inc,
            ver: None,
            payload: b"create /x".to_vec(),
        })
        .unwrap();
        assert_eq!(op.state(), UpState::Future);

        op.prepare().unwrap();
        assert_eq!(a.fol().high_ver(), 1);
        assert_eq!(op.ver_on(a.fol()), Some(1));
        assert_eq!(op.state(), UpState::InProgress);
    }

    #[test]
    fn test_prepare_conflict_first_wins() {
        let a = dtm(0x12);
        let racer = |payload: &[u8]| {
            let op = Op::new(&a);
            op.add(UpdateSpec {
                history: a.fol().clone(),
                rule: UpdateRule::Inc,
                ver: None,
                payload: payload.to_vec(),
            })
            .unwrap();
            op
        };
        let first = racer(b"one");
        let second = racer(b"two");

        first.prepare().unwrap();
        // the loser's base version is stale now
        assert_eq!(
            second.prepare().unwrap_err(),
            DtmError::Ver { ver: 0, high: 1 }
        );
        assert_eq!(a.fol().high_ver(), 1);
    }

    #[test]
    fn test_prepare_is_atomic_across_histories() {
        let a = dtm(0x13);
        let stale = Op::new(&a);
        stale
            .add(UpdateSpec {
                history: a.fol().clone(),
                rule: UpdateRule::Inc,
                ver: None,
                payload: Vec::new(),
            })
            .unwrap();

        // another op advances the fol under the stale one
        let winner = Op::new(&a);
        winner
            .add(UpdateSpec {
                history: a.fol().clone(),
                rule: UpdateRule::Inc,
                ver: None,
                payload: Vec::new(),
            })
            .unwrap();
        winner.prepare().unwrap();

        // the stale op also carries a slot update; the failed prepare must
        // not advance the slot either
        stale
            .add(UpdateSpec {
                history: a.slot().clone(),
                rule: UpdateRule::Inc,
                ver: None,
                payload: Vec::new(),
            })
            .unwrap();
        assert!(stale.prepare().is_err());
        assert_eq!(a.slot().high_ver(), 0);
    }

    #[test]
    fn test_double_slot_rejected() {
        let a = dtm(0x14);
        let op = Op::new(&a);
        let slot_spec = || UpdateSpec {
            history: a.slot().clone(),
            rule: UpdateRule::Inc,
            ver: None,
            payload: Vec::new(),
        };
        op.add(slot_spec()).unwrap();
        assert!(matches!(
            op.add(slot_spec()),
            Err(DtmError::Internal(_))
        ));
    }

    #[test]
    fn test_derived_state_table() {
        use UpState::*;
        assert_eq!(derive_state(&[]), Limbo);
        assert_eq!(derive_state(&[(Future, true)]), Future);
        assert_eq!(derive_state(&[(InProgress, true), (Future, false)]), InProgress);
        assert_eq!(derive_state(&[(Volatile, true), (Volatile, false)]), Volatile);
        assert_eq!(
            derive_state(&[(Persistent, true), (Volatile, false)]),
            Persistent
        );
        assert_eq!(
            derive_state(&[(Persistent, true), (Persistent, false)]),
            Stable
        );
        assert_eq!(derive_state(&[(Limbo, true), (Persistent, false)]), Limbo);
    }

    #[test]
    fn test_detach_on_drop() {
        let a = dtm(0x15);
        {
            let op = Op::new(&a);
            op.add(UpdateSpec {
                history: a.fol().clone(),
                rule: UpdateRule::Inc,
                ver: None,
                payload: Vec::new(),
            })
            .unwrap();
            op.prepare().unwrap();
            assert!(a.fol().find(1).is_some());
        }
        assert!(a.fol().find(1).is_none());
    }
}
