//! History-type registry: the table of pluggable history kinds and the
//! kind-specific behaviour behind the generic history operations.
//!
//! Four standard kinds exist. The local FOL owns its versions and eagerly
//! fans durability out to every participant; a remote FOL mirrors a peer's
//! FOL; a slot is the owned logical clock ordering operations across
//! histories; a remote slot mirrors a peer's slot. Dispatch is by kind
//! tag.

use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};

use crate::dtm::Dtm;
use crate::errors::{DtmError, Result};
use crate::history::{History, Promoted, Up};
use crate::oper;
use crate::remote::wire::{HistoryAddr, OpDescr};
use crate::types::{UpState, Version};

pub const HTYPE_FOL: u8 = 5;
pub const HTYPE_FOL_REM: u8 = 6;
pub const HTYPE_SLOT: u8 = 50;
pub const HTYPE_SLOT_REM: u8 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HistoryKind {
    Fol,
    RemoteFol,
    Slot,
    RemoteSlot,
}

impl HistoryKind {
    pub fn type_id(self) -> u8 {
        match self {
            HistoryKind::Fol => HTYPE_FOL,
            HistoryKind::RemoteFol => HTYPE_FOL_REM,
            HistoryKind::Slot => HTYPE_SLOT,
            HistoryKind::RemoteSlot => HTYPE_SLOT_REM,
        }
    }

    /// The type id under which the *other* side of the connection resolves
    /// this history: a FOL travels as a remote FOL and vice versa.
    pub fn remote_type_id(self) -> u8 {
        match self {
            HistoryKind::Fol => HTYPE_FOL_REM,
            HistoryKind::RemoteFol => HTYPE_FOL,
            HistoryKind::Slot => HTYPE_SLOT_REM,
            HistoryKind::RemoteSlot => HTYPE_SLOT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HistoryKind::Fol => "fol",
            HistoryKind::RemoteFol => "remote fol",
            HistoryKind::Slot => "slot",
            HistoryKind::RemoteSlot => "remote slot",
        }
    }

    pub fn is_mirror(self) -> bool {
        matches!(self, HistoryKind::RemoteFol | HistoryKind::RemoteSlot)
    }
}

/// Registry record of one history kind.
#[derive(Clone, Copy, Debug)]
pub struct HistoryType {
    pub type_id: u8,
    pub remote_type_id: u8,
    pub name: &'static str,
    pub kind: HistoryKind,
}

static STANDARD_TYPES: Lazy<[HistoryType; 4]> = Lazy::new(|| {
    [
        HistoryKind::Fol,
        HistoryKind::RemoteFol,
        HistoryKind::Slot,
        HistoryKind::RemoteSlot,
    ]
    .map(|kind| HistoryType {
        type_id: kind.type_id(),
        remote_type_id: kind.remote_type_id(),
        name: kind.name(),
        kind,
    })
});

static GLOBAL: OnceCell<()> = OnceCell::new();

/// Process-wide initialisation. Must run before any instance is created;
/// creating an instance runs it implicitly, so explicit calls are only
/// needed by hosts that want the cost paid at startup.
pub fn global_init() {
    GLOBAL.get_or_init(|| {
        Lazy::force(&STANDARD_TYPES);
        debug!("transaction manager global state initialised");
    });
}

/// Counterpart of [`global_init`]. The registry tables are static, so this
/// only exists to keep the lifecycle symmetric for embedding hosts.
pub fn global_fini() {}

pub fn standard_types() -> &'static [HistoryType] {
    &*STANDARD_TYPES
}

/// Resolves an on-wire history address against an instance.
pub(crate) fn find_history(dtm: &Arc<Dtm>, addr: &HistoryAddr) -> Result<Arc<History>> {
    let ht = dtm
        .history_type(addr.htype)
        .ok_or(DtmError::Proto("history type not registered"))?;
    match ht.kind {
        HistoryKind::Fol => {
            if addr.id == dtm.id() {
                Ok(dtm.fol().clone())
            } else {
                Err(DtmError::Proto("fol id does not name this instance"))
            }
        }
        HistoryKind::Slot => {
            if addr.id == dtm.id() {
                Ok(dtm.slot().clone())
            } else {
                Err(DtmError::Proto("slot id does not name this instance"))
            }
        }
        HistoryKind::RemoteFol | HistoryKind::RemoteSlot => dtm
            .catalogue_lookup(ht.type_id, &addr.id)
            .ok_or(DtmError::Proto("unknown mirror history")),
    }
}

/// Kind hooks after a durability-cursor advance. Runs without the history
/// lock held.
pub(crate) fn on_persistent(h: &Arc<History>, promoted: &[Promoted]) {
    match h.kind() {
        HistoryKind::Fol => {
            for p in promoted {
                if let Some(op) = p.op.upgrade() {
                    oper::fan_out_persistent(&op, h, p.ver);
                }
            }
        }
        HistoryKind::RemoteFol => {
            for p in promoted {
                if let Some(op) = p.op.upgrade() {
                    oper::on_mirror_persistent(&op, h);
                }
            }
        }
        // slots inherit persistence from the FOLs of the same operation
        HistoryKind::Slot | HistoryKind::RemoteSlot => {}
    }
    for p in promoted {
        if let Some(op) = p.op.upgrade() {
            op.notify_progress();
        }
    }
}

/// Per-update kind hook, run when an update joins its history.
pub(crate) fn on_update(h: &Arc<History>) {
    trace!(history = h.kind().name(), id = %h.id(), "update linked");
}

/// Stability predicate of one update under its history's kind: nothing
/// more can happen to a stable update, recovery included. A mirror entry
/// is settled once the owner reported it durable; an owned entry only
/// once its whole operation is.
pub(crate) fn is_stable(h: &Arc<History>, up: &Up) -> bool {
    match h.kind() {
        HistoryKind::RemoteFol | HistoryKind::RemoteSlot => up.state >= UpState::Persistent,
        HistoryKind::Fol | HistoryKind::Slot => up.state >= UpState::Stable,
    }
}

/// Kind hook when an operation touching the history has stabilised.
pub(crate) fn on_stable(h: &Arc<History>) {
    trace!(history = h.kind().name(), id = %h.id(), "operation stabilised");
}

/// Seals a history. The local FOL and slots can never be sealed.
pub(crate) fn on_fixed(h: &Arc<History>) -> Result<()> {
    match h.kind() {
        HistoryKind::Fol => Err(DtmError::Internal("the local fol cannot be sealed")),
        HistoryKind::Slot | HistoryKind::RemoteSlot => {
            Err(DtmError::Internal("a slot cannot be sealed"))
        }
        HistoryKind::RemoteFol => {
            h.lock().sealed = true;
            Ok(())
        }
    }
}

/// Applies the operation descriptor attached to a durability notice.
///
/// The descriptor lets the receiver learn versions it has not seen: the
/// slot update of the operation anchors the descriptor to the local
/// operation, whose mirror updates then take the authoritative versions
/// minted by the owner.
pub(crate) fn onp(dtm: &Arc<Dtm>, h: &Arc<History>, descr: &OpDescr) -> Result<()> {
    if !h.lock().flags.eager {
        return Ok(());
    }

    let mut anchor: Option<(Arc<History>, Version)> = None;
    for ud in &descr.updates {
        if ud.data.is_unknown() {
            continue;
        }
        let Ok(other) = find_history(dtm, &ud.id) else {
            continue;
        };
        if other.kind() == HistoryKind::Slot {
            if anchor.is_some() {
                return Err(DtmError::Internal("operation descriptor names two slots"));
            }
            anchor = Some((other, ud.data.ver));
        }
    }

    let op = anchor
        .and_then(|(slot, ver)| slot.lock().find(ver).map(|up| up.op.clone()))
        .and_then(|weak| weak.upgrade());

    let mut assigned: Vec<(Arc<History>, u64, Version)> = Vec::new();
    for ud in &descr.updates {
        if ud.data.is_unknown() {
            continue;
        }
        let Ok(other) = find_history(dtm, &ud.id) else {
            debug!(htype = ud.id.htype, "descriptor names a history unknown here");
            continue;
        };
        if other.kind() != HistoryKind::RemoteFol {
            continue;
        }
        let mut inner = other.lock();
        if inner.find(ud.data.ver).is_some() {
            inner.fill(ud.data.ver, ud.data.orig_ver, ud.data.rule);
        } else if let Some(op) = &op {
            let weak = Arc::downgrade(op);
            if let Some(tag) =
                inner.assign_for_op(&weak, ud.data.ver, ud.data.orig_ver, ud.data.rule)
            {
                assigned.push((other.clone(), tag, ud.data.ver));
            } else {
                inner.fill(ud.data.ver, ud.data.orig_ver, ud.data.rule);
            }
        } else {
            inner.fill(ud.data.ver, ud.data.orig_ver, ud.data.rule);
        }
    }

    if let Some(op) = &op {
        for (history, tag, ver) in assigned {
            op.note_assigned(&history, tag, ver);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table() {
        global_init();
        let types = standard_types();
        assert_eq!(types.len(), 4);
        assert_eq!(types[0].type_id, HTYPE_FOL);
        assert_eq!(types[0].remote_type_id, HTYPE_FOL_REM);
        assert_eq!(types[2].name, "slot");

        // conjugation is an involution
        for t in types {
            let kind = t.kind;
            assert_eq!(
                HistoryKind::type_id(kind),
                match kind {
                    HistoryKind::Fol => HistoryKind::RemoteFol,
                    HistoryKind::RemoteFol => HistoryKind::Fol,
                    HistoryKind::Slot => HistoryKind::RemoteSlot,
                    HistoryKind::RemoteSlot => HistoryKind::Slot,
                }
                .remote_type_id()
            );
        }
    }

    #[test]
    fn test_mirror_kinds() {
        assert!(!HistoryKind::Fol.is_mirror());
        assert!(HistoryKind::RemoteFol.is_mirror());
        assert!(!HistoryKind::Slot.is_mirror());
        assert!(HistoryKind::RemoteSlot.is_mirror());
    }
}
