//! The per-process transaction-manager instance: the history-type table,
//! the catalogues of histories, the local FOL and the local slot, and the
//! delivery entry point for incoming notices.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::catalogue::Catalogue;
use crate::errors::{DtmError, Result};
use crate::history::{History, HistoryFlags};
use crate::htype::{self, HistoryKind, HistoryType};
use crate::oper::{self, Op};
use crate::remote::wire::{HistoryAddr, Notice, NoticeOpcode, OpDescr, Wire};
use crate::types::{InstanceId, UpState};

pub struct Dtm {
    id: InstanceId,
    htypes: RwLock<BTreeMap<u8, HistoryType>>,
    cats: Mutex<BTreeMap<u8, Catalogue>>,
    fol: OnceCell<Arc<History>>,
    slot: OnceCell<Arc<History>>,
    /// Operations built from received requests; kept alive here until
    /// they stabilise and are pruned.
    received: Mutex<Vec<Arc<Op>>>,
}

impl Dtm {
    /// Creates an instance with the given globally unique id, seeds the
    /// standard history kinds and its local FOL and slot.
    pub fn new(id: InstanceId) -> Arc<Dtm> {
        htype::global_init();
        let dtm = Arc::new(Dtm {
            id,
            htypes: RwLock::new(BTreeMap::new()),
            cats: Mutex::new(BTreeMap::new()),
            fol: OnceCell::new(),
            slot: OnceCell::new(),
            received: Mutex::new(Vec::new()),
        });
        for ht in htype::standard_types() {
            dtm.register_history_type(*ht).unwrap();
        }
        let fol = History::new(
            HistoryKind::Fol,
            id,
            HistoryFlags {
                owned: true,
                eager: true,
            },
        );
        let slot = History::new(
            HistoryKind::Slot,
            id,
            HistoryFlags {
                owned: true,
                eager: false,
            },
        );
        dtm.fol.set(fol).unwrap();
        dtm.slot.set(slot).unwrap();
        info!(id = %dtm.id, "transaction manager instance ready");
        dtm
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The local file-operation log.
    pub fn fol(&self) -> &Arc<History> {
        self.fol.get().unwrap()
    }

    /// The local intent slot.
    pub fn slot(&self) -> &Arc<History> {
        self.slot.get().unwrap()
    }

    pub fn register_history_type(&self, ht: HistoryType) -> Result<()> {
        let mut table = self.htypes.write();
        if table.contains_key(&ht.type_id) {
            return Err(DtmError::Internal("history type id already registered"));
        }
        table.insert(ht.type_id, ht);
        Ok(())
    }

    pub fn deregister_history_type(&self, type_id: u8) -> Option<HistoryType> {
        self.htypes.write().remove(&type_id)
    }

    pub fn history_type(&self, type_id: u8) -> Option<HistoryType> {
        self.htypes.read().get(&type_id).copied()
    }

    pub(crate) fn catalogue_add(&self, type_id: u8, history: Arc<History>) -> Result<()> {
        self.cats.lock().entry(type_id).or_default().add(history)
    }

    pub(crate) fn catalogue_del(&self, type_id: u8, id: &InstanceId) -> Option<Arc<History>> {
        self.cats.lock().get_mut(&type_id)?.del(id)
    }

    pub(crate) fn catalogue_lookup(&self, type_id: u8, id: &InstanceId) -> Option<Arc<History>> {
        self.cats.lock().get(&type_id)?.lookup(id)
    }

    /// Snapshot of every catalogued history of one type.
    pub(crate) fn mirrors(&self, type_id: u8) -> Vec<Arc<History>> {
        self.cats
            .lock()
            .get(&type_id)
            .map(|cat| cat.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Locates the history of the given registered type and id.
    pub fn history_open(self: &Arc<Self>, type_id: u8, id: InstanceId) -> Result<Arc<History>> {
        htype::find_history(self, &HistoryAddr { htype: type_id, id })
    }

    /// Releases a history. Mirror histories are detached from their
    /// catalogue; the local FOL and slot live as long as the instance.
    pub fn history_close(&self, history: &Arc<History>) {
        if history.kind().is_mirror() {
            self.catalogue_del(history.type_id(), &history.id());
        }
    }

    /// Entry point for a received notification. Malformed buffers and
    /// references to unknown histories are protocol errors: the caller is
    /// expected to log and drop, the instance state is untouched.
    pub fn deliver(self: &Arc<Self>, buf: &[u8]) -> Result<()> {
        let notice = Notice::unpack_all(buf)?;
        let history = htype::find_history(self, &notice.id)?;
        debug!(
            history = history.kind().name(),
            id = %notice.id.id,
            ver = notice.ver,
            opcode = ?notice.opcode,
            "notice delivered"
        );
        match notice.opcode {
            NoticeOpcode::Persistent => {
                if let Some(descr) = &notice.op {
                    htype::onp(self, &history, descr)?;
                }
                history.mark_persistent(notice.ver)
            }
            NoticeOpcode::Fixed => history.seal(),
            NoticeOpcode::Reset => {
                history.reset(notice.ver);
                Ok(())
            }
            NoticeOpcode::Undo => {
                history.undo(notice.ver);
                Ok(())
            }
            NoticeOpcode::Redo => oper::apply_redo(self, &history, &notice),
        }
    }

    /// Entry point for a received operation request: builds and prepares
    /// the local counterpart of the sender's operation. The instance keeps
    /// the operation alive until it is pruned.
    pub fn deliver_request(self: &Arc<Self>, descr: &[u8], payload: &[u8]) -> Result<Arc<Op>> {
        let descr = OpDescr::unpack_all(descr)?;
        let op = oper::apply_request(self, &descr, payload)?;
        self.received.lock().push(op.clone());
        Ok(op)
    }

    /// Drops received operations that have stabilised. Returns how many
    /// were reclaimed.
    pub fn prune(&self) -> usize {
        let mut received = self.received.lock();
        let before = received.len();
        received.retain(|op| op.state() < UpState::Stable);
        before - received.len()
    }
}

impl std::fmt::Debug for Dtm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dtm").field("id", &self.id).finish()
    }
}
