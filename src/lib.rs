//! In-memory core of a distributed transaction manager for a clustered
//! store.
//!
//! Every participating node runs one [`Dtm`] instance. Instances order
//! updates in versioned histories, drive them through
//! volatile → persistent → stable, and exchange small one-way notices to
//! agree on durability, rollback and replay. The local FOL records what
//! this node executed; mirror histories track what its peers executed;
//! slots order operations across histories.

#[macro_use]
extern crate tracing;

pub mod catalogue;
pub mod client;
pub mod dtm;
pub mod dtx0;
pub mod errors;
pub mod history;
pub mod htype;
pub mod oper;
pub mod remote;
pub mod types;
mod utils;


pub use client::{ConnState, DtmClient, HaState, PeerDirectory, PeerInfo, ServiceKind};
pub use dtm::Dtm;
pub use dtx0::{Dtx0, DtxState, DtxStatus, MAX_SLOTS};
pub use errors::{DecodeError, DtmError, Result};
pub use history::{History, HistoryFlags, Up};
pub use htype::{global_fini, global_init, HistoryKind, HistoryType};
pub use oper::{Op, Update, UpdateSpec};
pub use remote::{Remote, RemoteBackend, Transport, WireItem};
pub use types::{InstanceId, UpState, UpdateRule, Version};
