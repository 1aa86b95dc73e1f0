//! The remote-set manager: discovers the peers of the local instance,
//! keeps one remote per peer, and reacts to connection-lifecycle and
//! high-availability events.
//!
//! Lock order when (un)subscribing: the peer directory's internal lock is
//! taken before any transport lock, and the remote-set lock here is a
//! leaf: it is never held while taking a history lock.

use std::sync::Arc;

use auto_impl::auto_impl;
use parking_lot::Mutex;

use crate::dtm::Dtm;
use crate::errors::Result;
use crate::oper;
use crate::remote::{Remote, RemoteBackend, Transport};
use crate::types::{id_plus, InstanceId};

/// Connection lifecycle, as reported by the transport layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Initialised,
    Connecting,
    Active,
    Terminating,
    Terminated,
    Failed,
    Finalised,
}

/// Peer liveness, as reported by the high-availability subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaState {
    Online,
    Transient,
    Failed,
}

/// What a discovered service is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    Dtm,
    Io,
    Confd,
}

pub struct PeerInfo {
    pub service_id: InstanceId,
    pub kind: ServiceKind,
    pub transport: Arc<dyn Transport>,
}

/// Source of peers and liveness subscriptions: the configuration cache
/// plus service-context pool of the host. Read-only from this side;
/// `retain`/`release` bracket each subscription symmetrically.
#[auto_impl(&, Arc)]
pub trait PeerDirectory: Send + Sync {
    fn peers(&self) -> Vec<PeerInfo>;

    /// Pins the directory entry for a subscribed peer. Returns false if
    /// the peer is unknown.
    fn retain(&self, service: &InstanceId) -> bool;

    /// Releases a pin taken by [`PeerDirectory::retain`].
    fn release(&self, service: &InstanceId);
}

struct ClientRemote {
    service: InstanceId,
    remote: Arc<Remote>,
    conn: ConnState,
    subscribed: bool,
}

/// The set of remotes of one local instance.
pub struct DtmClient {
    dtm: Arc<Dtm>,
    dir: Arc<dyn PeerDirectory>,
    remotes: Mutex<Vec<ClientRemote>>,
}

impl DtmClient {
    /// Enumerates the directory, keeps every transaction-manager service
    /// except the local one, and allocates one remote per peer. Remote ids
    /// are minted off the local id, `local + k` for the k-th peer.
    pub fn new(dtm: &Arc<Dtm>, dir: Arc<dyn PeerDirectory>) -> Result<DtmClient> {
        let client = DtmClient {
            dtm: dtm.clone(),
            dir,
            remotes: Mutex::new(Vec::new()),
        };
        let mut remotes = client.remotes.lock();
        let mut k = 0u64;
        for peer in client.dir.peers() {
            if peer.kind != ServiceKind::Dtm || peer.service_id == dtm.id() {
                continue;
            }
            k += 1;
            let remote = Remote::new(
                dtm,
                id_plus(&dtm.id(), k),
                peer.service_id,
                RemoteBackend::Rpc(peer.transport),
            )?;
            let subscribed = client.dir.retain(&peer.service_id);
            if !subscribed {
                warn!(peer = %peer.service_id, "peer vanished before subscription");
            }
            remotes.push(ClientRemote {
                service: peer.service_id,
                remote,
                conn: ConnState::Initialised,
                subscribed,
            });
        }
        if remotes.is_empty() {
            debug!(id = %dtm.id(), "no peers discovered");
        }
        drop(remotes);
        Ok(client)
    }

    pub fn dtm(&self) -> &Arc<Dtm> {
        &self.dtm
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.lock().len()
    }

    pub fn remote_for(&self, service: &InstanceId) -> Option<Arc<Remote>> {
        self.remotes
            .lock()
            .iter()
            .find(|cr| cr.service == *service)
            .map(|cr| cr.remote.clone())
    }

    /// True iff at least one peer was discovered and every connection is
    /// active.
    pub fn is_connected(&self) -> bool {
        let remotes = self.remotes.lock();
        !remotes.is_empty()
            && remotes
                .iter()
                .all(|cr| cr.conn == ConnState::Active && cr.remote.is_connected())
    }

    /// Connection-lifecycle event for one peer.
    pub fn conn_event(&self, service: &InstanceId, state: ConnState) {
        debug!(peer = %service, ?state, "connection event");
        match state {
            ConnState::Finalised => {
                let detached = {
                    let mut remotes = self.remotes.lock();
                    remotes
                        .iter()
                        .position(|cr| cr.service == *service)
                        .map(|pos| remotes.remove(pos))
                };
                if let Some(cr) = detached {
                    if cr.subscribed {
                        self.dir.release(&cr.service);
                    }
                    cr.remote.detach();
                }
            }
            ConnState::Active => {
                let reconnected = {
                    let mut remotes = self.remotes.lock();
                    match remotes.iter_mut().find(|cr| cr.service == *service) {
                        Some(cr) => {
                            let was = cr.conn;
                            cr.conn = ConnState::Active;
                            if was != ConnState::Initialised && was != ConnState::Active {
                                cr.remote.bump_epoch();
                                Some(cr.remote.clone())
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };
                // a peer coming back after an outage gets the in-flight
                // operations replayed
                if let Some(remote) = reconnected {
                    if let Err(err) = remote.redo_all() {
                        warn!(peer = %service, %err, "replay on reconnect failed");
                    }
                }
            }
            other => {
                let mut remotes = self.remotes.lock();
                if let Some(cr) = remotes.iter_mut().find(|cr| cr.service == *service) {
                    cr.conn = other;
                }
            }
        }
    }

    /// High-availability event for one peer. A peer declared failed takes
    /// down every distributed transaction it participates in: one lost
    /// participant invalidates the whole transaction.
    pub fn ha_event(&self, service: &InstanceId, state: HaState) {
        match state {
            HaState::Online | HaState::Transient => {
                debug!(peer = %service, ?state, "availability event");
            }
            HaState::Failed => {
                warn!(peer = %service, "peer declared dead");
                let remote = self.remote_for(service);
                if let Some(remote) = remote {
                    remote.mark_dead();
                    let undone = oper::undo_for_peer(&self.dtm, &remote);
                    info!(peer = %service, undone, "rolled back in-flight operations");
                }
            }
        }
    }

    /// Tears the remote set down in reverse insertion order.
    pub fn fini(&self) {
        let mut remotes = self.remotes.lock();
        while let Some(cr) = remotes.pop() {
            if cr.subscribed {
                self.dir.release(&cr.service);
            }
            cr.remote.detach();
        }
    }
}

impl Drop for DtmClient {
    fn drop(&mut self) {
        self.fini();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use crate::remote::WireItem;
    use crate::types::id_from_u128;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullTransport {
        active: AtomicBool,
    }

    impl NullTransport {
        fn new() -> Arc<NullTransport> {
            Arc::new(NullTransport {
                active: AtomicBool::new(true),
            })
        }
    }

    impl Transport for NullTransport {
        fn post(&self, _item: WireItem) -> Result<()> {
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::Relaxed)
        }
    }

    #[derive(Default)]
    struct MockDirectory {
        peers: RwLock<Vec<(InstanceId, ServiceKind)>>,
        pins: Mutex<HashMap<InstanceId, usize>>,
        releases: AtomicUsize,
    }

    impl MockDirectory {
        fn with_peers(peers: &[(u128, ServiceKind)]) -> Arc<MockDirectory> {
            let dir = Arc::new(MockDirectory::default());
            *dir.peers.write() = peers
                .iter()
                .map(|&(raw, kind)| (id_from_u128(raw), kind))
                .collect();
            dir
        }

        fn pin_count(&self, id: &InstanceId) -> usize {
            *self.pins.lock().get(id).unwrap_or(&0)
        }
    }

    impl PeerDirectory for MockDirectory {
        fn peers(&self) -> Vec<PeerInfo> {
            self.peers
                .read()
                .iter()
                .map(|(id, kind)| PeerInfo {
                    service_id: *id,
                    kind: *kind,
                    transport: NullTransport::new(),
                })
                .collect()
        }

        fn retain(&self, service: &InstanceId) -> bool {
            if self.peers.read().iter().any(|(id, _)| id == service) {
                *self.pins.lock().entry(*service).or_insert(0) += 1;
                true
            } else {
                false
            }
        }

        fn release(&self, service: &InstanceId) {
            self.releases.fetch_add(1, Ordering::Relaxed);
            if let Some(count) = self.pins.lock().get_mut(service) {
                *count -= 1;
            }
        }
    }

    #[test]
    fn test_no_peers_not_connected() {
        let dtm = Dtm::new(id_from_u128(0xc0));
        let dir = MockDirectory::with_peers(&[]);
        let client = DtmClient::new(&dtm, dir).unwrap();
        assert_eq!(client.remote_count(), 0);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_discovery_filters_kind_and_self() {
        let dtm = Dtm::new(id_from_u128(0xc1));
        let dir = MockDirectory::with_peers(&[
            (0xc1, ServiceKind::Dtm), // self, skipped
            (0xd1, ServiceKind::Dtm),
            (0xd2, ServiceKind::Io), // not a transaction manager
            (0xd3, ServiceKind::Dtm),
        ]);
        let client = DtmClient::new(&dtm, dir.clone()).unwrap();
        assert_eq!(client.remote_count(), 2);

        // remote ids are minted off the local id
        let rem = client.remote_for(&id_from_u128(0xd1)).unwrap();
        assert_eq!(rem.id(), id_plus(&dtm.id(), 1));
        assert_eq!(rem.target(), id_from_u128(0xd1));

        // each kept peer is pinned exactly once
        assert_eq!(dir.pin_count(&id_from_u128(0xd1)), 1);
        assert_eq!(dir.pin_count(&id_from_u128(0xd3)), 1);
        assert_eq!(dir.pin_count(&id_from_u128(0xd2)), 0);
    }

    #[test]
    fn test_is_connected_needs_all_active() {
        let dtm = Dtm::new(id_from_u128(0xc2));
        let dir =
            MockDirectory::with_peers(&[(0xd4, ServiceKind::Dtm), (0xd5, ServiceKind::Dtm)]);
        let client = DtmClient::new(&dtm, dir).unwrap();
        assert!(!client.is_connected());

        client.conn_event(&id_from_u128(0xd4), ConnState::Active);
        assert!(!client.is_connected());
        client.conn_event(&id_from_u128(0xd5), ConnState::Active);
        assert!(client.is_connected());

        client.conn_event(&id_from_u128(0xd4), ConnState::Terminating);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_finalised_detaches_and_releases() {
        let dtm = Dtm::new(id_from_u128(0xc3));
        let dir = MockDirectory::with_peers(&[(0xd6, ServiceKind::Dtm)]);
        let client = DtmClient::new(&dtm, dir.clone()).unwrap();
        let peer = id_from_u128(0xd6);
        assert_eq!(dir.pin_count(&peer), 1);

        client.conn_event(&peer, ConnState::Finalised);
        assert_eq!(client.remote_count(), 0);
        assert_eq!(dir.pin_count(&peer), 0);
        assert!(client.remote_for(&peer).is_none());
    }

    #[test]
    fn test_ha_failure_kills_the_remote() {
        use crate::errors::DtmError;

        let dtm = Dtm::new(id_from_u128(0xc5));
        let dir = MockDirectory::with_peers(&[(0xd9, ServiceKind::Dtm)]);
        let client = DtmClient::new(&dtm, dir).unwrap();
        let peer = id_from_u128(0xd9);
        client.conn_event(&peer, ConnState::Active);
        assert!(client.is_connected());

        client.ha_event(&peer, HaState::Failed);
        let rem = client.remote_for(&peer).unwrap();
        assert!(rem.is_dead());
        assert!(!client.is_connected());
        assert!(matches!(
            rem.persistent(dtm.fol()),
            Err(DtmError::PeerDead(_))
        ));
    }

    #[test]
    fn test_fini_releases_symmetrically() {
        let dtm = Dtm::new(id_from_u128(0xc4));
        let dir =
            MockDirectory::with_peers(&[(0xd7, ServiceKind::Dtm), (0xd8, ServiceKind::Dtm)]);
        let client = DtmClient::new(&dtm, dir.clone()).unwrap();
        client.fini();
        assert_eq!(client.remote_count(), 0);
        assert_eq!(dir.releases.load(Ordering::Relaxed), 2);
        assert_eq!(dir.pin_count(&id_from_u128(0xd7)), 0);
        assert_eq!(dir.pin_count(&id_from_u128(0xd8)), 0);
    }
}
