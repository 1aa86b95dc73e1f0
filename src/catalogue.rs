//! Arena-backed catalogue of histories, indexed by id.
//!
//! Catalogues break the reference cycles between the instance, its
//! histories and its remotes: the instance owns each history through the
//! catalogue of its kind, and every cross-link elsewhere is a non-owning
//! handle bounded by the catalogue entry's lifetime.

use std::collections::BTreeMap;
use std::sync::Arc;

use slab::Slab;

use crate::errors::{DtmError, Result};
use crate::history::History;
use crate::types::InstanceId;

#[derive(Default)]
pub struct Catalogue {
    arena: Slab<Arc<History>>,
    index: BTreeMap<InstanceId, usize>,
}

impl Catalogue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a history under its id. The id must be free.
    pub fn add(&mut self, history: Arc<History>) -> Result<()> {
        let id = history.id();
        if self.index.contains_key(&id) {
            return Err(DtmError::Internal("catalogue id already taken"));
        }
        let slot = self.arena.insert(history);
        self.index.insert(id, slot);
        Ok(())
    }

    pub fn del(&mut self, id: &InstanceId) -> Option<Arc<History>> {
        let slot = self.index.remove(id)?;
        Some(self.arena.remove(slot))
    }

    pub fn lookup(&self, id: &InstanceId) -> Option<Arc<History>> {
        let slot = *self.index.get(id)?;
        Some(self.arena[slot].clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<History>> {
        self.index.values().map(|slot| &self.arena[*slot])
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryFlags;
    use crate::htype::HistoryKind;
    use crate::types::id_from_u128;

    fn history(id: u128) -> Arc<History> {
        History::new(HistoryKind::RemoteFol, id_from_u128(id), HistoryFlags::default())
    }

    #[test]
    fn test_add_lookup_del() {
        let mut cat = Catalogue::new();
        cat.add(history(1)).unwrap();
        cat.add(history(2)).unwrap();

        assert_eq!(cat.len(), 2);
        assert!(cat.lookup(&id_from_u128(1)).is_some());
        assert!(cat.lookup(&id_from_u128(3)).is_none());

        let gone = cat.del(&id_from_u128(1)).unwrap();
        assert_eq!(gone.id(), id_from_u128(1));
        assert!(cat.lookup(&id_from_u128(1)).is_none());
        assert_eq!(cat.len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut cat = Catalogue::new();
        cat.add(history(7)).unwrap();
        assert!(matches!(
            cat.add(history(7)),
            Err(DtmError::Internal(_))
        ));
    }

    #[test]
    fn test_iter_ordered_by_id() {
        let mut cat = Catalogue::new();
        for raw in [9u128, 3, 5] {
            cat.add(history(raw)).unwrap();
        }
        let ids: Vec<_> = cat.iter().map(|h| h.id()).collect();
        assert_eq!(
            ids,
            vec![id_from_u128(3), id_from_u128(5), id_from_u128(9)]
        );
    }
}
