use ethereum_types::H128;

/// 128-bit identifier of a DTM instance. Histories reuse the same width:
/// an owned history is identified by the id of the instance that mints its
/// versions, a mirror history by the id of the instance it mirrors.
pub type InstanceId = H128;

/// Position of an update within one history. Version 0 is never assigned;
/// it marks an update whose authoritative version has not been decided yet.
pub type Version = u64;

pub fn id_from_u128(raw: u128) -> InstanceId {
    H128::from_slice(&raw.to_be_bytes())
}

pub fn id_to_u128(id: &InstanceId) -> u128 {
    u128::from_be_bytes(id.to_fixed_bytes())
}

/// Derives a related id by offsetting the low bits, wrapping on overflow.
/// Used by the remote-set manager to mint per-peer remote ids off the
/// local instance id.
pub fn id_plus(id: &InstanceId, k: u64) -> InstanceId {
    id_from_u128(id_to_u128(id).wrapping_add(k as u128))
}

/// Progression of a single update, also the derived state of a whole
/// operation. Transitions are monotonically non-decreasing; the only
/// downgrades are explicit reset/undo, which park updates back in `Limbo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpState {
    /// Rolled back, or not yet part of a live operation.
    Limbo,
    /// Known but not executable yet (ordering predecessors missing).
    Future,
    /// Prepared; transport in flight.
    InProgress,
    /// Receipt acknowledged by the owner, still volatile there.
    Volatile,
    /// Durable on the owner.
    Persistent,
    /// Durable everywhere it matters.
    Stable,
    /// May be reclaimed.
    Pruned,
}

/// Version-assignment rule of an update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdateRule {
    /// Consecutive: the update's version is its predecessor's plus one.
    #[default]
    Inc = 0,
    /// Initial: the update creates the versioned entity.
    New = 1,
}

impl UpdateRule {
    pub fn from_wire(raw: u8) -> Option<UpdateRule> {
        match raw {
            0 => Some(UpdateRule::Inc),
            1 => Some(UpdateRule::New),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_offset_roundtrip() {
        let base = id_from_u128(0xdead_beef_0000_0001);
        assert_eq!(id_to_u128(&id_plus(&base, 7)), 0xdead_beef_0000_0008);
        assert_ne!(id_plus(&base, 1), id_plus(&base, 2));
    }

    #[test]
    fn test_state_order() {
        assert!(UpState::Limbo < UpState::Future);
        assert!(UpState::Future < UpState::InProgress);
        assert!(UpState::InProgress < UpState::Volatile);
        assert!(UpState::Volatile < UpState::Persistent);
        assert!(UpState::Persistent < UpState::Stable);
        assert!(UpState::Stable < UpState::Pruned);
    }

    #[test]
    fn test_rule_wire() {
        assert_eq!(UpdateRule::from_wire(0), Some(UpdateRule::Inc));
        assert_eq!(UpdateRule::from_wire(1), Some(UpdateRule::New));
        assert_eq!(UpdateRule::from_wire(2), None);
        assert_eq!(UpdateRule::New.to_wire(), 1);
    }
}
