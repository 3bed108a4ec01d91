use serde::{Deserialize, Serialize};

/// Lifecycle states of a transaction.
///
/// ```text
/// Active ─► Preparing ─► Prepared ─► Committing ─► Committed
///   │           │            │            └──────► Unknown
///   └───────────┴────────────┴─► MarkedRollback ─► RollingBack ─► RolledBack
///                                                      └────────► Unknown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxState {
    Active = 0,
    Preparing = 1,
    Prepared = 2,
    Committing = 3,
    Committed = 4,
    MarkedRollback = 5,
    RollingBack = 6,
    RolledBack = 7,
    /// The outcome of a distributed finish could not be determined in time.
    Unknown = 8,
}

impl TxState {
    /// Returns `true` if `self -> next` is an edge of the state graph.
    pub fn can_transition_to(self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, MarkedRollback)
                | (Preparing, Prepared)
                | (Preparing, MarkedRollback)
                | (Prepared, Committing)
                | (Prepared, MarkedRollback)
                | (Committing, Committed)
                | (Committing, Unknown)
                | (MarkedRollback, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, Unknown)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack | TxState::Unknown)
    }

    /// States from which a transaction can still be marked for rollback.
    pub fn is_pre_commit(self) -> bool {
        matches!(self, TxState::Active | TxState::Preparing | TxState::Prepared)
    }

    pub(crate) fn from_u8(raw: u8) -> TxState {
        match raw {
            0 => TxState::Active,
            1 => TxState::Preparing,
            2 => TxState::Prepared,
            3 => TxState::Committing,
            4 => TxState::Committed,
            5 => TxState::MarkedRollback,
            6 => TxState::RollingBack,
            7 => TxState::RolledBack,
            _ => TxState::Unknown,
        }
    }
}

/// How a transaction acquires its locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxConcurrency {
    /// Locks are acquired in key order at prepare time, after which every
    /// observed value is validated.
    #[default]
    Optimistic,
    /// Locks are acquired when a key is first accessed.
    Pessimistic,
}

/// Durability flavor of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxDurability {
    /// Backup acknowledgments are awaited when the transaction commits synchronously.
    #[default]
    Strict,
    /// Eventually consistent: the transaction never waits for backup
    /// acknowledgment before considering itself prepared.
    Ec,
}

/// Role flags of a transaction on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TxFlags {
    pub local: bool,
    pub near: bool,
    pub dht: bool,
    pub remote: bool,
    pub implicit_single: bool,
    pub internal: bool,
}

impl TxFlags {
    /// Flags of a transaction started by a user on this node.
    pub fn local() -> Self {
        Self {
            local: true,
            ..Self::default()
        }
    }
}

/// Final outcome delivered by a transaction's finish future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    Committed { commit_version: crate::version::Version },
    RolledBack,
    /// Remote participants did not answer in time; the outcome needs
    /// reconciliation.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TxState; 9] = [
        TxState::Active,
        TxState::Preparing,
        TxState::Prepared,
        TxState::Committing,
        TxState::Committed,
        TxState::MarkedRollback,
        TxState::RollingBack,
        TxState::RolledBack,
        TxState::Unknown,
    ];

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn commit_cannot_follow_rollback_mark() {
        assert!(!TxState::MarkedRollback.can_transition_to(TxState::Committing));
        assert!(!TxState::Active.can_transition_to(TxState::Committed));
        assert!(TxState::Prepared.can_transition_to(TxState::MarkedRollback));
    }

    #[test]
    fn raw_encoding_round_trips() {
        for s in ALL {
            assert_eq!(TxState::from_u8(s as u8), s);
        }
    }
}
