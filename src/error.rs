// src/error.rs
use std::fmt;
use uuid::Uuid;

#[derive(Debug)]
pub enum LedgerError {
    InvalidAmount,
    UnknownParty(String),
    InactiveParty(String),
    PartyHasEntries(String),
    EntryNotFound(Uuid),
    SettlementNotFound(Uuid),
    NothingToSettle(String),
    SettledEntryImmutable(Uuid),
    DerivedEntry(Uuid),
    DuplicatePosting(Uuid),
    Conflict(String),
    Storage(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAmount => write!(f, "Invalid amount"),
            Self::UnknownParty(name) => write!(f, "Unknown party: {}", name),
            Self::InactiveParty(name) => write!(f, "Party is inactive: {}", name),
            Self::PartyHasEntries(name) => {
                write!(f, "Party still has ledger entries: {}", name)
            }
            Self::EntryNotFound(id) => write!(f, "Entry not found: {}", id),
            Self::SettlementNotFound(id) => write!(f, "Settlement not found: {}", id),
            Self::NothingToSettle(party) => {
                write!(f, "Nothing to settle for party: {}", party)
            }
            Self::SettledEntryImmutable(id) => {
                write!(f, "Entry is frozen by a settlement: {}", id)
            }
            Self::DerivedEntry(id) => {
                write!(f, "Entry is derived, void its primary instead: {}", id)
            }
            Self::DuplicatePosting(id) => write!(f, "Duplicate posting: {}", id),
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}
