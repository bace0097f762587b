// src/settlement.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::balance;
use crate::entry::{EntryKind, EntryType, LedgerEntry};

/// Remark carried by every settlement checkpoint's own ledger entry.
pub const SETTLEMENT_TAG: &str = "Monday Final Settlement";

/// A checkpoint freezing a party's unsettled entries at their net balance.
///
/// Immutable once created; administrative repair is the only sanctioned
/// correction. Checkpoints chain: the next settlement of the party opens at
/// this one's `balance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Uuid,
    pub user_id: Uuid,
    pub party: String,
    pub settled_on: NaiveDate,
    /// Net balance of the frozen partition, seeded by the prior settlement.
    pub balance: i64,
    /// This settlement's own ledger entry.
    pub entry_id: Uuid,
    /// Insertion order, assigned by the store. 0 until inserted.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

/// Link applied to a frozen entry: back-reference plus cached balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryLink {
    pub entry_id: Uuid,
    pub balance_snapshot: i64,
}

/// Everything one settlement writes: the record, its own entry, and the
/// links for every entry it freezes. Applied atomically by the store.
#[derive(Debug, Clone)]
pub struct SettlementPrep {
    pub settlement: Settlement,
    pub entry: LedgerEntry,
    pub links: Vec<EntryLink>,
}

/// The chronologically latest settlement: settlement date first, insertion
/// order breaking ties. Creation wall-clock never participates.
pub fn latest(settlements: &[Settlement]) -> Option<&Settlement> {
    settlements
        .iter()
        .max_by_key(|s| (s.settled_on, s.sequence))
}

/// Opening seed for a party's live partition.
pub fn seed_balance(settlements: &[Settlement]) -> i64 {
    latest(settlements).map(|s| s.balance).unwrap_or(0)
}

/// Prepare a settlement over a party's ordered unsettled entries.
///
/// The closing balance and per-entry snapshots are computed here; the store
/// applies the result as one unit. The settlement's own entry is frozen
/// from the moment of creation and points at its settlement, so the link
/// invariant holds for it like any other settled entry.
pub fn prepare(
    user_id: Uuid,
    party: &str,
    settled_on: NaiveDate,
    seed: i64,
    unsettled: &[LedgerEntry],
) -> SettlementPrep {
    let closing = balance::closing_balance(seed, unsettled);
    let snapshots = balance::running_balances(seed, unsettled);

    let settlement_id = Uuid::now_v7();

    let entry_type = if closing < 0 {
        EntryType::Debit
    } else {
        EntryType::Credit
    };
    let mut entry = LedgerEntry::new(
        user_id,
        party,
        entry_type,
        closing.abs(),
        settled_on,
        SETTLEMENT_TAG,
    );
    entry.kind = EntryKind::Settlement;
    entry.settled = true;
    entry.settlement_id = Some(settlement_id);
    entry.balance_snapshot = Some(closing);

    let settlement = Settlement {
        id: settlement_id,
        user_id,
        party: party.to_string(),
        settled_on,
        balance: closing,
        entry_id: entry.id,
        sequence: 0,
        created_at: Utc::now(),
    };

    let links = snapshots
        .into_iter()
        .map(|(entry_id, balance_snapshot)| EntryLink {
            entry_id,
            balance_snapshot,
        })
        .collect();

    SettlementPrep {
        settlement,
        entry,
        links,
    }
}
