// src/balance.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entry::LedgerEntry;

/// Sort entries into ledger order: business date ascending, insertion
/// sequence breaking ties. Nothing else participates in ordering.
pub fn order_entries(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| (a.date, a.sequence).cmp(&(b.date, b.sequence)));
}

/// Split into (unsettled, settled), preserving order within each partition.
pub fn partition(entries: Vec<LedgerEntry>) -> (Vec<LedgerEntry>, Vec<LedgerEntry>) {
    entries.into_iter().partition(|e| !e.settled)
}

/// Closing balance over an ordered entry sequence, starting from `seed`.
///
/// Settlement entries are checkpoints, not movements; they never
/// accumulate. Empty input closes at the seed.
pub fn closing_balance(seed: i64, entries: &[LedgerEntry]) -> i64 {
    entries
        .iter()
        .filter(|e| !e.is_settlement())
        .fold(seed, |acc, e| acc + e.signed_amount())
}

/// Running balance after each entry, in entry order. The value paired with
/// an entry is its snapshot candidate when a settlement freezes it.
pub fn running_balances(seed: i64, entries: &[LedgerEntry]) -> Vec<(Uuid, i64)> {
    let mut acc = seed;
    entries
        .iter()
        .filter(|e| !e.is_settlement())
        .map(|e| {
            acc += e.signed_amount();
            (e.id, acc)
        })
        .collect()
}

/// One line of a party statement: the entry and the balance after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementLine {
    pub entry: LedgerEntry,
    pub running_balance: i64,
}

/// A party's live position: the frozen opening seed, every unsettled entry
/// with its running balance, and the closing balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyStatement {
    pub party: String,
    pub opening_balance: i64,
    pub lines: Vec<StatementLine>,
    pub closing_balance: i64,
}

impl PartyStatement {
    /// Build from a party's ordered unsettled entries and settlement seed.
    pub fn build(party: impl Into<String>, seed: i64, entries: Vec<LedgerEntry>) -> Self {
        let mut acc = seed;
        let lines: Vec<StatementLine> = entries
            .into_iter()
            .filter(|e| !e.is_settlement())
            .map(|entry| {
                acc += entry.signed_amount();
                StatementLine {
                    entry,
                    running_balance: acc,
                }
            })
            .collect();

        Self {
            party: party.into(),
            opening_balance: seed,
            closing_balance: acc,
            lines,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
