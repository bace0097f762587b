// src/trial_balance.rs
//! Cross-party aggregation of closing balances.
//!
//! Settlement entries are checkpoints whose effect is already carried by
//! the balances they froze, and commission postings are one-sided by
//! construction; both are excluded before aggregation. Every remaining
//! entry (company and mirror rows included) lands on its own party's row,
//! which makes the credit/debit identity exact: each regular or mirror
//! posting is offset by a company counter-posting of equal size.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entry::{EntryKind, LedgerEntry};
use crate::party::COMMISSION_PARTY;

/// One party's closing position in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyRow {
    pub party: String,
    /// Signed closing balance: positive = net credit, negative = net debit.
    pub balance: i64,
    pub entry_count: usize,
}

/// The cross-party report. A non-zero `difference` is a correctness defect
/// in the book, surfaced here for the operator and never silently corrected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialBalance {
    /// Parties with a non-zero closing balance, name order.
    pub parties: Vec<PartyRow>,
    pub credit_total: i64,
    pub debit_total: i64,
    /// `credit_total - debit_total`; zero when the book balances.
    pub difference: i64,
}

impl TrialBalance {
    pub fn is_balanced(&self) -> bool {
        self.difference == 0
    }
}

fn excluded(entry: &LedgerEntry, company_name: &str) -> bool {
    match entry.kind {
        EntryKind::Settlement | EntryKind::Commission => true,
        // Belt for rows predating the kind tag, where provenance only
        // survives in the remark text.
        _ => entry.remarks == company_name || entry.remarks == COMMISSION_PARTY,
    }
}

/// Aggregate a user's entries into the trial balance.
pub fn aggregate(entries: &[LedgerEntry], company_name: &str) -> TrialBalance {
    let mut rows: BTreeMap<&str, (i64, usize)> = BTreeMap::new();

    for entry in entries {
        if excluded(entry, company_name) {
            continue;
        }
        let row = rows.entry(entry.party.as_str()).or_insert((0, 0));
        row.0 += entry.signed_amount();
        row.1 += 1;
    }

    let mut credit_total = 0i64;
    let mut debit_total = 0i64;
    let parties: Vec<PartyRow> = rows
        .into_iter()
        .filter(|(_, (balance, _))| *balance != 0)
        .map(|(party, (balance, entry_count))| {
            if balance > 0 {
                credit_total += balance;
            } else {
                debit_total += -balance;
            }
            PartyRow {
                party: party.to_string(),
                balance,
                entry_count,
            }
        })
        .collect();

    TrialBalance {
        parties,
        credit_total,
        debit_total,
        difference: credit_total - debit_total,
    }
}
