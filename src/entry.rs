// src/entry.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

/// Posting side. An entry carries exactly one side and a single positive
/// amount, so the both-sides-populated state cannot be represented.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub fn opposite(&self) -> Self {
        match self {
            EntryType::Credit => EntryType::Debit,
            EntryType::Debit => EntryType::Credit,
        }
    }

    /// Sign an amount: credits add to a balance, debits subtract.
    pub fn signed(&self, amount: i64) -> i64 {
        match self {
            EntryType::Credit => amount,
            EntryType::Debit => -amount,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Credit => "credit",
            EntryType::Debit => "debit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(EntryType::Credit),
            "debit" => Some(EntryType::Debit),
            _ => None,
        }
    }
}

/// Provenance of an entry, fixed at creation and consulted by aggregation
/// instead of sniffing remark text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Entered by the user against a regular party.
    Regular,
    /// Derived commission posting.
    Commission,
    /// Derived company counter-posting.
    Company,
    /// Derived opposite-side posting on the mirror counterpart party.
    Mirror,
    /// A settlement checkpoint's own ledger representation.
    Settlement,
}

impl EntryKind {
    /// Derived entries exist only alongside a primary entry.
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            EntryKind::Commission | EntryKind::Company | EntryKind::Mirror
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Regular => "regular",
            EntryKind::Commission => "commission",
            EntryKind::Company => "company",
            EntryKind::Mirror => "mirror",
            EntryKind::Settlement => "settlement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(EntryKind::Regular),
            "commission" => Some(EntryKind::Commission),
            "company" => Some(EntryKind::Company),
            "mirror" => Some(EntryKind::Mirror),
            "settlement" => Some(EntryKind::Settlement),
            _ => None,
        }
    }
}

/// The atomic unit of the book: one credit or debit against one party.
///
/// Invariants:
/// - `amount` is positive on every user-entered entry (a settlement entry
///   may carry 0 when it freezes a flat balance)
/// - `settled == true` iff `settlement_id` resolves to a settlement of the
///   same (user, party); any other combination is an orphan
/// - `sequence` is assigned once by the store at insert time and never
///   recomputed; ordering is `(date, sequence)` only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Denormalized party name, unique per user.
    pub party: String,
    pub entry_type: EntryType,
    /// Amount in minor currency units.
    pub amount: i64,
    pub kind: EntryKind,
    /// Business date of the transaction.
    pub date: NaiveDate,
    /// Insertion-order tie break, assigned by the store. 0 until inserted.
    pub sequence: u64,
    pub remarks: String,
    /// False while the entry is live, true once frozen by a settlement.
    pub settled: bool,
    pub settlement_id: Option<Uuid>,
    /// Running balance cached at the moment the entry was frozen.
    pub balance_snapshot: Option<i64>,
    /// Set on derived entries: the primary entry that produced this one.
    pub derived_from: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        user_id: Uuid,
        party: impl Into<String>,
        entry_type: EntryType,
        amount: i64,
        date: NaiveDate,
        remarks: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            party: party.into(),
            entry_type,
            amount,
            kind: EntryKind::Regular,
            date,
            sequence: 0,
            remarks: remarks.into(),
            settled: false,
            settlement_id: None,
            balance_snapshot: None,
            derived_from: None,
            idempotency_key: None,
            created_at: Utc::now(),
        }
    }

    /// A derived entry sharing the primary's user and business date.
    pub fn derived(
        primary: &LedgerEntry,
        kind: EntryKind,
        party: impl Into<String>,
        entry_type: EntryType,
        amount: i64,
        remarks: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            derived_from: Some(primary.id),
            ..Self::new(
                primary.user_id,
                party,
                entry_type,
                amount,
                primary.date,
                remarks,
            )
        }
    }

    /// Balance contribution of this entry.
    pub fn signed_amount(&self) -> i64 {
        self.entry_type.signed(self.amount)
    }

    pub fn is_settlement(&self) -> bool {
        matches!(self.kind, EntryKind::Settlement)
    }

    /// Whether the settled flag and the settlement link agree.
    pub fn link_consistent(&self) -> bool {
        self.settled == self.settlement_id.is_some()
    }

    /// Validate a user-entered posting before any write.
    pub fn validate_posting(amount: i64) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        Ok(())
    }
}
