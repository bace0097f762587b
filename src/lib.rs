// src/lib.rs
pub mod adapters;
pub mod balance;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod entry;
pub mod error;
pub mod generator;
pub mod party;
pub mod settlement;
pub mod trial_balance;

pub use balance::{PartyStatement, StatementLine};
pub use config::BookConfig;
pub use context::{
    CacheInvalidator, EntryRelink, ExecutionPlan, LedgerContext, Operation, PartyScope, Posting,
    RepairReport,
};
pub use diagnostics::{DiagnosticsReport, OrphanKind};
pub use entry::{EntryKind, EntryType, LedgerEntry};
pub use error::LedgerError;
pub use party::{CommissionMode, Party, PartyKind};
pub use settlement::{EntryLink, Settlement};
pub use trial_balance::{PartyRow, TrialBalance};

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) fn hash_idempotency_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Record-store interface the ledger runs against.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Apply the whole plan atomically. Implementors MUST:
    /// 1. BEGIN a store transaction
    /// 2. Serialize on every scope in `scopes`, in the given order
    /// 3. Re-verify plan preconditions under the locks (freeze targets
    ///    still live, idempotency keys unused), returning Conflict /
    ///    DuplicatePosting if not
    /// 4. Apply all operations, assigning insertion sequences
    /// 5. COMMIT on success, ROLLBACK on any error
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        scopes: &[PartyScope],
    ) -> Result<(), LedgerError>;

    // READ OPERATIONS
    /// Entries for a user, optionally one party, in (date, sequence) order.
    async fn list_entries(
        &self,
        user_id: Uuid,
        party: Option<&str>,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;
    async fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry, LedgerError>;
    /// Derived entries of a primary, exact foreign-key match.
    async fn entries_derived_from(
        &self,
        source_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;
    /// Settlements in (settled_on, sequence) order.
    async fn list_settlements(
        &self,
        user_id: Uuid,
        party: Option<&str>,
    ) -> Result<Vec<Settlement>, LedgerError>;
    async fn settlement(&self, settlement_id: Uuid) -> Result<Settlement, LedgerError>;
    async fn list_parties(&self, user_id: Uuid) -> Result<Vec<Party>, LedgerError>;
    async fn party(&self, user_id: Uuid, name: &str) -> Result<Party, LedgerError>;
    async fn check_idempotency_key(&self, key: &str) -> Result<(), LedgerError>;
    /// Book configuration; defaults apply for users that never set one.
    async fn book_config(&self, user_id: Uuid) -> Result<BookConfig, LedgerError>;
    async fn set_book_config(&self, config: BookConfig) -> Result<(), LedgerError>;
}

/// Initialize the ledger with a store implementation.
pub struct LedgerSystem {
    store: Arc<dyn LedgerStore>,
}

impl LedgerSystem {
    pub fn new(store: Box<dyn LedgerStore>) -> Self {
        Self {
            store: store.into(),
        }
    }

    /// Get store reference
    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    /// Get store Arc (for creating contexts)
    pub fn store_arc(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }
}
