// src/context.rs
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balance::{self, PartyStatement};
use crate::config::BookConfig;
use crate::diagnostics::{self, DiagnosticsReport};
use crate::entry::{EntryKind, EntryType, LedgerEntry};
use crate::error::LedgerError;
use crate::generator;
use crate::party::Party;
use crate::settlement::{self, EntryLink, Settlement};
use crate::trial_balance::{self, TrialBalance};
use crate::{LedgerStore, hash_idempotency_key};

/// A single write the store applies as part of a plan.
#[derive(Debug, Clone)]
pub enum Operation {
    InsertEntry {
        entry: LedgerEntry,
    },
    UpsertParty {
        party: Party,
    },
    /// Checkpoint record, its own entry, and the freeze links, as one unit.
    CreateSettlement {
        settlement: Settlement,
        entry: LedgerEntry,
        links: Vec<EntryLink>,
    },
    DeleteEntries {
        user_id: Uuid,
        parties: Vec<String>,
        ids: Vec<Uuid>,
    },
    DeleteParty {
        user_id: Uuid,
        name: String,
    },
    /// Administrative link correction.
    RelinkEntries {
        user_id: Uuid,
        party: String,
        updates: Vec<EntryRelink>,
    },
}

#[derive(Debug, Clone)]
pub struct EntryRelink {
    pub entry_id: Uuid,
    pub settled: bool,
    pub settlement_id: Option<Uuid>,
    pub balance_snapshot: Option<i64>,
}

/// Serialization scope of a plan: everything a plan writes for one
/// (user, party) pair happens under that pair's store-side lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartyScope {
    pub user_id: Uuid,
    pub party: String,
}

/// An ordered batch of operations the store executes atomically.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    operations: Vec<Operation>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        Self {
            operations: Vec::new(),
        }
    }

    pub fn add(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The (user, party) pairs this plan touches, sorted and deduplicated.
    /// Stores take the pair locks in this order.
    pub fn party_scopes(&self) -> Vec<PartyScope> {
        let mut scopes = BTreeSet::new();

        for op in &self.operations {
            match op {
                Operation::InsertEntry { entry } => {
                    scopes.insert(PartyScope {
                        user_id: entry.user_id,
                        party: entry.party.clone(),
                    });
                }
                Operation::UpsertParty { party } => {
                    scopes.insert(PartyScope {
                        user_id: party.user_id,
                        party: party.name.clone(),
                    });
                }
                Operation::CreateSettlement { settlement, .. } => {
                    scopes.insert(PartyScope {
                        user_id: settlement.user_id,
                        party: settlement.party.clone(),
                    });
                }
                Operation::DeleteEntries {
                    user_id, parties, ..
                } => {
                    for party in parties {
                        scopes.insert(PartyScope {
                            user_id: *user_id,
                            party: party.clone(),
                        });
                    }
                }
                Operation::DeleteParty { user_id, name } => {
                    scopes.insert(PartyScope {
                        user_id: *user_id,
                        party: name.clone(),
                    });
                }
                Operation::RelinkEntries { user_id, party, .. } => {
                    scopes.insert(PartyScope {
                        user_id: *user_id,
                        party: party.clone(),
                    });
                }
            }
        }

        scopes.into_iter().collect()
    }
}

/// Write-through cache invalidation hook. The context calls it once per
/// touched party scope after every successful plan, so cache owners never
/// reason about staleness themselves.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, user_id: Uuid, party: &str);
}

/// A posted transaction: the user's entry plus everything derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub primary: LedgerEntry,
    pub derived: Vec<LedgerEntry>,
}

/// Outcome of an administrative repair pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RepairReport {
    /// Orphaned entries reverted to live.
    pub reverted_orphans: usize,
    /// Stale live entries linked to their party's latest settlement.
    pub relinked_stale: usize,
}

/// The public face of the ledger: posting, settling, reporting and repair
/// over a shared store.
#[derive(Clone)]
pub struct LedgerContext {
    store: Arc<dyn LedgerStore>,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
}

impl LedgerContext {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            invalidator: None,
        }
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    async fn execute(&self, plan: &ExecutionPlan) -> Result<(), LedgerError> {
        let scopes = plan.party_scopes();
        debug!(
            operations = plan.operations().len(),
            scopes = scopes.len(),
            "executing plan"
        );
        self.store.execute_plan(plan, &scopes).await?;

        if let Some(invalidator) = &self.invalidator {
            for scope in &scopes {
                invalidator.invalidate(scope.user_id, &scope.party);
            }
        }
        Ok(())
    }

    /// Post a transaction against a party, deriving and persisting its
    /// virtual entries in the same atomic batch.
    pub async fn post_transaction(
        &self,
        user_id: Uuid,
        party: &str,
        entry_type: EntryType,
        amount: i64,
        date: NaiveDate,
        remarks: impl Into<String>,
    ) -> Result<Posting, LedgerError> {
        self.post_inner(user_id, party, entry_type, amount, date, remarks.into(), None)
            .await
    }

    /// Like [`post_transaction`](Self::post_transaction), rejecting replays
    /// of the same caller-supplied key with `DuplicatePosting`.
    pub async fn post_transaction_idempotent(
        &self,
        user_id: Uuid,
        party: &str,
        entry_type: EntryType,
        amount: i64,
        date: NaiveDate,
        remarks: impl Into<String>,
        idempotency_key: &str,
    ) -> Result<Posting, LedgerError> {
        self.post_inner(
            user_id,
            party,
            entry_type,
            amount,
            date,
            remarks.into(),
            Some(hash_idempotency_key(idempotency_key)),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn post_inner(
        &self,
        user_id: Uuid,
        party_name: &str,
        entry_type: EntryType,
        amount: i64,
        date: NaiveDate,
        remarks: String,
        idempotency_key: Option<String>,
    ) -> Result<Posting, LedgerError> {
        LedgerEntry::validate_posting(amount)?;

        let party = self.store.party(user_id, party_name).await?;
        if !party.active {
            return Err(LedgerError::InactiveParty(party.name));
        }
        if let Some(key) = &idempotency_key {
            self.store.check_idempotency_key(key).await?;
        }

        let config = self.store.book_config(user_id).await?;

        let mut primary = LedgerEntry::new(user_id, party_name, entry_type, amount, date, remarks);
        primary.idempotency_key = idempotency_key;
        let derived = generator::derive_entries(&primary, &party, &config);

        let mut plan = ExecutionPlan::new();
        for missing in self.missing_parties(user_id, &config, &derived).await? {
            plan.add(Operation::UpsertParty { party: missing });
        }
        plan.add(Operation::InsertEntry {
            entry: primary.clone(),
        });
        for entry in &derived {
            plan.add(Operation::InsertEntry {
                entry: entry.clone(),
            });
        }

        self.execute(&plan).await?;

        histogram!("ledger.posting.amount").record(amount as f64);
        counter!("ledger.postings.total", "type" => entry_type.as_str()).increment(1);

        let primary = self.store.entry(primary.id).await?;
        let derived = self.store.entries_derived_from(primary.id).await?;
        Ok(Posting { primary, derived })
    }

    /// Parties the derived entries reference that do not exist yet.
    /// Reserved accounts are auto-created with their kind tag.
    async fn missing_parties(
        &self,
        user_id: Uuid,
        config: &BookConfig,
        derived: &[LedgerEntry],
    ) -> Result<Vec<Party>, LedgerError> {
        let mut out: Vec<Party> = Vec::new();

        for entry in derived {
            if out.iter().any(|p| p.name == entry.party) {
                continue;
            }
            match self.store.party(user_id, &entry.party).await {
                Ok(_) => {}
                Err(LedgerError::UnknownParty(_)) => {
                    let party = match entry.kind {
                        EntryKind::Commission => Party::commission(user_id),
                        EntryKind::Company => Party::company(user_id, config.company_name.clone()),
                        _ => Party::new(user_id, entry.party.clone()),
                    };
                    out.push(party);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(out)
    }

    /// Re-run virtual entry generation for an existing primary entry.
    /// Exact `derived_from` matching makes this a no-op when derived
    /// entries already exist.
    pub async fn regenerate_derived(
        &self,
        user_id: Uuid,
        entry_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let primary = self.store.entry(entry_id).await?;
        if primary.user_id != user_id {
            return Err(LedgerError::EntryNotFound(entry_id));
        }

        let existing = self.store.entries_derived_from(primary.id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let party = self.store.party(user_id, &primary.party).await?;
        let config = self.store.book_config(user_id).await?;
        let derived = generator::derive_entries(&primary, &party, &config);
        if derived.is_empty() {
            return Ok(Vec::new());
        }

        let mut plan = ExecutionPlan::new();
        for missing in self.missing_parties(user_id, &config, &derived).await? {
            plan.add(Operation::UpsertParty { party: missing });
        }
        for entry in &derived {
            plan.add(Operation::InsertEntry {
                entry: entry.clone(),
            });
        }
        self.execute(&plan).await?;

        counter!("ledger.postings.regenerated").increment(1);
        self.store.entries_derived_from(primary.id).await
    }

    /// Freeze a party's live entries into a Monday Final checkpoint.
    ///
    /// With nothing live to freeze this returns the latest prior settlement
    /// unchanged. A concurrent settle surfaces as a store conflict; the
    /// call re-reads state and retries once, which converges on the
    /// winner's settlement.
    pub async fn settle_party(
        &self,
        user_id: Uuid,
        party_name: &str,
    ) -> Result<Settlement, LedgerError> {
        let party = self.store.party(user_id, party_name).await?;

        let mut retried = false;
        loop {
            let entries = self.store.list_entries(user_id, Some(party_name)).await?;
            let settlements = self
                .store
                .list_settlements(user_id, Some(party_name))
                .await?;
            let (unsettled, _) = balance::partition(entries);

            if unsettled.is_empty() {
                return match settlement::latest(&settlements) {
                    Some(prior) => Ok(prior.clone()),
                    None => Err(LedgerError::NothingToSettle(party.name.clone())),
                };
            }

            let seed = settlement::seed_balance(&settlements);
            let prep = settlement::prepare(
                user_id,
                party_name,
                Utc::now().date_naive(),
                seed,
                &unsettled,
            );

            let mut plan = ExecutionPlan::new();
            plan.add(Operation::CreateSettlement {
                settlement: prep.settlement.clone(),
                entry: prep.entry.clone(),
                links: prep.links.clone(),
            });

            match self.execute(&plan).await {
                Ok(()) => {
                    counter!("ledger.settlements.total", "status" => "created").increment(1);
                    info!(
                        user = %user_id,
                        party = party_name,
                        balance = prep.settlement.balance,
                        frozen = prep.links.len(),
                        "settled party"
                    );
                    return self.store.settlement(prep.settlement.id).await;
                }
                Err(LedgerError::Conflict(msg)) if !retried => {
                    retried = true;
                    warn!(user = %user_id, party = party_name, %msg, "settle conflict, retrying");
                    continue;
                }
                Err(e) => {
                    counter!("ledger.settlements.total", "status" => "failed").increment(1);
                    return Err(e);
                }
            }
        }
    }

    /// A party's live position: frozen opening seed, running balances,
    /// closing balance.
    pub async fn statement(
        &self,
        user_id: Uuid,
        party_name: &str,
    ) -> Result<PartyStatement, LedgerError> {
        self.store.party(user_id, party_name).await?;

        let entries = self.store.list_entries(user_id, Some(party_name)).await?;
        let settlements = self
            .store
            .list_settlements(user_id, Some(party_name))
            .await?;
        let (unsettled, _) = balance::partition(entries);
        let seed = settlement::seed_balance(&settlements);

        Ok(PartyStatement::build(party_name, seed, unsettled))
    }

    /// Cross-party trial balance. A non-zero difference is reported, never
    /// corrected here.
    pub async fn trial_balance(&self, user_id: Uuid) -> Result<TrialBalance, LedgerError> {
        let config = self.store.book_config(user_id).await?;
        let entries = self.store.list_entries(user_id, None).await?;
        let report = trial_balance::aggregate(&entries, &config.company_name);

        if !report.is_balanced() {
            warn!(user = %user_id, difference = report.difference, "trial balance out of balance");
            counter!("ledger.trial_balance.imbalanced").increment(1);
        }
        Ok(report)
    }

    /// Read-only reconciliation sweep over one party or the whole book.
    pub async fn run_diagnostics(
        &self,
        user_id: Uuid,
        party: Option<&str>,
    ) -> Result<DiagnosticsReport, LedgerError> {
        let entries = self.store.list_entries(user_id, party).await?;
        let settlements = self.store.list_settlements(user_id, party).await?;
        let report = diagnostics::sweep(&entries, &settlements);

        if !report.is_clean() {
            warn!(
                user = %user_id,
                orphans = report.orphans.len(),
                dangling = report.dangling_settlements.len(),
                stale = report.stale_unsettled.len(),
                "reconciliation findings"
            );
        }
        Ok(report)
    }

    /// Delete a live primary entry together with everything derived from
    /// it. Frozen entries are immutable; derived entries go with their
    /// primary, never alone.
    pub async fn void_posting(&self, user_id: Uuid, entry_id: Uuid) -> Result<(), LedgerError> {
        let primary = self.store.entry(entry_id).await?;
        if primary.user_id != user_id {
            return Err(LedgerError::EntryNotFound(entry_id));
        }
        if primary.derived_from.is_some() {
            return Err(LedgerError::DerivedEntry(entry_id));
        }
        if primary.settled {
            return Err(LedgerError::SettledEntryImmutable(entry_id));
        }

        let derived = self.store.entries_derived_from(entry_id).await?;
        if let Some(frozen) = derived.iter().find(|d| d.settled) {
            return Err(LedgerError::SettledEntryImmutable(frozen.id));
        }

        let mut parties: Vec<String> = vec![primary.party.clone()];
        for entry in &derived {
            if !parties.contains(&entry.party) {
                parties.push(entry.party.clone());
            }
        }
        let mut ids = vec![primary.id];
        ids.extend(derived.iter().map(|d| d.id));

        let mut plan = ExecutionPlan::new();
        plan.add(Operation::DeleteEntries {
            user_id,
            parties,
            ids,
        });
        self.execute(&plan).await?;

        counter!("ledger.postings.voided").increment(1);
        info!(user = %user_id, entry = %entry_id, cascade = derived.len(), "voided posting");
        Ok(())
    }

    pub async fn upsert_party(&self, party: Party) -> Result<Party, LedgerError> {
        let mut plan = ExecutionPlan::new();
        plan.add(Operation::UpsertParty {
            party: party.clone(),
        });
        self.execute(&plan).await?;
        self.store.party(party.user_id, &party.name).await
    }

    /// Soft-deactivate a party, preserving its ledger history.
    pub async fn deactivate_party(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Party, LedgerError> {
        let mut party = self.store.party(user_id, name).await?;
        party.active = false;

        let mut plan = ExecutionPlan::new();
        plan.add(Operation::UpsertParty {
            party: party.clone(),
        });
        self.execute(&plan).await?;
        self.store.party(user_id, name).await
    }

    /// Physically remove a party. Refused while any entry references it;
    /// deactivate instead.
    pub async fn remove_party(&self, user_id: Uuid, name: &str) -> Result<(), LedgerError> {
        self.store.party(user_id, name).await?;

        let entries = self.store.list_entries(user_id, Some(name)).await?;
        if !entries.is_empty() {
            return Err(LedgerError::PartyHasEntries(name.to_string()));
        }

        let mut plan = ExecutionPlan::new();
        plan.add(Operation::DeleteParty {
            user_id,
            name: name.to_string(),
        });
        self.execute(&plan).await
    }

    pub async fn set_book_config(&self, config: BookConfig) -> Result<(), LedgerError> {
        self.store.set_book_config(config).await
    }

    /// Administrative repair of broken settlement links: orphaned entries
    /// revert to live, stale live entries are linked under their party's
    /// latest settlement. Dangling settlement records are left for the
    /// operator; fabricating references would hide the defect. Every pass
    /// is logged as an audit action.
    pub async fn repair(
        &self,
        user_id: Uuid,
        party: Option<&str>,
    ) -> Result<RepairReport, LedgerError> {
        let entries = self.store.list_entries(user_id, party).await?;
        let settlements = self.store.list_settlements(user_id, party).await?;
        let report = diagnostics::sweep(&entries, &settlements);

        if report.orphans.is_empty() && report.stale_unsettled.is_empty() {
            return Ok(RepairReport::default());
        }

        let mut per_party: BTreeMap<String, Vec<EntryRelink>> = BTreeMap::new();
        for orphan in &report.orphans {
            per_party
                .entry(orphan.party.clone())
                .or_default()
                .push(EntryRelink {
                    entry_id: orphan.entry_id,
                    settled: false,
                    settlement_id: None,
                    balance_snapshot: None,
                });
        }
        for stale in &report.stale_unsettled {
            per_party
                .entry(stale.party.clone())
                .or_default()
                .push(EntryRelink {
                    entry_id: stale.entry_id,
                    settled: true,
                    settlement_id: Some(stale.settlement_id),
                    balance_snapshot: None,
                });
        }

        let mut plan = ExecutionPlan::new();
        for (party, updates) in per_party {
            plan.add(Operation::RelinkEntries {
                user_id,
                party,
                updates,
            });
        }
        self.execute(&plan).await?;

        let repaired = RepairReport {
            reverted_orphans: report.orphans.len(),
            relinked_stale: report.stale_unsettled.len(),
        };
        counter!("ledger.repairs.total")
            .increment((repaired.reverted_orphans + repaired.relinked_stale) as u64);
        info!(
            user = %user_id,
            reverted = repaired.reverted_orphans,
            relinked = repaired.relinked_stale,
            "administrative repair applied"
        );
        Ok(repaired)
    }
}
