// src/adapters/memory.rs
use crate::config::DEFAULT_COMPANY_NAME;
use crate::{
    BookConfig, ExecutionPlan, LedgerEntry, LedgerError, LedgerStore, Operation, Party,
    PartyScope, Settlement,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    entries: HashMap<Uuid, LedgerEntry>,
    settlements: HashMap<Uuid, Settlement>,
    parties: HashMap<(Uuid, String), Party>,
    configs: HashMap<Uuid, BookConfig>,
    idempotency: HashMap<String, Uuid>,
    next_sequence: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn insert_entry(&mut self, mut entry: LedgerEntry) {
        entry.sequence = self.next_seq();
        if let Some(key) = &entry.idempotency_key {
            self.idempotency.insert(key.clone(), entry.id);
        }
        // A fresh live entry reopens the party.
        if !entry.settled {
            if let Some(party) = self
                .parties
                .get_mut(&(entry.user_id, entry.party.clone()))
            {
                party.settled = false;
            }
        }
        self.entries.insert(entry.id, entry);
    }

    fn upsert_party(&mut self, party: Party) {
        let key = (party.user_id, party.name.clone());
        match self.parties.get_mut(&key) {
            Some(existing) => {
                let id = existing.id;
                let created_at = existing.created_at;
                *existing = Party {
                    id,
                    created_at,
                    ..party
                };
            }
            None => {
                self.parties.insert(key, party);
            }
        }
    }
}

/// In-memory store for tests and embedding. A single table lock makes plan
/// application atomic and serializes every party scope.
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        _scopes: &[PartyScope],
    ) -> Result<(), LedgerError> {
        let mut tables = self.tables.lock().unwrap();

        // Phase 1: verify every precondition before the first write, so a
        // failing plan leaves the tables untouched.
        for op in plan.operations() {
            match op {
                Operation::InsertEntry { entry } => {
                    if let Some(key) = &entry.idempotency_key {
                        if let Some(existing) = tables.idempotency.get(key) {
                            return Err(LedgerError::DuplicatePosting(*existing));
                        }
                    }
                }
                Operation::CreateSettlement { links, .. } => {
                    for link in links {
                        match tables.entries.get(&link.entry_id) {
                            Some(entry) if !entry.settled => {}
                            Some(entry) => {
                                return Err(LedgerError::Conflict(format!(
                                    "entry {} already settled",
                                    entry.id
                                )));
                            }
                            None => return Err(LedgerError::EntryNotFound(link.entry_id)),
                        }
                    }
                }
                Operation::DeleteEntries { ids, .. } => {
                    for id in ids {
                        match tables.entries.get(id) {
                            Some(entry) if entry.settled => {
                                return Err(LedgerError::SettledEntryImmutable(*id));
                            }
                            Some(_) => {}
                            None => return Err(LedgerError::EntryNotFound(*id)),
                        }
                    }
                }
                Operation::DeleteParty { user_id, name } => {
                    let referenced = tables
                        .entries
                        .values()
                        .any(|e| e.user_id == *user_id && e.party == *name);
                    if referenced {
                        return Err(LedgerError::PartyHasEntries(name.clone()));
                    }
                }
                Operation::RelinkEntries { updates, .. } => {
                    for update in updates {
                        if !tables.entries.contains_key(&update.entry_id) {
                            return Err(LedgerError::EntryNotFound(update.entry_id));
                        }
                    }
                }
                Operation::UpsertParty { .. } => {}
            }
        }

        // Phase 2: apply.
        for op in plan.operations() {
            match op {
                Operation::InsertEntry { entry } => {
                    tables.insert_entry(entry.clone());
                }
                Operation::UpsertParty { party } => {
                    tables.upsert_party(party.clone());
                }
                Operation::CreateSettlement {
                    settlement,
                    entry,
                    links,
                } => {
                    let mut settlement = settlement.clone();
                    settlement.sequence = tables.next_seq();
                    let settlement_id = settlement.id;
                    let scope = (settlement.user_id, settlement.party.clone());
                    tables.settlements.insert(settlement.id, settlement);

                    tables.insert_entry(entry.clone());

                    for link in links {
                        if let Some(entry) = tables.entries.get_mut(&link.entry_id) {
                            entry.settled = true;
                            entry.settlement_id = Some(settlement_id);
                            entry.balance_snapshot = Some(link.balance_snapshot);
                        }
                    }
                    if let Some(party) = tables.parties.get_mut(&scope) {
                        party.settled = true;
                    }
                }
                Operation::DeleteEntries { ids, .. } => {
                    for id in ids {
                        tables.entries.remove(id);
                    }
                    let Tables {
                        idempotency,
                        entries,
                        ..
                    } = &mut *tables;
                    idempotency.retain(|_, entry_id| entries.contains_key(entry_id));
                }
                Operation::DeleteParty { user_id, name } => {
                    tables.parties.remove(&(*user_id, name.clone()));
                }
                Operation::RelinkEntries { updates, .. } => {
                    for update in updates {
                        if let Some(entry) = tables.entries.get_mut(&update.entry_id) {
                            entry.settled = update.settled;
                            entry.settlement_id = update.settlement_id;
                            entry.balance_snapshot = update.balance_snapshot;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn list_entries(
        &self,
        user_id: Uuid,
        party: Option<&str>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let tables = self.tables.lock().unwrap();
        let mut entries: Vec<LedgerEntry> = tables
            .entries
            .values()
            .filter(|e| e.user_id == user_id && party.is_none_or(|p| e.party == p))
            .cloned()
            .collect();
        entries.sort_by(|a, b| (a.date, a.sequence).cmp(&(b.date, b.sequence)));
        Ok(entries)
    }

    async fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry, LedgerError> {
        let tables = self.tables.lock().unwrap();
        tables
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or(LedgerError::EntryNotFound(entry_id))
    }

    async fn entries_derived_from(
        &self,
        source_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let tables = self.tables.lock().unwrap();
        let mut entries: Vec<LedgerEntry> = tables
            .entries
            .values()
            .filter(|e| e.derived_from == Some(source_id))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn list_settlements(
        &self,
        user_id: Uuid,
        party: Option<&str>,
    ) -> Result<Vec<Settlement>, LedgerError> {
        let tables = self.tables.lock().unwrap();
        let mut settlements: Vec<Settlement> = tables
            .settlements
            .values()
            .filter(|s| s.user_id == user_id && party.is_none_or(|p| s.party == p))
            .cloned()
            .collect();
        settlements.sort_by(|a, b| (a.settled_on, a.sequence).cmp(&(b.settled_on, b.sequence)));
        Ok(settlements)
    }

    async fn settlement(&self, settlement_id: Uuid) -> Result<Settlement, LedgerError> {
        let tables = self.tables.lock().unwrap();
        tables
            .settlements
            .get(&settlement_id)
            .cloned()
            .ok_or(LedgerError::SettlementNotFound(settlement_id))
    }

    async fn list_parties(&self, user_id: Uuid) -> Result<Vec<Party>, LedgerError> {
        let tables = self.tables.lock().unwrap();
        let mut parties: Vec<Party> = tables
            .parties
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        parties.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(parties)
    }

    async fn party(&self, user_id: Uuid, name: &str) -> Result<Party, LedgerError> {
        let tables = self.tables.lock().unwrap();
        tables
            .parties
            .get(&(user_id, name.to_string()))
            .cloned()
            .ok_or_else(|| LedgerError::UnknownParty(name.to_string()))
    }

    async fn check_idempotency_key(&self, key: &str) -> Result<(), LedgerError> {
        let tables = self.tables.lock().unwrap();
        match tables.idempotency.get(key) {
            Some(entry_id) => Err(LedgerError::DuplicatePosting(*entry_id)),
            None => Ok(()),
        }
    }

    async fn book_config(&self, user_id: Uuid) -> Result<BookConfig, LedgerError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .configs
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| BookConfig::new(user_id, DEFAULT_COMPANY_NAME)))
    }

    async fn set_book_config(&self, config: BookConfig) -> Result<(), LedgerError> {
        let mut tables = self.tables.lock().unwrap();
        tables.configs.insert(config.user_id, config);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
