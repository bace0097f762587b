// src/adapters/postgres.rs
use crate::config::DEFAULT_COMPANY_NAME;
use crate::entry::{EntryKind, EntryType};
use crate::party::{CommissionMode, PartyKind};
use crate::settlement::EntryLink;
use crate::{
    BookConfig, EntryRelink, ExecutionPlan, LedgerEntry, LedgerError, LedgerStore, Operation,
    Party, PartyScope, Settlement,
};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

pub trait PostgresLedgerStore {
    fn get_pool(&self) -> sqlx::PgPool;
}

/// Ready-made store over a connection pool.
pub struct PgLedgerStore {
    pool: sqlx::PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

impl PostgresLedgerStore for PgLedgerStore {
    fn get_pool(&self) -> sqlx::PgPool {
        self.pool.clone()
    }
}

fn storage<E: std::fmt::Display>(e: E) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

#[async_trait::async_trait]
pub trait PostgresSchemaStore {
    /// Initialize the ledger schema. Call once per database before use.
    async fn init_ledger_schema(&self) -> Result<(), LedgerError>;
}

#[async_trait::async_trait]
impl<T> PostgresSchemaStore for T
where
    T: PostgresLedgerStore + Send + Sync,
{
    async fn init_ledger_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.get_pool().begin().await.map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS khata_parties (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('regular', 'commission', 'company')),
                commission_mode TEXT CHECK (commission_mode IN ('take', 'give')),
                commission_rate_bps INTEGER,
                settled BOOLEAN NOT NULL DEFAULT FALSE,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (user_id, name)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS khata_entries (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                party TEXT NOT NULL,
                entry_type TEXT NOT NULL CHECK (entry_type IN ('credit', 'debit')),
                amount BIGINT NOT NULL CHECK (amount >= 0),
                kind TEXT NOT NULL
                    CHECK (kind IN ('regular', 'commission', 'company', 'mirror', 'settlement')),
                date DATE NOT NULL,
                sequence BIGSERIAL,
                remarks TEXT NOT NULL,
                settled BOOLEAN NOT NULL,
                settlement_id UUID,
                balance_snapshot BIGINT,
                derived_from UUID,
                idempotency_key TEXT UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_user_party
            ON khata_entries(user_id, party)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_derived_from
            ON khata_entries(derived_from)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_settlement
            ON khata_entries(settlement_id)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS khata_settlements (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                party TEXT NOT NULL,
                settled_on DATE NOT NULL,
                balance BIGINT NOT NULL,
                entry_id UUID NOT NULL,
                sequence BIGSERIAL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_settlements_user_party
            ON khata_settlements(user_id, party)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS khata_book_configs (
                user_id UUID PRIMARY KEY,
                company_name TEXT NOT NULL,
                default_commission_rate_bps INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(())
    }
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    let entry_type: String = row.try_get("entry_type").map_err(storage)?;
    let kind: String = row.try_get("kind").map_err(storage)?;

    Ok(LedgerEntry {
        id: row.try_get("id").map_err(storage)?,
        user_id: row.try_get("user_id").map_err(storage)?,
        party: row.try_get("party").map_err(storage)?,
        entry_type: EntryType::parse(&entry_type)
            .ok_or_else(|| LedgerError::Storage(format!("bad entry_type: {}", entry_type)))?,
        amount: row.try_get("amount").map_err(storage)?,
        kind: EntryKind::parse(&kind)
            .ok_or_else(|| LedgerError::Storage(format!("bad entry kind: {}", kind)))?,
        date: row.try_get("date").map_err(storage)?,
        sequence: row.try_get::<i64, _>("sequence").map_err(storage)? as u64,
        remarks: row.try_get("remarks").map_err(storage)?,
        settled: row.try_get("settled").map_err(storage)?,
        settlement_id: row.try_get("settlement_id").map_err(storage)?,
        balance_snapshot: row.try_get("balance_snapshot").map_err(storage)?,
        derived_from: row.try_get("derived_from").map_err(storage)?,
        idempotency_key: row.try_get("idempotency_key").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

fn party_from_row(row: &PgRow) -> Result<Party, LedgerError> {
    let kind: String = row.try_get("kind").map_err(storage)?;
    let mode: Option<String> = row.try_get("commission_mode").map_err(storage)?;

    Ok(Party {
        id: row.try_get("id").map_err(storage)?,
        user_id: row.try_get("user_id").map_err(storage)?,
        name: row.try_get("name").map_err(storage)?,
        kind: PartyKind::parse(&kind)
            .ok_or_else(|| LedgerError::Storage(format!("bad party kind: {}", kind)))?,
        commission_mode: match mode {
            Some(m) => Some(
                CommissionMode::parse(&m)
                    .ok_or_else(|| LedgerError::Storage(format!("bad commission mode: {}", m)))?,
            ),
            None => None,
        },
        commission_rate_bps: row
            .try_get::<Option<i32>, _>("commission_rate_bps")
            .map_err(storage)?
            .map(|r| r as u32),
        settled: row.try_get("settled").map_err(storage)?,
        active: row.try_get("active").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

fn settlement_from_row(row: &PgRow) -> Result<Settlement, LedgerError> {
    Ok(Settlement {
        id: row.try_get("id").map_err(storage)?,
        user_id: row.try_get("user_id").map_err(storage)?,
        party: row.try_get("party").map_err(storage)?,
        settled_on: row.try_get("settled_on").map_err(storage)?,
        balance: row.try_get("balance").map_err(storage)?,
        entry_id: row.try_get("entry_id").map_err(storage)?,
        sequence: row.try_get::<i64, _>("sequence").map_err(storage)? as u64,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

#[async_trait::async_trait]
trait PostgresPlanStore {
    async fn insert_entry_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entry: &LedgerEntry,
    ) -> Result<(), LedgerError>;

    async fn upsert_party_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        party: &Party,
    ) -> Result<(), LedgerError>;

    async fn create_settlement_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        settlement: &Settlement,
        entry: &LedgerEntry,
        links: &[EntryLink],
    ) -> Result<(), LedgerError>;

    async fn delete_entries_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        ids: &[Uuid],
    ) -> Result<(), LedgerError>;

    async fn relink_entries_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        updates: &[EntryRelink],
    ) -> Result<(), LedgerError>;
}

#[async_trait::async_trait]
impl<T> PostgresPlanStore for T
where
    T: PostgresLedgerStore + Send + Sync,
{
    async fn insert_entry_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entry: &LedgerEntry,
    ) -> Result<(), LedgerError> {
        if let Some(key) = &entry.idempotency_key {
            let existing: Option<Uuid> =
                sqlx::query_scalar("SELECT id FROM khata_entries WHERE idempotency_key = $1")
                    .bind(key)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(storage)?;
            if let Some(id) = existing {
                return Err(LedgerError::DuplicatePosting(id));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO khata_entries
                (id, user_id, party, entry_type, amount, kind, date, remarks,
                 settled, settlement_id, balance_snapshot, derived_from,
                 idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(&entry.party)
        .bind(entry.entry_type.as_str())
        .bind(entry.amount)
        .bind(entry.kind.as_str())
        .bind(entry.date)
        .bind(&entry.remarks)
        .bind(entry.settled)
        .bind(entry.settlement_id)
        .bind(entry.balance_snapshot)
        .bind(entry.derived_from)
        .bind(&entry.idempotency_key)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;

        // A fresh live entry reopens the party.
        if !entry.settled {
            sqlx::query(
                "UPDATE khata_parties SET settled = FALSE WHERE user_id = $1 AND name = $2",
            )
            .bind(entry.user_id)
            .bind(&entry.party)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;
        }

        Ok(())
    }

    async fn upsert_party_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        party: &Party,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO khata_parties
                (id, user_id, name, kind, commission_mode, commission_rate_bps,
                 settled, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, name) DO UPDATE SET
                kind = EXCLUDED.kind,
                commission_mode = EXCLUDED.commission_mode,
                commission_rate_bps = EXCLUDED.commission_rate_bps,
                settled = EXCLUDED.settled,
                active = EXCLUDED.active
            "#,
        )
        .bind(party.id)
        .bind(party.user_id)
        .bind(&party.name)
        .bind(party.kind.as_str())
        .bind(party.commission_mode.map(|m| m.as_str()))
        .bind(party.commission_rate_bps.map(|r| r as i32))
        .bind(party.settled)
        .bind(party.active)
        .bind(party.created_at)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn create_settlement_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        settlement: &Settlement,
        entry: &LedgerEntry,
        links: &[EntryLink],
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO khata_settlements
                (id, user_id, party, settled_on, balance, entry_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(settlement.id)
        .bind(settlement.user_id)
        .bind(&settlement.party)
        .bind(settlement.settled_on)
        .bind(settlement.balance)
        .bind(settlement.entry_id)
        .bind(settlement.created_at)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;

        self.insert_entry_tx(tx, entry).await?;

        // Guarded per-row freeze: a target frozen by a concurrent
        // settlement surfaces as a conflict, aborting the whole plan.
        for link in links {
            let result = sqlx::query(
                r#"
                UPDATE khata_entries
                SET settled = TRUE, settlement_id = $2, balance_snapshot = $3
                WHERE id = $1 AND settled = FALSE
                "#,
            )
            .bind(link.entry_id)
            .bind(settlement.id)
            .bind(link.balance_snapshot)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;

            if result.rows_affected() == 0 {
                return Err(LedgerError::Conflict(format!(
                    "entry {} already settled",
                    link.entry_id
                )));
            }
        }

        sqlx::query("UPDATE khata_parties SET settled = TRUE WHERE user_id = $1 AND name = $2")
            .bind(settlement.user_id)
            .bind(&settlement.party)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;

        Ok(())
    }

    async fn delete_entries_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        ids: &[Uuid],
    ) -> Result<(), LedgerError> {
        for id in ids {
            let settled: Option<bool> =
                sqlx::query_scalar("SELECT settled FROM khata_entries WHERE id = $1 FOR UPDATE")
                    .bind(id)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(storage)?;

            match settled {
                Some(false) => {}
                Some(true) => return Err(LedgerError::SettledEntryImmutable(*id)),
                None => return Err(LedgerError::EntryNotFound(*id)),
            }

            sqlx::query("DELETE FROM khata_entries WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
        }

        Ok(())
    }

    async fn relink_entries_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        updates: &[EntryRelink],
    ) -> Result<(), LedgerError> {
        for update in updates {
            let result = sqlx::query(
                r#"
                UPDATE khata_entries
                SET settled = $2, settlement_id = $3, balance_snapshot = $4
                WHERE id = $1
                "#,
            )
            .bind(update.entry_id)
            .bind(update.settled)
            .bind(update.settlement_id)
            .bind(update.balance_snapshot)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;

            if result.rows_affected() == 0 {
                return Err(LedgerError::EntryNotFound(update.entry_id));
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl<T> LedgerStore for T
where
    T: PostgresLedgerStore + PostgresPlanStore + Send + Sync,
{
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        scopes: &[PartyScope],
    ) -> Result<(), LedgerError> {
        let mut tx = self.get_pool().begin().await.map_err(storage)?;

        // Serialize on every touched (user, party) pair. Scopes arrive
        // sorted, so lock acquisition order is deadlock-free across
        // concurrent plans and process instances.
        for scope in scopes {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("{}:{}", scope.user_id, scope.party))
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        for op in plan.operations() {
            let applied = match op {
                Operation::InsertEntry { entry } => self.insert_entry_tx(&mut tx, entry).await,
                Operation::UpsertParty { party } => self.upsert_party_tx(&mut tx, party).await,
                Operation::CreateSettlement {
                    settlement,
                    entry,
                    links,
                } => {
                    self.create_settlement_tx(&mut tx, settlement, entry, links)
                        .await
                }
                Operation::DeleteEntries { ids, .. } => self.delete_entries_tx(&mut tx, ids).await,
                Operation::DeleteParty { user_id, name } => {
                    let referenced: Option<Uuid> = sqlx::query_scalar(
                        "SELECT id FROM khata_entries WHERE user_id = $1 AND party = $2 LIMIT 1",
                    )
                    .bind(user_id)
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage)?;

                    if referenced.is_some() {
                        Err(LedgerError::PartyHasEntries(name.clone()))
                    } else {
                        sqlx::query("DELETE FROM khata_parties WHERE user_id = $1 AND name = $2")
                            .bind(user_id)
                            .bind(name)
                            .execute(&mut *tx)
                            .await
                            .map_err(storage)
                            .map(|_| ())
                    }
                }
                Operation::RelinkEntries { updates, .. } => {
                    self.relink_entries_tx(&mut tx, updates).await
                }
            };

            if let Err(e) = applied {
                tx.rollback().await.ok();
                return Err(e);
            }
        }

        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn list_entries(
        &self,
        user_id: Uuid,
        party: Option<&str>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = match party {
            Some(name) => {
                sqlx::query(
                    r#"
                    SELECT * FROM khata_entries
                    WHERE user_id = $1 AND party = $2
                    ORDER BY date ASC, sequence ASC
                    "#,
                )
                .bind(user_id)
                .bind(name)
                .fetch_all(&self.get_pool())
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM khata_entries
                    WHERE user_id = $1
                    ORDER BY date ASC, sequence ASC
                    "#,
                )
                .bind(user_id)
                .fetch_all(&self.get_pool())
                .await
            }
        }
        .map_err(storage)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry, LedgerError> {
        let row = sqlx::query("SELECT * FROM khata_entries WHERE id = $1")
            .bind(entry_id)
            .fetch_optional(&self.get_pool())
            .await
            .map_err(storage)?
            .ok_or(LedgerError::EntryNotFound(entry_id))?;

        entry_from_row(&row)
    }

    async fn entries_derived_from(
        &self,
        source_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM khata_entries WHERE derived_from = $1 ORDER BY sequence ASC",
        )
        .bind(source_id)
        .fetch_all(&self.get_pool())
        .await
        .map_err(storage)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn list_settlements(
        &self,
        user_id: Uuid,
        party: Option<&str>,
    ) -> Result<Vec<Settlement>, LedgerError> {
        let rows = match party {
            Some(name) => {
                sqlx::query(
                    r#"
                    SELECT * FROM khata_settlements
                    WHERE user_id = $1 AND party = $2
                    ORDER BY settled_on ASC, sequence ASC
                    "#,
                )
                .bind(user_id)
                .bind(name)
                .fetch_all(&self.get_pool())
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM khata_settlements
                    WHERE user_id = $1
                    ORDER BY settled_on ASC, sequence ASC
                    "#,
                )
                .bind(user_id)
                .fetch_all(&self.get_pool())
                .await
            }
        }
        .map_err(storage)?;

        rows.iter().map(settlement_from_row).collect()
    }

    async fn settlement(&self, settlement_id: Uuid) -> Result<Settlement, LedgerError> {
        let row = sqlx::query("SELECT * FROM khata_settlements WHERE id = $1")
            .bind(settlement_id)
            .fetch_optional(&self.get_pool())
            .await
            .map_err(storage)?
            .ok_or(LedgerError::SettlementNotFound(settlement_id))?;

        settlement_from_row(&row)
    }

    async fn list_parties(&self, user_id: Uuid) -> Result<Vec<Party>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM khata_parties WHERE user_id = $1 ORDER BY name ASC")
            .bind(user_id)
            .fetch_all(&self.get_pool())
            .await
            .map_err(storage)?;

        rows.iter().map(party_from_row).collect()
    }

    async fn party(&self, user_id: Uuid, name: &str) -> Result<Party, LedgerError> {
        let row = sqlx::query("SELECT * FROM khata_parties WHERE user_id = $1 AND name = $2")
            .bind(user_id)
            .bind(name)
            .fetch_optional(&self.get_pool())
            .await
            .map_err(storage)?
            .ok_or_else(|| LedgerError::UnknownParty(name.to_string()))?;

        party_from_row(&row)
    }

    async fn check_idempotency_key(&self, key: &str) -> Result<(), LedgerError> {
        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM khata_entries WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.get_pool())
                .await
                .map_err(storage)?;

        match existing {
            Some(id) => Err(LedgerError::DuplicatePosting(id)),
            None => Ok(()),
        }
    }

    async fn book_config(&self, user_id: Uuid) -> Result<BookConfig, LedgerError> {
        let row = sqlx::query("SELECT * FROM khata_book_configs WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.get_pool())
            .await
            .map_err(storage)?;

        match row {
            Some(row) => Ok(BookConfig {
                user_id: row.try_get("user_id").map_err(storage)?,
                company_name: row.try_get("company_name").map_err(storage)?,
                default_commission_rate_bps: row
                    .try_get::<i32, _>("default_commission_rate_bps")
                    .map_err(storage)? as u32,
            }),
            None => Ok(BookConfig::new(user_id, DEFAULT_COMPANY_NAME)),
        }
    }

    async fn set_book_config(&self, config: BookConfig) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO khata_book_configs (user_id, company_name, default_commission_rate_bps)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                company_name = EXCLUDED.company_name,
                default_commission_rate_bps = EXCLUDED.default_commission_rate_bps
            "#,
        )
        .bind(config.user_id)
        .bind(&config.company_name)
        .bind(config.default_commission_rate_bps as i32)
        .execute(&self.get_pool())
        .await
        .map_err(storage)?;

        Ok(())
    }
}
