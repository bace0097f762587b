// tests/integration_tests.rs
use chrono::NaiveDate;
use khata_ledger::{
    BookConfig, EntryKind, EntryRelink, EntryType, ExecutionPlan, LedgerContext, LedgerError,
    LedgerSystem, Operation, OrphanKind, Party, PartyKind, adapters::MemoryStore,
};
use std::sync::Arc;
use uuid::Uuid;

fn setup() -> (Arc<LedgerSystem>, LedgerContext, Uuid) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let store = Box::new(MemoryStore::new());
    let system = Arc::new(LedgerSystem::new(store));
    let ctx = LedgerContext::new(system.store_arc());
    let user = Uuid::now_v7();

    (system, ctx, user)
}

async fn seed_book(ctx: &LedgerContext, user: Uuid) {
    ctx.set_book_config(BookConfig::new(user, "Sharma & Sons"))
        .await
        .unwrap();
    ctx.upsert_party(Party::new(user, "Alpha")).await.unwrap();
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_posting_generates_commission_and_company() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let posting = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "week 10",
        )
        .await
        .unwrap();

    assert_eq!(posting.derived.len(), 2);
    assert!(posting.primary.sequence > 0);

    let alpha = ctx.statement(user, "Alpha").await.unwrap();
    let commission = ctx.statement(user, "Commission").await.unwrap();
    let company = ctx.statement(user, "Sharma & Sons").await.unwrap();

    assert_eq!(alpha.closing_balance, 100_000);
    assert_eq!(commission.closing_balance, 3_000);
    assert_eq!(company.closing_balance, -100_000);
}

#[tokio::test]
async fn test_posting_validation() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let zero = ctx
        .post_transaction(user, "Alpha", EntryType::Credit, 0, date("2025-03-03"), "")
        .await;
    assert!(matches!(zero, Err(LedgerError::InvalidAmount)));

    let negative = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Debit,
            -500,
            date("2025-03-03"),
            "",
        )
        .await;
    assert!(matches!(negative, Err(LedgerError::InvalidAmount)));

    let unknown = ctx
        .post_transaction(
            user,
            "Nobody",
            EntryType::Credit,
            100,
            date("2025-03-03"),
            "",
        )
        .await;
    assert!(matches!(unknown, Err(LedgerError::UnknownParty(_))));
}

#[tokio::test]
async fn test_reserved_parties_auto_created_with_kind() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();

    let commission = system.store().party(user, "Commission").await.unwrap();
    let company = system.store().party(user, "Sharma & Sons").await.unwrap();
    assert_eq!(commission.kind, PartyKind::Commission);
    assert_eq!(company.kind, PartyKind::Company);
}

#[tokio::test]
async fn test_mirror_pair_posting() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;
    ctx.upsert_party(Party::new(user, "Take")).await.unwrap();

    let posting = ctx
        .post_transaction(
            user,
            "Take",
            EntryType::Credit,
            40_000,
            date("2025-03-03"),
            "match day",
        )
        .await
        .unwrap();

    // commission + company + mirror + mirror's company offset
    assert_eq!(posting.derived.len(), 4);

    let give = ctx.statement(user, "Give").await.unwrap();
    assert_eq!(give.closing_balance, -40_000);

    let report = ctx.trial_balance(user).await.unwrap();
    assert!(report.is_balanced());
}

#[tokio::test]
async fn test_settlement_freezes_and_reseeds() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();

    let settlement = ctx.settle_party(user, "Alpha").await.unwrap();
    assert_eq!(settlement.balance, 100_000);

    // Every previously-live entry is frozen under the new settlement.
    let entries = system
        .store()
        .list_entries(user, Some("Alpha"))
        .await
        .unwrap();
    assert!(entries.iter().all(|e| e.settled));
    assert!(
        entries
            .iter()
            .all(|e| e.settlement_id == Some(settlement.id))
    );

    // The next posting reopens the party, seeded by the frozen balance.
    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        20_000,
        date("2025-03-11"),
        "",
    )
    .await
    .unwrap();

    let statement = ctx.statement(user, "Alpha").await.unwrap();
    assert_eq!(statement.opening_balance, 100_000);
    assert_eq!(statement.closing_balance, 120_000);
    assert_eq!(statement.lines.len(), 1);
}

#[tokio::test]
async fn test_settle_is_idempotent() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();

    let first = ctx.settle_party(user, "Alpha").await.unwrap();
    let second = ctx.settle_party(user, "Alpha").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.balance, second.balance);

    let settlements = system
        .store()
        .list_settlements(user, Some("Alpha"))
        .await
        .unwrap();
    assert_eq!(settlements.len(), 1);
}

#[tokio::test]
async fn test_settle_without_history_errors() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let result = ctx.settle_party(user, "Alpha").await;
    assert!(matches!(result, Err(LedgerError::NothingToSettle(_))));
}

#[tokio::test]
async fn test_settlement_chain_seeds_chronologically() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();
    let first = ctx.settle_party(user, "Alpha").await.unwrap();
    assert_eq!(first.balance, 100_000);

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Debit,
        30_000,
        date("2025-03-10"),
        "",
    )
    .await
    .unwrap();
    let second = ctx.settle_party(user, "Alpha").await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(second.balance, 70_000);

    let settlements = system
        .store()
        .list_settlements(user, Some("Alpha"))
        .await
        .unwrap();
    assert_eq!(settlements.len(), 2);
}

#[tokio::test]
async fn test_concurrent_settles_converge_on_one_settlement() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();

    let (a, b) = tokio::join!(
        ctx.settle_party(user, "Alpha"),
        ctx.settle_party(user, "Alpha")
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.id, b.id);
    let settlements = system
        .store()
        .list_settlements(user, Some("Alpha"))
        .await
        .unwrap();
    assert_eq!(settlements.len(), 1);
}

#[tokio::test]
async fn test_refreezing_a_settled_entry_conflicts() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let posting = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "",
        )
        .await
        .unwrap();
    ctx.settle_party(user, "Alpha").await.unwrap();

    // A stale plan still pointing at the already-frozen entry must abort.
    let prep = khata_ledger::settlement::prepare(
        user,
        "Alpha",
        date("2025-03-10"),
        0,
        std::slice::from_ref(&posting.primary),
    );
    let mut plan = ExecutionPlan::new();
    plan.add(Operation::CreateSettlement {
        settlement: prep.settlement.clone(),
        entry: prep.entry.clone(),
        links: prep.links.clone(),
    });

    let scopes = plan.party_scopes();
    let result = system.store().execute_plan(&plan, &scopes).await;
    assert!(matches!(result, Err(LedgerError::Conflict(_))));

    let settlements = system
        .store()
        .list_settlements(user, Some("Alpha"))
        .await
        .unwrap();
    assert_eq!(settlements.len(), 1);
}

#[tokio::test]
async fn test_trial_balance_is_exact_across_parties_and_settlements() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;
    ctx.upsert_party(Party::new(user, "Beta")).await.unwrap();

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();
    ctx.post_transaction(
        user,
        "Beta",
        EntryType::Debit,
        50_000,
        date("2025-03-04"),
        "",
    )
    .await
    .unwrap();

    let report = ctx.trial_balance(user).await.unwrap();
    assert_eq!(report.credit_total, 100_000);
    assert_eq!(report.debit_total, 100_000);
    assert_eq!(report.difference, 0);

    let alpha = report.parties.iter().find(|p| p.party == "Alpha").unwrap();
    assert_eq!(alpha.balance, 100_000);
    assert_eq!(alpha.entry_count, 1);

    // Settling must not disturb the identity: checkpoints are excluded.
    ctx.settle_party(user, "Alpha").await.unwrap();
    let report = ctx.trial_balance(user).await.unwrap();
    assert_eq!(report.difference, 0);
}

#[tokio::test]
async fn test_trial_balance_surfaces_imbalance() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;
    ctx.upsert_party(Party::company(user, "Sharma & Sons"))
        .await
        .unwrap();

    // Direct posting on the company account has no counter-entry.
    ctx.post_transaction(
        user,
        "Sharma & Sons",
        EntryType::Credit,
        10_000,
        date("2025-03-03"),
        "opening adjustment",
    )
    .await
    .unwrap();

    let report = ctx.trial_balance(user).await.unwrap();
    assert_eq!(report.difference, 10_000);
    assert!(!report.is_balanced());
}

#[tokio::test]
async fn test_void_posting_cascades_to_derived_entries() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let posting = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "",
        )
        .await
        .unwrap();
    assert_eq!(
        system.store().list_entries(user, None).await.unwrap().len(),
        3
    );

    ctx.void_posting(user, posting.primary.id).await.unwrap();

    assert!(system.store().list_entries(user, None).await.unwrap().is_empty());
    let commission = ctx.statement(user, "Commission").await.unwrap();
    assert_eq!(commission.closing_balance, 0);
}

#[tokio::test]
async fn test_void_rejects_frozen_and_derived_entries() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let posting = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "",
        )
        .await
        .unwrap();

    let derived_id = posting.derived[0].id;
    assert!(matches!(
        ctx.void_posting(user, derived_id).await,
        Err(LedgerError::DerivedEntry(_))
    ));

    ctx.settle_party(user, "Alpha").await.unwrap();
    assert!(matches!(
        ctx.void_posting(user, posting.primary.id).await,
        Err(LedgerError::SettledEntryImmutable(_))
    ));
}

#[tokio::test]
async fn test_idempotent_posting_rejects_replay() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let first = ctx
        .post_transaction_idempotent(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "week 10",
            "alpha-week-10",
        )
        .await
        .unwrap();

    let replay = ctx
        .post_transaction_idempotent(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "week 10",
            "alpha-week-10",
        )
        .await;

    match replay {
        Err(LedgerError::DuplicatePosting(id)) => assert_eq!(id, first.primary.id),
        other => panic!("expected duplicate posting, got {:?}", other.map(|p| p.primary.id)),
    }
}

#[tokio::test]
async fn test_regenerate_derived_is_idempotent() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let posting = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "",
        )
        .await
        .unwrap();

    let regenerated = ctx
        .regenerate_derived(user, posting.primary.id)
        .await
        .unwrap();
    assert_eq!(regenerated.len(), 2);
    assert_eq!(
        system.store().list_entries(user, None).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn test_regenerate_backfills_a_bare_primary() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    // A primary inserted without its derived batch, as pre-migration data
    // would look.
    let bare = khata_ledger::LedgerEntry::new(
        user,
        "Alpha",
        EntryType::Credit,
        50_000,
        date("2025-03-03"),
        "imported",
    );
    let mut plan = ExecutionPlan::new();
    plan.add(Operation::InsertEntry {
        entry: bare.clone(),
    });
    let scopes = plan.party_scopes();
    system.store().execute_plan(&plan, &scopes).await.unwrap();

    let derived = ctx.regenerate_derived(user, bare.id).await.unwrap();
    assert_eq!(derived.len(), 2);
    assert!(derived.iter().all(|d| d.derived_from == Some(bare.id)));
    assert!(derived.iter().any(|d| d.kind == EntryKind::Commission));
}

#[tokio::test]
async fn test_diagnostics_reports_exactly_one_orphan() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let posting = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "",
        )
        .await
        .unwrap();
    ctx.settle_party(user, "Alpha").await.unwrap();

    let report = ctx.run_diagnostics(user, Some("Alpha")).await.unwrap();
    assert!(report.is_clean());

    // Flip the frozen entry's link to a settlement that does not exist.
    let bogus = Uuid::now_v7();
    let mut plan = ExecutionPlan::new();
    plan.add(Operation::RelinkEntries {
        user_id: user,
        party: "Alpha".to_string(),
        updates: vec![EntryRelink {
            entry_id: posting.primary.id,
            settled: true,
            settlement_id: Some(bogus),
            balance_snapshot: None,
        }],
    });
    let scopes = plan.party_scopes();
    system.store().execute_plan(&plan, &scopes).await.unwrap();

    let report = ctx.run_diagnostics(user, Some("Alpha")).await.unwrap();
    assert_eq!(report.orphans.len(), 1);
    assert_eq!(report.orphans[0].entry_id, posting.primary.id);
    assert_eq!(report.orphans[0].kind, OrphanKind::MissingSettlement(bogus));
    assert!(report.dangling_settlements.is_empty());
    assert!(report.stale_unsettled.is_empty());
}

#[tokio::test]
async fn test_repair_converges_to_a_clean_book() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let posting = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "",
        )
        .await
        .unwrap();
    let settlement = ctx.settle_party(user, "Alpha").await.unwrap();

    let mut plan = ExecutionPlan::new();
    plan.add(Operation::RelinkEntries {
        user_id: user,
        party: "Alpha".to_string(),
        updates: vec![EntryRelink {
            entry_id: posting.primary.id,
            settled: true,
            settlement_id: Some(Uuid::now_v7()),
            balance_snapshot: None,
        }],
    });
    let scopes = plan.party_scopes();
    system.store().execute_plan(&plan, &scopes).await.unwrap();

    // First pass reverts the orphan to live; the revived entry now
    // predates the settlement, so a second pass re-freezes it under the
    // real checkpoint.
    let first = ctx.repair(user, Some("Alpha")).await.unwrap();
    assert_eq!(first.reverted_orphans, 1);

    let second = ctx.repair(user, Some("Alpha")).await.unwrap();
    assert_eq!(second.relinked_stale, 1);

    let report = ctx.run_diagnostics(user, Some("Alpha")).await.unwrap();
    assert!(report.is_clean(), "findings remain: {:?}", report);

    let entry = system.store().entry(posting.primary.id).await.unwrap();
    assert!(entry.settled);
    assert_eq!(entry.settlement_id, Some(settlement.id));
}

#[tokio::test]
async fn test_party_removal_is_refused_while_history_exists() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();

    assert!(matches!(
        ctx.remove_party(user, "Alpha").await,
        Err(LedgerError::PartyHasEntries(_))
    ));

    let deactivated = ctx.deactivate_party(user, "Alpha").await.unwrap();
    assert!(!deactivated.active);

    // History survives, new postings are refused.
    let statement = ctx.statement(user, "Alpha").await.unwrap();
    assert_eq!(statement.closing_balance, 100_000);
    assert!(matches!(
        ctx.post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100,
            date("2025-03-04"),
            ""
        )
        .await,
        Err(LedgerError::InactiveParty(_))
    ));

    // A party with no entries can still be removed outright.
    ctx.upsert_party(Party::new(user, "Temp")).await.unwrap();
    ctx.remove_party(user, "Temp").await.unwrap();
    assert!(matches!(
        ctx.statement(user, "Temp").await,
        Err(LedgerError::UnknownParty(_))
    ));
}

#[tokio::test]
async fn test_every_write_invalidates_touched_party_scopes() {
    use khata_ledger::CacheInvalidator;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        scopes: Mutex<Vec<String>>,
    }

    impl CacheInvalidator for Recorder {
        fn invalidate(&self, _user_id: Uuid, party: &str) {
            self.scopes.lock().unwrap().push(party.to_string());
        }
    }

    let (_, ctx, user) = setup();
    let recorder = Arc::new(Recorder::default());
    let ctx = ctx.with_invalidator(recorder.clone());
    seed_book(&ctx, user).await;

    recorder.scopes.lock().unwrap().clear();
    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();

    let mut scopes = recorder.scopes.lock().unwrap().clone();
    scopes.sort();
    assert_eq!(scopes, vec!["Alpha", "Commission", "Sharma & Sons"]);

    recorder.scopes.lock().unwrap().clear();
    ctx.settle_party(user, "Alpha").await.unwrap();
    assert_eq!(recorder.scopes.lock().unwrap().as_slice(), ["Alpha"]);
}

#[tokio::test]
async fn test_empty_statement_closes_at_zero() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;

    let statement = ctx.statement(user, "Alpha").await.unwrap();
    assert_eq!(statement.opening_balance, 0);
    assert_eq!(statement.closing_balance, 0);
    assert!(statement.is_empty());
}

#[tokio::test]
async fn test_settlement_records_balance_snapshots() {
    let (system, ctx, user) = setup();
    seed_book(&ctx, user).await;

    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Credit,
        100_000,
        date("2025-03-03"),
        "",
    )
    .await
    .unwrap();
    ctx.post_transaction(
        user,
        "Alpha",
        EntryType::Debit,
        40_000,
        date("2025-03-05"),
        "",
    )
    .await
    .unwrap();

    let settlement = ctx.settle_party(user, "Alpha").await.unwrap();
    assert_eq!(settlement.balance, 60_000);

    let entries = system
        .store()
        .list_entries(user, Some("Alpha"))
        .await
        .unwrap();
    let snapshots: Vec<i64> = entries
        .iter()
        .filter(|e| !e.is_settlement())
        .map(|e| e.balance_snapshot.unwrap())
        .collect();
    assert_eq!(snapshots, vec![100_000, 60_000]);

    let checkpoint = entries.iter().find(|e| e.is_settlement()).unwrap();
    assert_eq!(checkpoint.balance_snapshot, Some(60_000));
    assert_eq!(checkpoint.settlement_id, Some(settlement.id));
}

#[tokio::test]
async fn test_book_default_rate_is_configurable() {
    let (_, ctx, user) = setup();
    ctx.set_book_config(BookConfig::new(user, "Sharma & Sons").with_commission_rate(200))
        .await
        .unwrap();
    ctx.upsert_party(Party::new(user, "Alpha")).await.unwrap();

    let posting = ctx
        .post_transaction(
            user,
            "Alpha",
            EntryType::Credit,
            100_000,
            date("2025-03-03"),
            "",
        )
        .await
        .unwrap();

    let commission = posting
        .derived
        .iter()
        .find(|e| e.kind == EntryKind::Commission)
        .unwrap();
    assert_eq!(commission.amount, 2_000);
}

#[tokio::test]
async fn test_per_party_commission_override() {
    let (_, ctx, user) = setup();
    seed_book(&ctx, user).await;
    ctx.upsert_party(Party::new(user, "Beta").with_commission_rate(500))
        .await
        .unwrap();

    let posting = ctx
        .post_transaction(
            user,
            "Beta",
            EntryType::Debit,
            100_000,
            date("2025-03-03"),
            "",
        )
        .await
        .unwrap();

    let commission = posting
        .derived
        .iter()
        .find(|e| e.kind == EntryKind::Commission)
        .unwrap();
    assert_eq!(commission.amount, 5_000);
    assert_eq!(commission.entry_type, EntryType::Debit);
}
