// src/generator.rs
//! Derivation of virtual entries from a primary posting.
//!
//! Every regular posting is offset by a company counter-entry, and the
//! `Take`/`Give` pair additionally mirrors onto its counterpart (which gets
//! its own company offset). Commission is posted one-sided to the reserved
//! commission party. Derived entries carry `derived_from`, so re-running
//! generation and cascade deletion are exact, never heuristic.

use crate::config::BookConfig;
use crate::entry::{EntryKind, LedgerEntry};
use crate::party::{COMMISSION_PARTY, Party, mirror_counterpart};

/// Commission rate for a posting: the party override wins, the book
/// default otherwise.
pub fn commission_rate_bps(party: &Party, config: &BookConfig) -> u32 {
    party
        .commission_rate_bps
        .unwrap_or(config.default_commission_rate_bps)
}

/// Commission amount in minor units, truncating basis-point math.
pub fn commission_amount(amount: i64, rate_bps: u32) -> i64 {
    amount * rate_bps as i64 / 10_000
}

/// Derive the virtual entries for a primary posting.
///
/// Returns nothing when the posting's party is reserved (commission or
/// company account) or the posting is itself derived or a settlement;
/// derived entries never recurse.
pub fn derive_entries(
    primary: &LedgerEntry,
    primary_party: &Party,
    config: &BookConfig,
) -> Vec<LedgerEntry> {
    if !primary_party.kind.is_regular() || primary.kind != EntryKind::Regular {
        return Vec::new();
    }

    let mut derived = Vec::new();

    let rate = commission_rate_bps(primary_party, config);
    let commission = commission_amount(primary.amount, rate);
    if commission > 0 {
        derived.push(LedgerEntry::derived(
            primary,
            EntryKind::Commission,
            COMMISSION_PARTY,
            primary.entry_type,
            commission,
            COMMISSION_PARTY,
        ));
    }

    derived.push(LedgerEntry::derived(
        primary,
        EntryKind::Company,
        config.company_name.clone(),
        primary.entry_type.opposite(),
        primary.amount,
        format!("Transaction with {}", primary.party),
    ));

    if let Some(counterpart) = mirror_counterpart(&primary.party) {
        derived.push(LedgerEntry::derived(
            primary,
            EntryKind::Mirror,
            counterpart,
            primary.entry_type.opposite(),
            primary.amount,
            format!("{}({})", primary.party, primary.remarks),
        ));
        // The mirror is a regular posting on its own party and gets the
        // same company offset as any other.
        derived.push(LedgerEntry::derived(
            primary,
            EntryKind::Company,
            config.company_name.clone(),
            primary.entry_type,
            primary.amount,
            format!("Transaction with {}", counterpart),
        ));
    }

    derived
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryType;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn date() -> NaiveDate {
        "2025-03-03".parse().unwrap()
    }

    fn setup(party_name: &str) -> (LedgerEntry, Party, BookConfig) {
        let user = Uuid::now_v7();
        let primary = LedgerEntry::new(
            user,
            party_name,
            EntryType::Credit,
            100_000,
            date(),
            "week 10",
        );
        let party = Party::new(user, party_name);
        let config = BookConfig::new(user, "Sharma & Sons");
        (primary, party, config)
    }

    #[test]
    fn test_commission_and_company_for_regular_posting() {
        let (primary, party, config) = setup("Alpha");
        let derived = derive_entries(&primary, &party, &config);

        assert_eq!(derived.len(), 2);

        let commission = &derived[0];
        assert_eq!(commission.kind, EntryKind::Commission);
        assert_eq!(commission.party, COMMISSION_PARTY);
        assert_eq!(commission.entry_type, EntryType::Credit);
        assert_eq!(commission.amount, 3_000);
        assert_eq!(commission.derived_from, Some(primary.id));
        assert_eq!(commission.date, primary.date);

        let company = &derived[1];
        assert_eq!(company.kind, EntryKind::Company);
        assert_eq!(company.party, "Sharma & Sons");
        assert_eq!(company.entry_type, EntryType::Debit);
        assert_eq!(company.amount, 100_000);
        assert_eq!(company.remarks, "Transaction with Alpha");
    }

    #[test]
    fn test_party_rate_override_wins() {
        let (primary, party, config) = setup("Alpha");
        let party = party.with_commission_rate(500);

        let derived = derive_entries(&primary, &party, &config);
        assert_eq!(derived[0].amount, 5_000);
    }

    #[test]
    fn test_zero_rate_suppresses_commission() {
        let (primary, party, config) = setup("Alpha");
        let party = party.with_commission_rate(0);

        let derived = derive_entries(&primary, &party, &config);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].kind, EntryKind::Company);
    }

    #[test]
    fn test_reserved_party_skips_generation() {
        let (primary, _, config) = setup(COMMISSION_PARTY);
        let party = Party::commission(primary.user_id);
        assert!(derive_entries(&primary, &party, &config).is_empty());

        let (primary, _, config) = setup("Sharma & Sons");
        let party = Party::company(primary.user_id, "Sharma & Sons");
        assert!(derive_entries(&primary, &party, &config).is_empty());
    }

    #[test]
    fn test_derived_primary_skips_generation() {
        let (primary, party, config) = setup("Alpha");
        let company = LedgerEntry::derived(
            &primary,
            EntryKind::Company,
            "Sharma & Sons",
            EntryType::Debit,
            100_000,
            "Transaction with Alpha",
        );
        assert!(derive_entries(&company, &party, &config).is_empty());
    }

    #[test]
    fn test_mirror_pair_gets_counterpart_and_offsets() {
        let (primary, party, config) = setup("Take");
        let derived = derive_entries(&primary, &party, &config);

        // commission + company + mirror + mirror's company offset
        assert_eq!(derived.len(), 4);

        let mirror = derived.iter().find(|e| e.kind == EntryKind::Mirror).unwrap();
        assert_eq!(mirror.party, "Give");
        assert_eq!(mirror.entry_type, EntryType::Debit);
        assert_eq!(mirror.amount, 100_000);
        assert_eq!(mirror.remarks, "Take(week 10)");

        // The two company offsets cancel each other exactly.
        let company_net: i64 = derived
            .iter()
            .filter(|e| e.kind == EntryKind::Company)
            .map(|e| e.signed_amount())
            .sum();
        assert_eq!(company_net, 0);
    }

    #[test]
    fn test_commission_truncates() {
        assert_eq!(commission_amount(100_000, 300), 3_000);
        assert_eq!(commission_amount(33, 300), 0);
        assert_eq!(commission_amount(3_333, 300), 99);
    }
}
