// src/diagnostics.rs
//! Read-only reconciliation sweep over settlement links.
//!
//! Findings describe pre-existing data, so nothing here raises: the sweep
//! reports, and repair is a separate administrator-invoked operation on the
//! context.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entry::LedgerEntry;
use crate::settlement::Settlement;

fn latest_of<'a>(group: &[&'a Settlement]) -> Option<&'a Settlement> {
    group
        .iter()
        .max_by_key(|s| (s.settled_on, s.sequence))
        .copied()
}

/// How an entry's settlement link is broken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrphanKind {
    /// `settlement_id` does not resolve to a settlement of this party.
    MissingSettlement(Uuid),
    /// Frozen flag set with no settlement link at all.
    SettledWithoutLink,
    /// Live entry still carrying a settlement link.
    LinkedWhileLive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanFinding {
    pub entry_id: Uuid,
    pub party: String,
    pub kind: OrphanKind,
}

/// A settlement no surviving entry points at, and that is not the party's
/// most recent checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DanglingSettlement {
    pub settlement_id: Uuid,
    pub party: String,
}

/// A live entry older than the party's latest settlement; the settle
/// transition should have frozen it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleEntry {
    pub entry_id: Uuid,
    pub party: String,
    /// The settlement that should have covered it.
    pub settlement_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub orphans: Vec<OrphanFinding>,
    pub dangling_settlements: Vec<DanglingSettlement>,
    pub stale_unsettled: Vec<StaleEntry>,
}

impl DiagnosticsReport {
    pub fn is_clean(&self) -> bool {
        self.finding_count() == 0
    }

    pub fn finding_count(&self) -> usize {
        self.orphans.len() + self.dangling_settlements.len() + self.stale_unsettled.len()
    }
}

/// Sweep a set of entries and settlements, both already scoped to one user
/// (and optionally one party).
pub fn sweep(entries: &[LedgerEntry], settlements: &[Settlement]) -> DiagnosticsReport {
    let mut report = DiagnosticsReport::default();

    let by_id: HashMap<Uuid, &Settlement> = settlements.iter().map(|s| (s.id, s)).collect();

    let mut by_party: HashMap<&str, Vec<&Settlement>> = HashMap::new();
    for s in settlements {
        by_party.entry(s.party.as_str()).or_default().push(s);
    }

    // Orphan links.
    for entry in entries {
        match entry.settlement_id {
            Some(sid) => {
                let resolves = by_id
                    .get(&sid)
                    .is_some_and(|s| s.party == entry.party && s.user_id == entry.user_id);
                if !resolves {
                    report.orphans.push(OrphanFinding {
                        entry_id: entry.id,
                        party: entry.party.clone(),
                        kind: OrphanKind::MissingSettlement(sid),
                    });
                } else if !entry.settled {
                    report.orphans.push(OrphanFinding {
                        entry_id: entry.id,
                        party: entry.party.clone(),
                        kind: OrphanKind::LinkedWhileLive,
                    });
                }
            }
            None if entry.settled => {
                report.orphans.push(OrphanFinding {
                    entry_id: entry.id,
                    party: entry.party.clone(),
                    kind: OrphanKind::SettledWithoutLink,
                });
            }
            None => {}
        }
    }

    // Dangling settlements: unreferenced by anything but their own entry,
    // and superseded by a later one.
    let referenced: HashSet<(Uuid, Uuid)> = entries
        .iter()
        .filter_map(|e| e.settlement_id.map(|sid| (e.id, sid)))
        .collect();

    for (party, group) in &by_party {
        let latest_id = latest_of(group).map(|s| s.id);

        for s in group {
            if Some(s.id) == latest_id {
                continue;
            }
            let externally_referenced = referenced
                .iter()
                .any(|(entry_id, sid)| *sid == s.id && *entry_id != s.entry_id);
            if !externally_referenced {
                report.dangling_settlements.push(DanglingSettlement {
                    settlement_id: s.id,
                    party: party.to_string(),
                });
            }
        }
    }

    // Stale live entries: older than the latest settlement's own entry.
    let entry_sequences: HashMap<Uuid, u64> = entries.iter().map(|e| (e.id, e.sequence)).collect();
    for (party, group) in &by_party {
        let Some(latest) = latest_of(group) else {
            continue;
        };
        let Some(&cutoff) = entry_sequences.get(&latest.entry_id) else {
            continue;
        };

        for entry in entries {
            if entry.party == *party
                && !entry.settled
                && entry.settlement_id.is_none()
                && !entry.is_settlement()
                && entry.sequence < cutoff
            {
                report.stale_unsettled.push(StaleEntry {
                    entry_id: entry.id,
                    party: party.to_string(),
                    settlement_id: latest.id,
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryKind, EntryType};
    use chrono::{NaiveDate, Utc};

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn entry(user: Uuid, party: &str, sequence: u64) -> LedgerEntry {
        let mut e = LedgerEntry::new(
            user,
            party,
            EntryType::Credit,
            10_000,
            date("2025-03-03"),
            "",
        );
        e.sequence = sequence;
        e
    }

    fn checkpoint(user: Uuid, party: &str, d: &str, sequence: u64) -> (Settlement, LedgerEntry) {
        let mut e = entry(user, party, sequence);
        e.kind = EntryKind::Settlement;
        e.settled = true;
        let s = Settlement {
            id: Uuid::now_v7(),
            user_id: user,
            party: party.to_string(),
            settled_on: date(d),
            balance: 10_000,
            entry_id: e.id,
            sequence,
            created_at: Utc::now(),
        };
        e.settlement_id = Some(s.id);
        (s, e)
    }

    #[test]
    fn test_clean_book_is_clean() {
        let user = Uuid::now_v7();
        let (s, se) = checkpoint(user, "Alpha", "2025-03-10", 2);
        let mut frozen = entry(user, "Alpha", 1);
        frozen.settled = true;
        frozen.settlement_id = Some(s.id);

        let report = sweep(&[frozen, se], &[s]);
        assert!(report.is_clean(), "unexpected findings: {:?}", report);
    }

    #[test]
    fn test_missing_settlement_is_an_orphan() {
        let user = Uuid::now_v7();
        let mut broken = entry(user, "Alpha", 1);
        broken.settled = true;
        broken.settlement_id = Some(Uuid::now_v7());

        let report = sweep(&[broken.clone()], &[]);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].entry_id, broken.id);
        assert!(matches!(
            report.orphans[0].kind,
            OrphanKind::MissingSettlement(_)
        ));
    }

    #[test]
    fn test_flag_link_disagreements_are_orphans() {
        let user = Uuid::now_v7();
        let (s, se) = checkpoint(user, "Alpha", "2025-03-10", 3);

        let mut no_link = entry(user, "Alpha", 4);
        no_link.settled = true;

        let mut live_with_link = entry(user, "Alpha", 5);
        live_with_link.settlement_id = Some(s.id);

        let report = sweep(&[no_link, live_with_link, se], &[s]);
        let kinds: Vec<&OrphanKind> = report.orphans.iter().map(|o| &o.kind).collect();
        assert!(kinds.contains(&&OrphanKind::SettledWithoutLink));
        assert!(kinds.contains(&&OrphanKind::LinkedWhileLive));
    }

    #[test]
    fn test_superseded_unreferenced_settlement_dangles() {
        let user = Uuid::now_v7();
        let (old, old_entry) = checkpoint(user, "Alpha", "2025-03-03", 1);
        let (new, new_entry) = checkpoint(user, "Alpha", "2025-03-10", 2);

        let report = sweep(&[old_entry, new_entry], &[old.clone(), new]);
        assert_eq!(report.dangling_settlements.len(), 1);
        assert_eq!(report.dangling_settlements[0].settlement_id, old.id);
    }

    #[test]
    fn test_latest_settlement_never_dangles() {
        let user = Uuid::now_v7();
        let (s, se) = checkpoint(user, "Alpha", "2025-03-10", 1);
        let report = sweep(&[se], &[s]);
        assert!(report.dangling_settlements.is_empty());
    }

    #[test]
    fn test_stale_live_entry_detected() {
        let user = Uuid::now_v7();
        let stale = entry(user, "Alpha", 1);
        let (s, se) = checkpoint(user, "Alpha", "2025-03-10", 2);

        let report = sweep(&[stale.clone(), se], &[s.clone()]);
        assert_eq!(report.stale_unsettled.len(), 1);
        assert_eq!(report.stale_unsettled[0].entry_id, stale.id);
        assert_eq!(report.stale_unsettled[0].settlement_id, s.id);
    }

    #[test]
    fn test_entries_after_settlement_are_not_stale() {
        let user = Uuid::now_v7();
        let (s, se) = checkpoint(user, "Alpha", "2025-03-10", 2);
        let fresh = entry(user, "Alpha", 3);

        let report = sweep(&[se, fresh], &[s]);
        assert!(report.stale_unsettled.is_empty());
    }
}
