// src/party.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved party name that collects commission postings.
pub const COMMISSION_PARTY: &str = "Commission";

/// Fixed pair of parties that mirror each other's postings.
pub const MIRROR_PAIR: (&str, &str) = ("Take", "Give");

/// The mirror counterpart of a party name, if it belongs to the fixed pair.
pub fn mirror_counterpart(name: &str) -> Option<&'static str> {
    if name == MIRROR_PAIR.0 {
        Some(MIRROR_PAIR.1)
    } else if name == MIRROR_PAIR.1 {
        Some(MIRROR_PAIR.0)
    } else {
        None
    }
}

/// Role of a party, fixed at creation.
///
/// Aggregation and generation guards consult this tag instead of re-deriving
/// the role from name or remark text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartyKind {
    /// Ordinary counter-party entered by the user.
    Regular,
    /// The reserved commission account.
    Commission,
    /// The user's own company account.
    Company,
}

impl PartyKind {
    pub fn is_regular(&self) -> bool {
        matches!(self, PartyKind::Regular)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Regular => "regular",
            PartyKind::Commission => "commission",
            PartyKind::Company => "company",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(PartyKind::Regular),
            "commission" => Some(PartyKind::Commission),
            "company" => Some(PartyKind::Company),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommissionMode {
    Take,
    Give,
}

impl CommissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionMode::Take => "take",
            CommissionMode::Give => "give",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "take" => Some(CommissionMode::Take),
            "give" => Some(CommissionMode::Give),
            _ => None,
        }
    }
}

/// A counter-party in a user's book. Names are unique per user.
///
/// Parties referencing ledger entries are never physically deleted; they are
/// deactivated instead so settled history keeps resolving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub kind: PartyKind,
    pub commission_mode: Option<CommissionMode>,
    /// Per-party commission override in basis points. The book default
    /// applies when unset.
    pub commission_rate_bps: Option<u32>,
    /// True while the latest settlement covers every entry of this party.
    pub settled: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Party {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            name: name.into(),
            kind: PartyKind::Regular,
            commission_mode: None,
            commission_rate_bps: None,
            settled: false,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// The reserved commission account for a user.
    pub fn commission(user_id: Uuid) -> Self {
        Self {
            kind: PartyKind::Commission,
            ..Self::new(user_id, COMMISSION_PARTY)
        }
    }

    /// The user's own company account.
    pub fn company(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            kind: PartyKind::Company,
            ..Self::new(user_id, name)
        }
    }

    pub fn with_commission_rate(mut self, rate_bps: u32) -> Self {
        self.commission_rate_bps = Some(rate_bps);
        self
    }

    pub fn with_commission_mode(mut self, mode: CommissionMode) -> Self {
        self.commission_mode = Some(mode);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_counterpart() {
        assert_eq!(mirror_counterpart("Take"), Some("Give"));
        assert_eq!(mirror_counterpart("Give"), Some("Take"));
        assert_eq!(mirror_counterpart("Alpha"), None);
        assert_eq!(mirror_counterpart("Commission"), None);
    }

    #[test]
    fn test_reserved_constructors() {
        let user = Uuid::now_v7();

        let commission = Party::commission(user);
        assert_eq!(commission.name, COMMISSION_PARTY);
        assert_eq!(commission.kind, PartyKind::Commission);
        assert!(commission.active);

        let company = Party::company(user, "Sharma & Sons");
        assert_eq!(company.kind, PartyKind::Company);
        assert!(!company.kind.is_regular());
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [PartyKind::Regular, PartyKind::Commission, PartyKind::Company] {
            assert_eq!(PartyKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PartyKind::parse("vendor"), None);
    }

    #[test]
    fn test_commission_attributes() {
        let party = Party::new(Uuid::now_v7(), "Take")
            .with_commission_mode(CommissionMode::Take)
            .with_commission_rate(250);

        assert_eq!(party.commission_mode, Some(CommissionMode::Take));
        assert_eq!(party.commission_rate_bps, Some(250));

        for mode in [CommissionMode::Take, CommissionMode::Give] {
            assert_eq!(CommissionMode::parse(mode.as_str()), Some(mode));
        }
    }
}
