// src/config.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Book-level default commission rate in basis points (3%).
pub const DEFAULT_COMMISSION_RATE_BPS: u32 = 300;

/// Fallback company account name for books that never configured one.
pub const DEFAULT_COMPANY_NAME: &str = "Company";

/// Per-user book configuration consumed by the virtual entry generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookConfig {
    pub user_id: Uuid,
    /// Name of the user's own company account.
    pub company_name: String,
    /// Commission rate applied when a party carries no override.
    pub default_commission_rate_bps: u32,
}

impl BookConfig {
    pub fn new(user_id: Uuid, company_name: impl Into<String>) -> Self {
        Self {
            user_id,
            company_name: company_name.into(),
            default_commission_rate_bps: DEFAULT_COMMISSION_RATE_BPS,
        }
    }

    pub fn with_commission_rate(mut self, rate_bps: u32) -> Self {
        self.default_commission_rate_bps = rate_bps;
        self
    }
}

impl Default for BookConfig {
    fn default() -> Self {
        Self::new(Uuid::nil(), DEFAULT_COMPANY_NAME)
    }
}
