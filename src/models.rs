//! Document types for the affiliate program.
//!
//! Every record is stored as a JSON document under a string key (see
//! [`keys`]), except per-affiliate counters which live in a dedicated hash so
//! they can be mutated with atomic increments only.
//!
//! Status fields are enums with an explicit forward-only transition table.
//! Callers must go through `can_advance_to` before writing a new status;
//! nothing may ever move a record backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One per user enrolled in the affiliate program. Never deleted, only
/// archived. The referral code is immutable once issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateAccount {
    pub id: String,
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub code: String,
    /// Per-affiliate override of the default commission rate, in basis points.
    pub commission_rate_bps: Option<u32>,
    pub bank_info: Option<BankInfo>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankInfo {
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
}

/// One per attribution touchpoint, keyed by (referral code, visitor) at click
/// time and linked to the referred user once they register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralEvent {
    pub id: String,
    pub code: String,
    pub affiliate_id: String,
    pub visitor_id: Option<String>,
    pub referred_user_id: Option<String>,
    pub referred_email: Option<String>,
    pub referred_name: Option<String>,
    pub order_id: Option<String>,
    pub order_total: Option<i64>,
    pub commission: Option<i64>,
    pub status: ReferralStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Pending,
    Clicked,
    Registered,
    Ordered,
    Approved,
    Rejected,
    Paid,
    /// Informational only, derived by dashboards. No transition produces it.
    Purchased,
}

impl ReferralStatus {
    /// Forward-only progression: clicked -> registered -> ordered ->
    /// approved | rejected, approved -> paid. `rejected` and `paid` are
    /// terminal. `pending` behaves like a pre-click placeholder.
    pub fn can_advance_to(self, next: ReferralStatus) -> bool {
        use ReferralStatus::*;

        matches!(
            (self, next),
            (Pending, Clicked)
                | (Pending, Registered)
                | (Clicked, Registered)
                | (Clicked, Ordered)
                | (Registered, Ordered)
                | (Ordered, Approved)
                | (Ordered, Rejected)
                | (Approved, Paid)
        )
    }
}

/// One per attributed order. The amount is computed once, from the rate in
/// effect at order time, and never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateCommission {
    pub id: String,
    pub affiliate_id: String,
    pub event_id: String,
    pub order_id: String,
    pub order_total: i64,
    pub amount: i64,
    pub rate_bps: u32,
    pub status: CommissionStatus,
    /// Set when a payout claims this commission as funding.
    pub payout_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Rejected,
    Paid,
}

impl CommissionStatus {
    /// pending -> approved | rejected, approved -> paid. Rejection is
    /// terminal; a reversal requires a new commission record.
    pub fn can_advance_to(self, next: CommissionStatus) -> bool {
        use CommissionStatus::*;

        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Paid)
        )
    }
}

/// One per payout request. `amount` is the funded sum actually reserved
/// against the affiliate's approved balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliatePayout {
    pub id: String,
    pub affiliate_id: String,
    pub amount: i64,
    pub method: String,
    pub bank_info: Option<BankInfo>,
    pub commission_ids: Vec<String>,
    pub status: PayoutStatus,
    pub requested_at: DateTime<Utc>,
    pub processed_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

impl PayoutStatus {
    /// pending -> processing -> completed, pending -> rejected.
    pub fn can_advance_to(self, next: PayoutStatus) -> bool {
        use PayoutStatus::*;

        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Rejected) | (Processing, Completed)
        )
    }
}

/// Singleton program configuration, written only through the admin settings
/// endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateSettings {
    pub commission_rate_bps: u32,
    pub min_payout_amount: i64,
    pub payout_methods: Vec<String>,
    pub terms: String,
}

impl Default for AffiliateSettings {
    fn default() -> Self {
        Self {
            commission_rate_bps: 500,
            min_payout_amount: 50_000,
            payout_methods: vec!["bank_transfer".to_string()],
            terms: String::new(),
        }
    }
}

/// Minimal order record; the storefront owns the rest of the order shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub total: i64,
    pub affiliate_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Counter fields of the per-affiliate stats hash. Mutated with HINCRBY only,
/// never read-modify-write.
pub mod counters {
    pub const TOTAL_CLICKS: &str = "total_clicks";
    pub const TOTAL_REFERRALS: &str = "total_referrals";
    pub const PENDING_COMMISSION: &str = "pending_commission";
    pub const APPROVED_COMMISSION: &str = "approved_commission";
    pub const PAID_COMMISSION: &str = "paid_commission";
}

/// Key layout of the store. One place so the schema is greppable.
pub mod keys {
    pub fn affiliate(id: &str) -> String {
        format!("affiliate:{id}")
    }

    pub fn affiliate_stats(id: &str) -> String {
        format!("affiliate:{id}:stats")
    }

    /// code -> affiliate id. The NX insert on this key is what makes codes
    /// globally unique.
    pub fn affiliate_by_code(code: &str) -> String {
        format!("affiliate:code:{code}")
    }

    pub fn affiliate_by_user(user_id: &str) -> String {
        format!("affiliate:user:{user_id}")
    }

    pub fn event(id: &str) -> String {
        format!("referral:event:{id}")
    }

    /// (code, visitor) -> event id, the click dedup key.
    pub fn click(code: &str, visitor_id: &str) -> String {
        format!("referral:click:{code}:{visitor_id}")
    }

    /// (code, user) -> event id. NX insert here is the registration
    /// idempotency guard.
    pub fn registration(code: &str, user_id: &str) -> String {
        format!("referral:registered:{code}:{user_id}")
    }

    pub fn events_by_affiliate(id: &str) -> String {
        format!("affiliate:{id}:events")
    }

    pub fn commission(id: &str) -> String {
        format!("commission:{id}")
    }

    pub fn commissions_by_affiliate(id: &str) -> String {
        format!("affiliate:{id}:commissions")
    }

    pub fn payout(id: &str) -> String {
        format!("payout:{id}")
    }

    pub fn payouts_by_affiliate(id: &str) -> String {
        format!("affiliate:{id}:payouts")
    }

    pub fn order(id: &str) -> String {
        format!("order:{id}")
    }

    pub fn session(visitor_id: &str) -> String {
        format!("session:{visitor_id}")
    }

    pub fn settings() -> String {
        "affiliate:settings".to_string()
    }
}
