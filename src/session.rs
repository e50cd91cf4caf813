//! Referral code resolver and visitor session.
//!
//! The storefront used to keep `referralCode` / `referralTimestamp` /
//! `visitorId` as loose browser-storage keys; here that is one small session
//! document keyed by the visitor id. Attribution is last-touch: a newly seen
//! code overwrites whatever was stored, and the capture timestamp restarts
//! the validity window.
//!
//! Absence of a code is a normal, silent state everywhere in this module.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::AppError, models::keys, store::Store};

/// How long a captured referral code stays attributable.
pub const REFERRAL_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorSession {
    pub referral_code: String,
    pub captured_at: DateTime<Utc>,
}

impl VisitorSession {
    /// True iff the capture is at most 30 days old. Exactly 30 days is still
    /// valid; a second past that is not.
    pub fn is_still_valid(&self, now: DateTime<Utc>) -> bool {
        now - self.captured_at <= Duration::days(REFERRAL_WINDOW_DAYS)
    }
}

/// A fresh pseudo-anonymous visitor id. Generated once per client and echoed
/// back so the client can persist it.
pub fn new_visitor_id() -> String {
    Uuid::new_v4().to_string()
}

/// Stores `code` against the visitor, overwriting any earlier capture
/// (last-touch attribution). The key expires with the attribution window, so
/// stale sessions do not accumulate in the store.
pub async fn capture_code(
    store: &Store,
    visitor_id: &str,
    code: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let session = VisitorSession {
        referral_code: code.to_string(),
        captured_at: now,
    };

    store
        .put_doc_ttl(
            &keys::session(visitor_id),
            &session,
            (REFERRAL_WINDOW_DAYS as u64) * 24 * 60 * 60,
        )
        .await
}

/// The visitor's referral code, if one was captured and is still inside the
/// validity window. Missing or expired sessions are simply `None`.
pub async fn active_code(
    store: &Store,
    visitor_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, AppError> {
    let session: Option<VisitorSession> = store.get_doc(&keys::session(visitor_id)).await?;

    Ok(session
        .filter(|s| s.is_still_valid(now))
        .map(|s| s.referral_code))
}
