//! Commission computation and the commission state machine.
//!
//! The amount is derived once, from the rate in effect at order time, and is
//! never recomputed when the program rate changes later. Admin approval and
//! rejection are the only ways out of `pending`; rejection is terminal.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{AffiliateCommission, CommissionStatus, ReferralEvent, ReferralStatus, counters, keys},
    store::Store,
};

/// Commission for an order total at a rate in basis points, rounded half-up
/// to the smallest currency unit. Deterministic integer arithmetic.
pub fn compute_commission(order_total: i64, rate_bps: u32) -> i64 {
    ((order_total as i128 * rate_bps as i128 + 5_000) / 10_000) as i64
}

/// Creates the `pending` commission record for an attributed order and bumps
/// the affiliate's pending balance.
pub async fn create_commission(
    store: &Store,
    affiliate_id: &str,
    event_id: &str,
    order_id: &str,
    order_total: i64,
    rate_bps: u32,
    now: DateTime<Utc>,
) -> Result<AffiliateCommission, AppError> {
    let commission = AffiliateCommission {
        id: Uuid::new_v4().to_string(),
        affiliate_id: affiliate_id.to_string(),
        event_id: event_id.to_string(),
        order_id: order_id.to_string(),
        order_total,
        amount: compute_commission(order_total, rate_bps),
        rate_bps,
        status: CommissionStatus::Pending,
        payout_id: None,
        created_at: now,
        approved_by: None,
        approved_at: None,
        rejected_by: None,
        rejected_at: None,
        rejection_reason: None,
        paid_at: None,
    };

    store
        .put_doc(&keys::commission(&commission.id), &commission)
        .await?;
    store
        .index_add(&keys::commissions_by_affiliate(affiliate_id), &commission.id)
        .await?;
    store
        .incr(
            &keys::affiliate_stats(affiliate_id),
            counters::PENDING_COMMISSION,
            commission.amount,
        )
        .await?;

    Ok(commission)
}

pub async fn find_commission(
    store: &Store,
    id: &str,
) -> Result<Option<AffiliateCommission>, AppError> {
    store.get_doc(&keys::commission(id)).await
}

pub async fn list_for_affiliate(
    store: &Store,
    affiliate_id: &str,
) -> Result<Vec<AffiliateCommission>, AppError> {
    let ids = store
        .index_members(&keys::commissions_by_affiliate(affiliate_id))
        .await?;

    let mut commissions = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(commission) = find_commission(store, &id).await? {
            commissions.push(commission);
        }
    }
    commissions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Ok(commissions)
}

/// Mirrors a commission transition onto its referral event, which is how an
/// event reaches `approved`, `rejected`, and `paid`. A missing or
/// already-final event is logged and skipped so the admin action still
/// settles.
pub(crate) async fn advance_event(
    store: &Store,
    event_id: &str,
    next: ReferralStatus,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let advanced = store
        .update_doc(&keys::event(event_id), |event: Option<ReferralEvent>| {
            let mut event = event.ok_or(AppError::NotFound)?;
            if event.status.can_advance_to(next) {
                event.status = next;
                event.updated_at = now;
            }
            Ok(event)
        })
        .await;

    match advanced {
        Ok(_) => Ok(()),
        Err(AppError::NotFound) => {
            warn!(event_id, "No referral event to advance for this commission");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// `pending -> approved`. Moves the amount from the pending balance to the
/// approved (payable) balance in the same transaction as the status write,
/// and advances the linked referral event.
pub async fn approve_commission(
    store: &Store,
    commission_id: &str,
    admin_user_id: &str,
    now: DateTime<Utc>,
) -> Result<AffiliateCommission, AppError> {
    let commission = store
        .update_doc_with_counters(
            &keys::commission(commission_id),
            |commission: Option<AffiliateCommission>| {
                let mut commission = commission.ok_or(AppError::NotFound)?;
                if !commission.status.can_advance_to(CommissionStatus::Approved) {
                    return Err(AppError::Conflict);
                }
                commission.status = CommissionStatus::Approved;
                commission.approved_by = Some(admin_user_id.to_string());
                commission.approved_at = Some(now);

                let stats_key = keys::affiliate_stats(&commission.affiliate_id);
                let increments = vec![
                    (stats_key.clone(), counters::PENDING_COMMISSION, -commission.amount),
                    (stats_key, counters::APPROVED_COMMISSION, commission.amount),
                ];
                Ok((commission, increments))
            },
        )
        .await?;

    advance_event(store, &commission.event_id, ReferralStatus::Approved, now).await?;

    info!(commission_id, admin_user_id, "Commission approved");
    Ok(commission)
}

/// `pending -> rejected`. Terminal; a reversal requires a new commission.
pub async fn reject_commission(
    store: &Store,
    commission_id: &str,
    admin_user_id: &str,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<AffiliateCommission, AppError> {
    let commission = store
        .update_doc_with_counters(
            &keys::commission(commission_id),
            |commission: Option<AffiliateCommission>| {
                let mut commission = commission.ok_or(AppError::NotFound)?;
                if !commission.status.can_advance_to(CommissionStatus::Rejected) {
                    return Err(AppError::Conflict);
                }
                commission.status = CommissionStatus::Rejected;
                commission.rejected_by = Some(admin_user_id.to_string());
                commission.rejected_at = Some(now);
                commission.rejection_reason = reason.clone();

                let increments = vec![(
                    keys::affiliate_stats(&commission.affiliate_id),
                    counters::PENDING_COMMISSION,
                    -commission.amount,
                )];
                Ok((commission, increments))
            },
        )
        .await?;

    advance_event(store, &commission.event_id, ReferralStatus::Rejected, now).await?;

    info!(commission_id, admin_user_id, "Commission rejected");
    Ok(commission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{affiliate, auth::Identity, referral, session};

    fn user(id: &str) -> Identity {
        Identity {
            user_id: id.to_string(),
            email: format!("{id}@example.com"),
            display_name: id.to_string(),
        }
    }

    async fn ordered_event(store: &Store, id: &str, now: DateTime<Utc>) {
        let event = ReferralEvent {
            id: id.to_string(),
            code: "CODE".to_string(),
            affiliate_id: "aff".to_string(),
            visitor_id: Some("v1".to_string()),
            referred_user_id: Some("buyer".to_string()),
            referred_email: None,
            referred_name: None,
            order_id: Some("order".to_string()),
            order_total: Some(10_000),
            commission: Some(500),
            status: ReferralStatus::Ordered,
            created_at: now,
            updated_at: now,
        };
        store.put_doc(&keys::event(id), &event).await.unwrap();
    }

    #[test]
    fn commission_math_is_half_up() {
        // 5% = 500 bps
        assert_eq!(compute_commission(10_000, 500), 500);
        assert_eq!(compute_commission(999, 500), 50); // 49.95 rounds up
        assert_eq!(compute_commission(989, 500), 49); // 49.45 rounds down
        assert_eq!(compute_commission(990, 500), 50); // 49.50 rounds up
        assert_eq!(compute_commission(0, 500), 0);
        assert_eq!(compute_commission(10_000, 0), 0);
        assert_eq!(compute_commission(3, 10_000), 3);
    }

    #[tokio::test]
    async fn approval_moves_pending_to_approved_balance() {
        let store = Store::memory();
        let now = Utc::now();

        let c = create_commission(&store, "aff", "ev", "order", 10_000, 500, now)
            .await
            .unwrap();

        let stats_key = keys::affiliate_stats("aff");
        assert_eq!(
            store.counter(&stats_key, counters::PENDING_COMMISSION).await.unwrap(),
            500
        );

        approve_commission(&store, &c.id, "admin", now).await.unwrap();

        assert_eq!(
            store.counter(&stats_key, counters::PENDING_COMMISSION).await.unwrap(),
            0
        );
        assert_eq!(
            store.counter(&stats_key, counters::APPROVED_COMMISSION).await.unwrap(),
            500
        );
    }

    #[tokio::test]
    async fn rejected_commission_cannot_be_approved() {
        let store = Store::memory();
        let now = Utc::now();

        let c = create_commission(&store, "aff", "ev", "order", 10_000, 500, now)
            .await
            .unwrap();

        reject_commission(&store, &c.id, "admin", Some("fraud".to_string()), now)
            .await
            .unwrap();

        let err = approve_commission(&store, &c.id, "admin", now).await;
        assert!(matches!(err, Err(AppError::Conflict)));

        let stored = find_commission(&store, &c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommissionStatus::Rejected);
        assert_eq!(
            store
                .counter(&keys::affiliate_stats("aff"), counters::PENDING_COMMISSION)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn double_approval_counts_once() {
        let store = Store::memory();
        let now = Utc::now();

        let c = create_commission(&store, "aff", "ev", "order", 10_000, 500, now)
            .await
            .unwrap();

        approve_commission(&store, &c.id, "admin", now).await.unwrap();
        assert!(approve_commission(&store, &c.id, "admin", now).await.is_err());

        assert_eq!(
            store
                .counter(&keys::affiliate_stats("aff"), counters::APPROVED_COMMISSION)
                .await
                .unwrap(),
            500
        );
    }

    #[tokio::test]
    async fn approval_advances_the_referral_event() {
        let store = Store::memory();
        let now = Utc::now();

        // Full pipeline so the commission is tied to a real tracked event.
        let account = affiliate::join_program(&store, &user("owner"), None, now)
            .await
            .unwrap();
        referral::record_click(&store, &account.code, "v1", now).await.unwrap();
        session::capture_code(&store, "v1", &account.code, now).await.unwrap();
        referral::attribute_registration(&store, &account.code, Some("v1"), &user("buyer"), now)
            .await
            .unwrap();
        let attribution = referral::attribute_order(&store, Some("v1"), "order-1", "buyer", 10_000, now)
            .await
            .unwrap()
            .unwrap();

        approve_commission(&store, &attribution.commission.id, "admin", now)
            .await
            .unwrap();

        let event: ReferralEvent = store
            .get_doc(&keys::event(&attribution.commission.event_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, ReferralStatus::Approved);
    }

    #[tokio::test]
    async fn rejection_finalizes_the_referral_event() {
        let store = Store::memory();
        let now = Utc::now();

        ordered_event(&store, "ev", now).await;
        let c = create_commission(&store, "aff", "ev", "order", 10_000, 500, now)
            .await
            .unwrap();

        reject_commission(&store, &c.id, "admin", Some("fraud".to_string()), now)
            .await
            .unwrap();

        let event: ReferralEvent = store.get_doc(&keys::event("ev")).await.unwrap().unwrap();
        assert_eq!(event.status, ReferralStatus::Rejected);
    }

    #[tokio::test]
    async fn approval_without_an_event_still_settles() {
        let store = Store::memory();
        let now = Utc::now();

        let c = create_commission(&store, "aff", "ev-gone", "order", 10_000, 500, now)
            .await
            .unwrap();

        let approved = approve_commission(&store, &c.id, "admin", now).await.unwrap();
        assert_eq!(approved.status, CommissionStatus::Approved);
    }
}
