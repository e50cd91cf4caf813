//! The attribution pipeline: click -> registration -> order.
//!
//! Click tracking is fire-and-forget; nothing here may block or fail the
//! page visit it rides on. Registration attribution is idempotent per
//! (code, user) via a conditional insert, so duplicate auth-state events
//! cannot double-count a referral. Order attribution silently no-ops when
//! the stored code has expired or its affiliate is gone.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    affiliate,
    auth::Identity,
    commission,
    error::AppError,
    models::{AffiliateCommission, ReferralEvent, ReferralStatus, counters, keys},
    session,
    store::Store,
};

fn new_event(
    id: &str,
    code: &str,
    affiliate_id: &str,
    visitor_id: Option<&str>,
    status: ReferralStatus,
    now: DateTime<Utc>,
) -> ReferralEvent {
    ReferralEvent {
        id: id.to_string(),
        code: code.to_string(),
        affiliate_id: affiliate_id.to_string(),
        visitor_id: visitor_id.map(str::to_string),
        referred_user_id: None,
        referred_email: None,
        referred_name: None,
        order_id: None,
        order_total: None,
        commission: None,
        status,
        created_at: now,
        updated_at: now,
    }
}

/// Records an affiliate link visit. One `clicked` event per (code, visitor);
/// repeat visits bump the click counter and the event timestamp only.
pub async fn record_click(
    store: &Store,
    code: &str,
    visitor_id: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let Some(account) = affiliate::find_by_code(store, code).await? else {
        debug!(code, "Click for unknown referral code, ignoring");
        return Ok(());
    };
    if account.archived {
        debug!(code, "Click for archived affiliate, ignoring");
        return Ok(());
    }

    let event_id = Uuid::new_v4().to_string();
    let click_key = keys::click(code, visitor_id);

    if store.insert_doc(&click_key, &event_id).await? {
        let event = new_event(
            &event_id,
            code,
            &account.id,
            Some(visitor_id),
            ReferralStatus::Clicked,
            now,
        );
        store.put_doc(&keys::event(&event_id), &event).await?;
        store
            .index_add(&keys::events_by_affiliate(&account.id), &event_id)
            .await?;
    } else if let Some(existing_id) = store.get_doc::<String>(&click_key).await? {
        store
            .update_doc(&keys::event(&existing_id), |event: Option<ReferralEvent>| {
                let mut event = event.ok_or(AppError::NotFound)?;
                event.updated_at = now;
                Ok(event)
            })
            .await?;
    }

    store
        .incr(
            &keys::affiliate_stats(&account.id),
            counters::TOTAL_CLICKS,
            1,
        )
        .await?;

    Ok(())
}

/// Best-effort wrapper for the visit path: a tracking failure is logged and
/// swallowed so navigation always proceeds.
pub async fn record_click_best_effort(
    store: &Store,
    code: &str,
    visitor_id: &str,
    now: DateTime<Utc>,
) {
    if let Err(e) = record_click(store, code, visitor_id, now).await {
        warn!(code, visitor_id, "Click tracking failed: {e}");
    }
}

/// Binds a newly authenticated user to the code that brought them. Invoked
/// from the auth-state hook; calling it twice for the same (code, user) is a
/// no-op returning the original event.
pub async fn attribute_registration(
    store: &Store,
    code: &str,
    visitor_id: Option<&str>,
    user: &Identity,
    now: DateTime<Utc>,
) -> Result<ReferralEvent, AppError> {
    let account = affiliate::find_by_code(store, code)
        .await?
        .ok_or(AppError::NotFound)?;

    if account.user_id == user.user_id {
        return Err(AppError::Validation(
            "cannot register with your own referral code".to_string(),
        ));
    }

    // Reuse the click event when the visitor was tracked, otherwise
    // synthesize one directly in `registered`.
    let clicked_event_id = match visitor_id {
        Some(visitor_id) => {
            store
                .get_doc::<String>(&keys::click(code, visitor_id))
                .await?
        }
        None => None,
    };
    let event_id = clicked_event_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    // The guard key makes this idempotent: only its first writer attributes.
    let guard_key = keys::registration(code, &user.user_id);
    if !store.insert_doc(&guard_key, &event_id).await? {
        let existing_id: String = store
            .get_doc(&guard_key)
            .await?
            .ok_or(AppError::Conflict)?;
        return store
            .get_doc(&keys::event(&existing_id))
            .await?
            .ok_or(AppError::Conflict);
    }

    let event = store
        .update_doc(&keys::event(&event_id), |event: Option<ReferralEvent>| {
            let mut event = event.unwrap_or_else(|| {
                new_event(
                    &event_id,
                    code,
                    &account.id,
                    visitor_id,
                    ReferralStatus::Pending,
                    now,
                )
            });

            if event.status.can_advance_to(ReferralStatus::Registered) {
                event.status = ReferralStatus::Registered;
            }
            event.referred_user_id = Some(user.user_id.clone());
            event.referred_email = Some(user.email.clone());
            event.referred_name = Some(user.display_name.clone());
            event.updated_at = now;

            Ok(event)
        })
        .await?;

    store
        .index_add(&keys::events_by_affiliate(&account.id), &event_id)
        .await?;
    store
        .incr(
            &keys::affiliate_stats(&account.id),
            counters::TOTAL_REFERRALS,
            1,
        )
        .await?;

    info!(code, user_id = %user.user_id, "Registration attributed");
    Ok(event)
}

#[derive(Debug)]
pub struct OrderAttribution {
    pub affiliate_id: String,
    pub commission: AffiliateCommission,
}

/// Attaches the visitor's active affiliate to a new order and opens the
/// commission. Expired codes, unknown or archived affiliates, and
/// self-purchases all resolve to `None`: the order proceeds unattributed.
pub async fn attribute_order(
    store: &Store,
    visitor_id: Option<&str>,
    order_id: &str,
    buyer_user_id: &str,
    order_total: i64,
    now: DateTime<Utc>,
) -> Result<Option<OrderAttribution>, AppError> {
    let Some(visitor_id) = visitor_id else {
        return Ok(None);
    };
    let Some(code) = session::active_code(store, visitor_id, now).await? else {
        return Ok(None);
    };

    let Some(account) = affiliate::find_by_code(store, &code).await? else {
        debug!(code, "Active code no longer resolves to an affiliate");
        return Ok(None);
    };
    if account.archived || account.user_id == buyer_user_id {
        return Ok(None);
    }

    let settings = affiliate::get_settings(store).await?;
    let rate_bps = account.commission_rate_bps.unwrap_or(settings.commission_rate_bps);
    let amount = commission::compute_commission(order_total, rate_bps);

    // Prefer the registration event, then the tracked click, then synthesize.
    let known_event_id = match store
        .get_doc::<String>(&keys::registration(&code, buyer_user_id))
        .await?
    {
        Some(id) => Some(id),
        None => {
            store
                .get_doc::<String>(&keys::click(&code, visitor_id))
                .await?
        }
    };
    let event_id = known_event_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let event = store
        .update_doc(&keys::event(&event_id), |event: Option<ReferralEvent>| {
            let mut event = event.unwrap_or_else(|| {
                new_event(
                    &event_id,
                    &code,
                    &account.id,
                    Some(visitor_id),
                    ReferralStatus::Registered,
                    now,
                )
            });

            if event.status.can_advance_to(ReferralStatus::Ordered) {
                event.status = ReferralStatus::Ordered;
                event.order_id = Some(order_id.to_string());
                event.order_total = Some(order_total);
                event.commission = Some(amount);
                event.updated_at = now;
            }

            Ok(event)
        })
        .await?;

    store
        .index_add(&keys::events_by_affiliate(&account.id), &event.id)
        .await?;

    let created = commission::create_commission(
        store,
        &account.id,
        &event.id,
        order_id,
        order_total,
        rate_bps,
        now,
    )
    .await?;

    info!(
        code,
        order_id,
        affiliate_id = %account.id,
        amount,
        "Order attributed"
    );

    Ok(Some(OrderAttribution {
        affiliate_id: account.id,
        commission: created,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> Identity {
        Identity {
            user_id: id.to_string(),
            email: format!("{id}@example.com"),
            display_name: id.to_string(),
        }
    }

    async fn enrolled(store: &Store, owner: &str) -> crate::models::AffiliateAccount {
        affiliate::join_program(store, &user(owner), None, Utc::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn repeat_clicks_keep_one_event() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        record_click(&store, &account.code, "v1", now).await.unwrap();
        record_click(&store, &account.code, "v1", now).await.unwrap();

        let events = store
            .index_members(&keys::events_by_affiliate(&account.id))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        let clicks = store
            .counter(&keys::affiliate_stats(&account.id), counters::TOTAL_CLICKS)
            .await
            .unwrap();
        assert_eq!(clicks, 2);
    }

    #[tokio::test]
    async fn unknown_code_click_is_silent() {
        let store = Store::memory();

        record_click(&store, "NOSUCH", "v1", Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        record_click(&store, &account.code, "v1", now).await.unwrap();

        let first = attribute_registration(&store, &account.code, Some("v1"), &user("buyer"), now)
            .await
            .unwrap();
        let second = attribute_registration(&store, &account.code, Some("v1"), &user("buyer"), now)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ReferralStatus::Registered);
        assert_eq!(second.status, ReferralStatus::Registered);

        let referrals = store
            .counter(&keys::affiliate_stats(&account.id), counters::TOTAL_REFERRALS)
            .await
            .unwrap();
        assert_eq!(referrals, 1);

        let events = store
            .index_members(&keys::events_by_affiliate(&account.id))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn direct_signup_synthesizes_registered_event() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        let event = attribute_registration(&store, &account.code, None, &user("buyer"), now)
            .await
            .unwrap();

        assert_eq!(event.status, ReferralStatus::Registered);
        assert_eq!(event.referred_user_id.as_deref(), Some("buyer"));
        assert_eq!(event.visitor_id, None);
    }

    #[tokio::test]
    async fn self_referral_is_rejected() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        let err =
            attribute_registration(&store, &account.code, None, &user("owner"), now).await;
        assert!(matches!(err, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn click_failure_never_blocks_registration() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        store.set_offline(true);
        record_click_best_effort(&store, &account.code, "v1", now).await;
        store.set_offline(false);

        let event = attribute_registration(&store, &account.code, Some("v1"), &user("buyer"), now)
            .await
            .unwrap();
        assert_eq!(event.status, ReferralStatus::Registered);
    }

    #[tokio::test]
    async fn order_attribution_creates_pending_commission() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        record_click(&store, &account.code, "v1", now).await.unwrap();
        session::capture_code(&store, "v1", &account.code, now)
            .await
            .unwrap();
        attribute_registration(&store, &account.code, Some("v1"), &user("buyer"), now)
            .await
            .unwrap();

        let attribution = attribute_order(&store, Some("v1"), "order-1", "buyer", 10_000, now)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(attribution.affiliate_id, account.id);
        assert_eq!(attribution.commission.amount, 500);

        let event: ReferralEvent = store
            .get_doc(&keys::event(&attribution.commission.event_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, ReferralStatus::Ordered);
        assert_eq!(event.order_total, Some(10_000));

        let pending = store
            .counter(
                &keys::affiliate_stats(&account.id),
                counters::PENDING_COMMISSION,
            )
            .await
            .unwrap();
        assert_eq!(pending, 500);
    }

    #[tokio::test]
    async fn expired_code_orders_proceed_unattributed() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        session::capture_code(
            &store,
            "v1",
            &account.code,
            now - chrono::Duration::days(31),
        )
        .await
        .unwrap();

        let attribution = attribute_order(&store, Some("v1"), "order-1", "buyer", 10_000, now)
            .await
            .unwrap();
        assert!(attribution.is_none());
    }

    #[tokio::test]
    async fn archived_affiliate_gets_no_attribution() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        session::capture_code(&store, "v1", &account.code, now)
            .await
            .unwrap();
        affiliate::archive(&store, &account.id).await.unwrap();

        let attribution = attribute_order(&store, Some("v1"), "order-1", "buyer", 10_000, now)
            .await
            .unwrap();
        assert!(attribution.is_none());
    }

    #[tokio::test]
    async fn affiliate_override_rate_wins() {
        let store = Store::memory();
        let now = Utc::now();
        let account = enrolled(&store, "owner").await;

        store
            .update_doc(
                &keys::affiliate(&account.id),
                |a: Option<crate::models::AffiliateAccount>| {
                    let mut a = a.unwrap();
                    a.commission_rate_bps = Some(1_000);
                    Ok(a)
                },
            )
            .await
            .unwrap();

        session::capture_code(&store, "v1", &account.code, now)
            .await
            .unwrap();

        let attribution = attribute_order(&store, Some("v1"), "order-1", "buyer", 10_000, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attribution.commission.amount, 1_000);
    }
}
