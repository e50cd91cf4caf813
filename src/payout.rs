//! Payout requests and the payout state machine.
//!
//! The funding race is settled at request time: the balance check and the
//! reservation are one conditional decrement of the affiliate's approved
//! balance, so two concurrent requests can never both draw on the same
//! commissions. Whole commissions fund a payout; each is claimed oldest-first
//! by a compare-and-set on its `payout_id`, and any unfundable remainder of
//! the reservation is released back.
//!
//! Completion is a single compare-and-set on the payout status, so at most
//! one of two concurrent completions wins; only the winner marks the funding
//! commissions paid and settles the counters.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    affiliate, commission,
    error::AppError,
    models::{
        AffiliateCommission, AffiliatePayout, CommissionStatus, PayoutStatus, ReferralStatus,
        counters, keys,
    },
    store::Store,
};

/// Claims `commission_id` as funding for `payout_id`. Ok(None) when another
/// payout got there first.
async fn claim_commission(
    store: &Store,
    commission_id: &str,
    payout_id: &str,
) -> Result<Option<AffiliateCommission>, AppError> {
    let claimed = store
        .update_doc(
            &keys::commission(commission_id),
            |commission: Option<AffiliateCommission>| {
                let mut commission = commission.ok_or(AppError::Conflict)?;
                if commission.status != CommissionStatus::Approved
                    || commission.payout_id.is_some()
                {
                    return Err(AppError::Conflict);
                }
                commission.payout_id = Some(payout_id.to_string());
                Ok(commission)
            },
        )
        .await;

    match claimed {
        Ok(commission) => Ok(Some(commission)),
        Err(AppError::Conflict) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Creates a `pending` payout for the affiliate.
///
/// Validation happens before anything is written; the balance check and the
/// reservation are one atomic step, so an over-claiming request fails without
/// leaving any record behind.
pub async fn request_payout(
    store: &Store,
    affiliate_id: &str,
    amount: i64,
    method: &str,
    now: DateTime<Utc>,
) -> Result<AffiliatePayout, AppError> {
    let account = affiliate::find_by_id(store, affiliate_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if account.archived {
        return Err(AppError::Validation(
            "account is archived".to_string(),
        ));
    }

    let settings = affiliate::get_settings(store).await?;
    if !settings.payout_methods.iter().any(|m| m == method) {
        return Err(AppError::Validation(format!(
            "payout method {method} is not allowed"
        )));
    }
    if amount < settings.min_payout_amount {
        return Err(AppError::Validation(format!(
            "requested amount is below the minimum payout of {}",
            settings.min_payout_amount
        )));
    }
    if method == "bank_transfer" && account.bank_info.is_none() {
        return Err(AppError::Validation(
            "bank details are required for bank transfers".to_string(),
        ));
    }

    let stats_key = keys::affiliate_stats(affiliate_id);
    if !store
        .reserve(&stats_key, counters::APPROVED_COMMISSION, amount)
        .await?
    {
        return Err(AppError::Validation(
            "requested amount exceeds the approved commission balance".to_string(),
        ));
    }

    // From here on the reservation must be settled or released.
    let payout_id = Uuid::new_v4().to_string();
    let mut funded = 0;
    let mut commission_ids = Vec::new();

    for candidate in commission::list_for_affiliate(store, affiliate_id).await? {
        if candidate.status != CommissionStatus::Approved || candidate.payout_id.is_some() {
            continue;
        }
        if funded + candidate.amount > amount {
            continue;
        }
        if let Some(claimed) = claim_commission(store, &candidate.id, &payout_id).await? {
            funded += claimed.amount;
            commission_ids.push(claimed.id);
        }
        if funded == amount {
            break;
        }
    }

    let remainder = amount - funded;
    if remainder > 0 {
        store
            .incr(&stats_key, counters::APPROVED_COMMISSION, remainder)
            .await?;
    }
    if funded == 0 {
        return Err(AppError::Validation(
            "no approved commission covers the requested amount".to_string(),
        ));
    }

    let payout = AffiliatePayout {
        id: payout_id,
        affiliate_id: affiliate_id.to_string(),
        amount: funded,
        method: method.to_string(),
        bank_info: account.bank_info,
        commission_ids,
        status: PayoutStatus::Pending,
        requested_at: now,
        processed_by: None,
        processed_at: None,
        completed_at: None,
        rejected_by: None,
        rejected_at: None,
        rejection_reason: None,
    };

    store.put_doc(&keys::payout(&payout.id), &payout).await?;
    store
        .index_add(&keys::payouts_by_affiliate(affiliate_id), &payout.id)
        .await?;

    info!(
        payout_id = %payout.id,
        affiliate_id,
        amount = payout.amount,
        "Payout requested"
    );
    Ok(payout)
}

pub async fn find_payout(store: &Store, id: &str) -> Result<Option<AffiliatePayout>, AppError> {
    store.get_doc(&keys::payout(id)).await
}

pub async fn list_for_affiliate(
    store: &Store,
    affiliate_id: &str,
) -> Result<Vec<AffiliatePayout>, AppError> {
    let ids = store
        .index_members(&keys::payouts_by_affiliate(affiliate_id))
        .await?;

    let mut payouts = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(payout) = find_payout(store, &id).await? {
            payouts.push(payout);
        }
    }
    payouts.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));

    Ok(payouts)
}

fn advance(
    payout: Option<AffiliatePayout>,
    next: PayoutStatus,
) -> Result<AffiliatePayout, AppError> {
    let payout = payout.ok_or(AppError::NotFound)?;
    if !payout.status.can_advance_to(next) {
        return Err(AppError::Conflict);
    }
    Ok(payout)
}

/// `pending -> processing`.
pub async fn process_payout(
    store: &Store,
    payout_id: &str,
    admin_user_id: &str,
    now: DateTime<Utc>,
) -> Result<AffiliatePayout, AppError> {
    let payout = store
        .update_doc(&keys::payout(payout_id), |payout| {
            let mut payout = advance(payout, PayoutStatus::Processing)?;
            payout.status = PayoutStatus::Processing;
            payout.processed_by = Some(admin_user_id.to_string());
            payout.processed_at = Some(now);
            Ok(payout)
        })
        .await?;

    info!(payout_id, admin_user_id, "Payout processing");
    Ok(payout)
}

/// `processing -> completed`. The status write is the serialization point:
/// of two concurrent completions only one passes the transition check, and
/// only that one marks the funding commissions paid and credits the paid
/// counter.
pub async fn complete_payout(
    store: &Store,
    payout_id: &str,
    admin_user_id: &str,
    now: DateTime<Utc>,
) -> Result<AffiliatePayout, AppError> {
    let payout = store
        .update_doc_with_counters(&keys::payout(payout_id), |payout| {
            let mut payout = advance(payout, PayoutStatus::Completed)?;
            payout.status = PayoutStatus::Completed;
            payout.completed_at = Some(now);

            let increments = vec![(
                keys::affiliate_stats(&payout.affiliate_id),
                counters::PAID_COMMISSION,
                payout.amount,
            )];
            Ok((payout, increments))
        })
        .await?;

    for commission_id in &payout.commission_ids {
        let settled = store
            .update_doc(
                &keys::commission(commission_id),
                |commission: Option<AffiliateCommission>| {
                    let mut commission = commission.ok_or(AppError::NotFound)?;
                    if commission.status == CommissionStatus::Paid {
                        return Ok(commission);
                    }
                    if !commission.status.can_advance_to(CommissionStatus::Paid) {
                        warn!(commission_id, "Funding commission in unexpected state");
                        return Ok(commission);
                    }
                    commission.status = CommissionStatus::Paid;
                    commission.paid_at = Some(now);
                    Ok(commission)
                },
            )
            .await?;
        commission::advance_event(store, &settled.event_id, ReferralStatus::Paid, now).await?;
    }

    info!(payout_id, admin_user_id, amount = payout.amount, "Payout completed");
    Ok(payout)
}

/// `pending -> rejected`. Releases the reservation and unclaims the funding
/// commissions so they stay payable.
pub async fn reject_payout(
    store: &Store,
    payout_id: &str,
    admin_user_id: &str,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<AffiliatePayout, AppError> {
    let payout = store
        .update_doc_with_counters(&keys::payout(payout_id), |payout| {
            let mut payout = advance(payout, PayoutStatus::Rejected)?;
            payout.status = PayoutStatus::Rejected;
            payout.rejected_by = Some(admin_user_id.to_string());
            payout.rejected_at = Some(now);
            payout.rejection_reason = reason.clone();

            let increments = vec![(
                keys::affiliate_stats(&payout.affiliate_id),
                counters::APPROVED_COMMISSION,
                payout.amount,
            )];
            Ok((payout, increments))
        })
        .await?;

    for commission_id in &payout.commission_ids {
        store
            .update_doc(
                &keys::commission(commission_id),
                |commission: Option<AffiliateCommission>| {
                    let mut commission = commission.ok_or(AppError::NotFound)?;
                    if commission.payout_id.as_deref() == Some(payout_id) {
                        commission.payout_id = None;
                    }
                    Ok(commission)
                },
            )
            .await?;
    }

    info!(payout_id, admin_user_id, "Payout rejected");
    Ok(payout)
}
