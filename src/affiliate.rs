//! Affiliate enrollment, stats, and program settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::Identity,
    error::AppError,
    models::{AffiliateAccount, AffiliateSettings, BankInfo, counters, keys},
    store::Store,
};

/// Attempts at minting a code before giving up. Collisions on 8 hex chars are
/// vanishingly rare; the loop exists so a collision is a retry, not an error.
const CODE_MINT_ATTEMPTS: usize = 5;

fn mint_code() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

/// Enrolls the user in the program, issuing a globally unique referral code.
/// Idempotent: an already-enrolled user gets their existing account back.
pub async fn join_program(
    store: &Store,
    user: &Identity,
    bank_info: Option<BankInfo>,
    now: DateTime<Utc>,
) -> Result<AffiliateAccount, AppError> {
    if let Some(existing) = find_by_user(store, &user.user_id).await? {
        return Ok(existing);
    }

    let id = Uuid::new_v4().to_string();

    let mut code = None;
    for _ in 0..CODE_MINT_ATTEMPTS {
        let candidate = mint_code();
        if store
            .insert_doc(&keys::affiliate_by_code(&candidate), &id)
            .await?
        {
            code = Some(candidate);
            break;
        }
    }
    let code = code.ok_or(AppError::Conflict)?;

    let account = AffiliateAccount {
        id: id.clone(),
        user_id: user.user_id.clone(),
        email: user.email.clone(),
        display_name: user.display_name.clone(),
        code: code.clone(),
        commission_rate_bps: None,
        bank_info,
        archived: false,
        created_at: now,
    };

    // A concurrent join for the same user may have won; the per-user key is
    // the authority.
    if !store
        .insert_doc(&keys::affiliate_by_user(&user.user_id), &id)
        .await?
    {
        if let Some(existing) = find_by_user(store, &user.user_id).await? {
            return Ok(existing);
        }
        return Err(AppError::Conflict);
    }

    store.put_doc(&keys::affiliate(&id), &account).await?;
    info!(affiliate_id = %id, code = %code, "Affiliate enrolled");

    Ok(account)
}

pub async fn find_by_id(store: &Store, id: &str) -> Result<Option<AffiliateAccount>, AppError> {
    store.get_doc(&keys::affiliate(id)).await
}

pub async fn find_by_user(
    store: &Store,
    user_id: &str,
) -> Result<Option<AffiliateAccount>, AppError> {
    let id: Option<String> = store.get_doc(&keys::affiliate_by_user(user_id)).await?;

    match id {
        Some(id) => find_by_id(store, &id).await,
        None => Ok(None),
    }
}

pub async fn find_by_code(
    store: &Store,
    code: &str,
) -> Result<Option<AffiliateAccount>, AppError> {
    let id: Option<String> = store.get_doc(&keys::affiliate_by_code(code)).await?;

    match id {
        Some(id) => find_by_id(store, &id).await,
        None => Ok(None),
    }
}

#[derive(Debug, Serialize)]
pub struct AffiliateStats {
    pub account: AffiliateAccount,
    pub total_clicks: i64,
    pub total_referrals: i64,
    pub pending_commission: i64,
    pub approved_commission: i64,
    pub paid_commission: i64,
    pub total_commission: i64,
}

pub async fn stats(store: &Store, affiliate_id: &str) -> Result<AffiliateStats, AppError> {
    let account = find_by_id(store, affiliate_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let values = store.counters(&keys::affiliate_stats(affiliate_id)).await?;
    let get = |field: &str| values.get(field).copied().unwrap_or(0);

    let pending = get(counters::PENDING_COMMISSION);
    let approved = get(counters::APPROVED_COMMISSION);
    let paid = get(counters::PAID_COMMISSION);

    Ok(AffiliateStats {
        account,
        total_clicks: get(counters::TOTAL_CLICKS),
        total_referrals: get(counters::TOTAL_REFERRALS),
        pending_commission: pending,
        approved_commission: approved,
        paid_commission: paid,
        total_commission: pending + approved + paid,
    })
}

/// Soft archival; the account and its history stay in place.
pub async fn archive(store: &Store, affiliate_id: &str) -> Result<AffiliateAccount, AppError> {
    store
        .update_doc(&keys::affiliate(affiliate_id), |account| {
            let mut account: AffiliateAccount = account.ok_or(AppError::NotFound)?;
            account.archived = true;
            Ok(account)
        })
        .await
}

pub async fn get_settings(store: &Store) -> Result<AffiliateSettings, AppError> {
    Ok(store
        .get_doc(&keys::settings())
        .await?
        .unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct SettingsUpdate {
    pub commission_rate_bps: u32,
    pub min_payout_amount: i64,
    pub payout_methods: Vec<String>,
    pub terms: String,
}

pub async fn update_settings(
    store: &Store,
    update: SettingsUpdate,
) -> Result<AffiliateSettings, AppError> {
    if update.commission_rate_bps > 10_000 {
        return Err(AppError::Validation(
            "commission rate cannot exceed 100%".to_string(),
        ));
    }
    if update.min_payout_amount < 0 {
        return Err(AppError::Validation(
            "minimum payout cannot be negative".to_string(),
        ));
    }
    if update.payout_methods.is_empty() {
        return Err(AppError::Validation(
            "at least one payout method is required".to_string(),
        ));
    }

    let settings = AffiliateSettings {
        commission_rate_bps: update.commission_rate_bps,
        min_payout_amount: update.min_payout_amount,
        payout_methods: update.payout_methods,
        terms: update.terms,
    };

    store.put_doc(&keys::settings(), &settings).await?;
    Ok(settings)
}
