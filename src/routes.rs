//! HTTP handlers.
//!
//! Thin layer: extract identity and payload, call the domain module, map the
//! result. The error taxonomy lives in [`crate::error`]; tracking paths
//! swallow their failures here, state-machine paths surface them.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{
    affiliate::{self, AffiliateStats, SettingsUpdate},
    auth::{identity, require_admin},
    commission,
    error::AppError,
    models::{
        AffiliateAccount, AffiliateCommission, AffiliatePayout, AffiliateSettings, BankInfo,
        Order, ReferralEvent, keys,
    },
    payout, referral, session,
    state::State as AppState,
    store::Store,
};

async fn own_account(store: &Store, headers: &HeaderMap) -> Result<AffiliateAccount, AppError> {
    let user = identity(headers)?;

    affiliate::find_by_user(store, &user.user_id)
        .await?
        .ok_or(AppError::NotFound)
}

#[derive(Deserialize)]
pub struct VisitQuery {
    /// The `ref` query parameter of the landing URL.
    #[serde(rename = "ref")]
    pub code: Option<String>,
    pub visitor_id: Option<String>,
}

#[derive(Serialize)]
pub struct VisitResponse {
    pub visitor_id: String,
}

/// Resolver + click tracker. A missing `ref` is a normal, silent state, and
/// a tracking failure never fails the visit.
pub async fn visit_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VisitQuery>,
) -> Result<Json<VisitResponse>, AppError> {
    let visitor_id = query.visitor_id.unwrap_or_else(session::new_visitor_id);
    let now = Utc::now();

    if let Some(code) = query.code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        if let Err(e) = session::capture_code(&state.store, &visitor_id, code, now).await {
            warn!(code, "Failed to store referral code: {e}");
        }
        referral::record_click_best_effort(&state.store, code, &visitor_id, now).await;
    }

    Ok(Json(VisitResponse { visitor_id }))
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub code: Option<String>,
    pub visitor_id: Option<String>,
}

/// Registration attributor, called by the auth-state hook after sign-up.
/// Attribution failures are logged and reported as "not attributed" so they
/// can never break the sign-up flow.
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<Option<ReferralEvent>>, AppError> {
    let user = identity(&headers)?;
    let now = Utc::now();

    let code = match &payload.code {
        Some(code) => Some(code.clone()),
        None => match &payload.visitor_id {
            Some(visitor_id) => session::active_code(&state.store, visitor_id, now).await?,
            None => None,
        },
    };
    let Some(code) = code else {
        return Ok(Json(None));
    };

    match referral::attribute_registration(
        &state.store,
        &code,
        payload.visitor_id.as_deref(),
        &user,
        now,
    )
    .await
    {
        Ok(event) => Ok(Json(Some(event))),
        Err(e) => {
            warn!(code, user_id = %user.user_id, "Registration attribution failed: {e}");
            Ok(Json(None))
        }
    }
}

#[derive(Deserialize)]
pub struct OrderRequest {
    pub total: i64,
    pub visitor_id: Option<String>,
}

/// Order creation with attribution. The order always goes through; a failed
/// or inapplicable attribution just leaves `affiliate_id` unset.
pub async fn create_order_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<OrderRequest>,
) -> Result<Json<Order>, AppError> {
    let user = identity(&headers)?;
    if payload.total <= 0 {
        return Err(AppError::Validation(
            "order total must be positive".to_string(),
        ));
    }

    let now = Utc::now();
    let order_id = Uuid::new_v4().to_string();

    let affiliate_id = match referral::attribute_order(
        &state.store,
        payload.visitor_id.as_deref(),
        &order_id,
        &user.user_id,
        payload.total,
        now,
    )
    .await
    {
        Ok(attribution) => attribution.map(|a| a.affiliate_id),
        Err(e) => {
            warn!(order_id, "Order attribution failed: {e}");
            None
        }
    };

    let order = Order {
        id: order_id,
        user_id: user.user_id,
        total: payload.total,
        affiliate_id,
        created_at: now,
    };
    state.store.put_doc(&keys::order(&order.id), &order).await?;

    Ok(Json(order))
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct JoinRequest {
    pub bank_info: Option<BankInfo>,
}

pub async fn join_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Option<Json<JoinRequest>>,
) -> Result<Json<AffiliateAccount>, AppError> {
    let user = identity(&headers)?;
    let bank_info = payload.and_then(|Json(p)| p.bank_info);

    let account = affiliate::join_program(&state.store, &user, bank_info, Utc::now()).await?;
    Ok(Json(account))
}

pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AffiliateStats>, AppError> {
    let account = own_account(&state.store, &headers).await?;

    Ok(Json(affiliate::stats(&state.store, &account.id).await?))
}

pub async fn list_commissions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AffiliateCommission>>, AppError> {
    let account = own_account(&state.store, &headers).await?;

    Ok(Json(
        commission::list_for_affiliate(&state.store, &account.id).await?,
    ))
}

pub async fn list_payouts_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AffiliatePayout>>, AppError> {
    let account = own_account(&state.store, &headers).await?;

    Ok(Json(
        payout::list_for_affiliate(&state.store, &account.id).await?,
    ))
}

#[derive(Deserialize)]
pub struct PayoutRequestBody {
    pub amount: i64,
    pub method: String,
}

pub async fn request_payout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PayoutRequestBody>,
) -> Result<Json<AffiliatePayout>, AppError> {
    let account = own_account(&state.store, &headers).await?;

    let created = payout::request_payout(
        &state.store,
        &account.id,
        payload.amount,
        &payload.method,
        Utc::now(),
    )
    .await?;

    Ok(Json(created))
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

pub async fn approve_commission_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(commission_id): Path<String>,
) -> Result<Json<AffiliateCommission>, AppError> {
    let admin = require_admin(&state.config, &headers)?;

    let approved = commission::approve_commission(
        &state.store,
        &commission_id,
        &admin.user_id,
        Utc::now(),
    )
    .await?;

    Ok(Json(approved))
}

pub async fn reject_commission_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(commission_id): Path<String>,
    payload: Option<Json<RejectRequest>>,
) -> Result<Json<AffiliateCommission>, AppError> {
    let admin = require_admin(&state.config, &headers)?;
    let reason = payload.and_then(|Json(p)| p.reason);

    let rejected = commission::reject_commission(
        &state.store,
        &commission_id,
        &admin.user_id,
        reason,
        Utc::now(),
    )
    .await?;

    Ok(Json(rejected))
}

pub async fn process_payout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(payout_id): Path<String>,
) -> Result<Json<AffiliatePayout>, AppError> {
    let admin = require_admin(&state.config, &headers)?;

    let processed =
        payout::process_payout(&state.store, &payout_id, &admin.user_id, Utc::now()).await?;

    Ok(Json(processed))
}

pub async fn complete_payout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(payout_id): Path<String>,
) -> Result<Json<AffiliatePayout>, AppError> {
    let admin = require_admin(&state.config, &headers)?;

    let completed =
        payout::complete_payout(&state.store, &payout_id, &admin.user_id, Utc::now()).await?;

    Ok(Json(completed))
}

pub async fn reject_payout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(payout_id): Path<String>,
    payload: Option<Json<RejectRequest>>,
) -> Result<Json<AffiliatePayout>, AppError> {
    let admin = require_admin(&state.config, &headers)?;
    let reason = payload.and_then(|Json(p)| p.reason);

    let rejected = payout::reject_payout(
        &state.store,
        &payout_id,
        &admin.user_id,
        reason,
        Utc::now(),
    )
    .await?;

    Ok(Json(rejected))
}

pub async fn get_settings_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AffiliateSettings>, AppError> {
    require_admin(&state.config, &headers)?;

    Ok(Json(affiliate::get_settings(&state.store).await?))
}

pub async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SettingsUpdate>,
) -> Result<Json<AffiliateSettings>, AppError> {
    require_admin(&state.config, &headers)?;

    Ok(Json(affiliate::update_settings(&state.store, payload).await?))
}

pub async fn archive_affiliate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(affiliate_id): Path<String>,
) -> Result<Json<AffiliateAccount>, AppError> {
    require_admin(&state.config, &headers)?;

    Ok(Json(affiliate::archive(&state.store, &affiliate_id).await?))
}

pub async fn admin_stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(affiliate_id): Path<String>,
) -> Result<Json<AffiliateStats>, AppError> {
    require_admin(&state.config, &headers)?;

    Ok(Json(affiliate::stats(&state.store, &affiliate_id).await?))
}
