//! Admin Endpoints
//!
//! 운영자 전용. 모든 핸들러가 `AdminAuth`를 첫 extractor로 받아서
//! 인증 실패 시 body 파싱이나 저장소 접근 전에 거부됨.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{Commission, DepositAccount};
use crate::routes::AdminAuth;
use crate::services::commission::DistributionSummary;
use crate::services::settings::RedactedSettings;
use crate::services::{GasFunding, PeriodStatus, TreasuryUpdate};
use crate::types::{ApiResponse, PaymentSchedule};
use crate::{error::ApiError, AppState};

/// 입금 계정 생성 요청
#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    pub user_id: Uuid,
    pub payment_schedule: PaymentSchedule,
}

/// POST /admin/accounts
///
/// 이미 있으면 기존 계정 반환 (schedule 변경 없음)
pub async fn open_account(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Json(req): Json<OpenAccountRequest>,
) -> Result<Json<ApiResponse<DepositAccount>>, ApiError> {
    let settings = state.treasury_settings().await?;
    let account = state
        .accounts
        .open_account(&settings, req.user_id, req.payment_schedule)
        .await?;
    Ok(Json(ApiResponse::success(account)))
}

/// GET /admin/accounts/:user_id/period
pub async fn period_status(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PeriodStatus>>, ApiError> {
    let status = state.reconciler.period_status(user_id).await?;
    Ok(Json(ApiResponse::success(status)))
}

/// GET /admin/treasury
///
/// xprv / payout 개인키는 "설정됨" 여부만 반환
pub async fn get_treasury(
    _auth: AdminAuth,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<RedactedSettings>>, ApiError> {
    let settings = state.treasury_settings().await?;
    Ok(Json(ApiResponse::success(settings.redacted())))
}

/// PUT /admin/treasury
///
/// 기존 값 위에 덮어쓴 결과 전체를 검증한 뒤에만 저장
pub async fn update_treasury(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Json(update): Json<TreasuryUpdate>,
) -> Result<Json<ApiResponse<RedactedSettings>>, ApiError> {
    let current = state.store.load_treasury_entries().await?;
    let settings = update
        .apply(current)
        .map_err(|e| ApiError::ValidationError(e.to_string()))?;

    state.store.save_treasury_entries(&settings.to_entries()).await?;

    tracing::info!(
        treasury = %settings.treasury_address,
        payout_wallet = ?settings.payout_wallet_address,
        "treasury settings updated"
    );
    Ok(Json(ApiResponse::success(settings.redacted())))
}

/// POST /admin/treasury/gas/:user_id
pub async fn fund_gas(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<GasFunding>>, ApiError> {
    let settings = state.treasury_settings().await?;
    let funding = state.sweeper.fund_gas(&settings, user_id).await?;
    Ok(Json(ApiResponse::success(funding)))
}

/// GET /admin/commissions/review
///
/// pending 초과 입금 크레딧 (검토 필요 건이 먼저)
pub async fn review_queue(
    _auth: AdminAuth,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Commission>>>, ApiError> {
    let queue = state.commissions.review_queue().await?;
    Ok(Json(ApiResponse::success(queue)))
}

/// POST /admin/payments/:payment_id/commissions
///
/// 분배 실패 복구용 재실행 (멱등)
pub async fn redistribute(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiResponse<DistributionSummary>>, ApiError> {
    let summary = state.commissions.redistribute(payment_id).await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// POST /admin/commissions/:id/paid
pub async fn mark_paid(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Commission>>, ApiError> {
    let commission = state.commissions.mark_paid(id).await?;
    Ok(Json(ApiResponse::success(commission)))
}

/// POST /admin/commissions/:id/cancel
pub async fn cancel(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Commission>>, ApiError> {
    let commission = state.commissions.cancel(id).await?;
    Ok(Json(ApiResponse::success(commission)))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::config::fixtures::ADMIN_SECRET;
    use crate::db::{CommissionRepository, NewCommission};
    use crate::routes::{create_router, fixtures, ADMIN_SECRET_HEADER};
    use crate::services::address_deriver::test_keys::account_xpub;
    use crate::services::settings::fixtures::{entries, PAYOUT_KEY};
    use crate::services::AddressDeriver;
    use crate::types::CommissionType;

    fn admin(method: &str, path: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header(ADMIN_SECRET_HEADER, ADMIN_SECRET);
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_admin_requires_secret() {
        let app = fixtures::app();

        let resp = create_router(app.state.clone())
            .oneshot(Request::get("/admin/treasury").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_open_account_derives_from_stored_xpub() {
        let app = fixtures::app();
        app.store.set_treasury(entries());
        let user_id = Uuid::new_v4();

        let resp = create_router(app.state.clone())
            .oneshot(admin(
                "POST",
                "/admin/accounts",
                Some(serde_json::json!({ "user_id": user_id, "payment_schedule": "monthly" })),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = fixtures::json_body(resp).await;
        let expected = AddressDeriver::derive_address(&account_xpub(), 0).unwrap();
        assert_eq!(json["data"]["deposit_address"], expected.as_str());
        assert_eq!(json["data"]["payment_schedule"], "monthly");
    }

    #[tokio::test]
    async fn test_treasury_view_redacts_secrets() {
        let app = fixtures::app();
        app.store.set_treasury(entries());

        let resp = create_router(app.state.clone())
            .oneshot(admin("GET", "/admin/treasury", None))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = fixtures::json_body(resp).await;
        assert_eq!(json["data"]["master_xprv_configured"], true);
        assert!(json["data"].get("master_xprv").is_none());
        assert!(!json.to_string().contains(PAYOUT_KEY.trim_start_matches("0x")));
    }

    #[tokio::test]
    async fn test_invalid_treasury_update_is_not_saved() {
        let app = fixtures::app();
        app.store.set_treasury(entries());

        let resp = create_router(app.state.clone())
            .oneshot(admin(
                "PUT",
                "/admin/treasury",
                Some(serde_json::json!({ "treasury_address": "0x1234" })),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = create_router(app.state.clone())
            .oneshot(admin("GET", "/admin/treasury", None))
            .await
            .unwrap();
        let json = fixtures::json_body(resp).await;
        assert_eq!(
            json["data"]["treasury_address"],
            crate::services::settings::fixtures::TREASURY
        );
    }

    #[tokio::test]
    async fn test_commission_transitions() {
        let app = fixtures::app();
        let user = Uuid::new_v4();
        app.store
            .insert_commission_batch(&[NewCommission {
                referrer_id: user,
                referred_id: user,
                commission_type: CommissionType::OverpaymentCredit,
                amount: "10.25".parse().unwrap(),
                level: None,
                payment_id: Some(Uuid::new_v4()),
                requires_admin_review: true,
            }])
            .await
            .unwrap();
        let id = app.store.commissions()[0].id;

        let resp = create_router(app.state.clone())
            .oneshot(admin("GET", "/admin/commissions/review", None))
            .await
            .unwrap();
        let json = fixtures::json_body(resp).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 1);

        let resp = create_router(app.state.clone())
            .oneshot(admin("POST", &format!("/admin/commissions/{}/paid", id), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = fixtures::json_body(resp).await;
        assert_eq!(json["data"]["status"], "paid");

        // pending이 아니면 전이 불가
        let resp = create_router(app.state.clone())
            .oneshot(admin("POST", &format!("/admin/commissions/{}/cancel", id), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_period_and_redistribute_unknown_ids() {
        let app = fixtures::app();

        for path in [
            format!("/admin/accounts/{}/period", Uuid::new_v4()),
            format!("/admin/payments/{}/commissions", Uuid::new_v4()),
        ] {
            let method = if path.ends_with("period") { "GET" } else { "POST" };
            let resp = create_router(app.state.clone())
                .oneshot(admin(method, &path, None))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
    }
}
