//! Cron Trigger Endpoints
//!
//! 외부 스케줄러(Vercel cron, k8s CronJob 등)가 호출. 두 작업 모두 재실행에 안전함.

use axum::{extract::State, Json};

use crate::routes::CronAuth;
use crate::services::{CatchUpSummary, SweepSummary};
use crate::types::ApiResponse;
use crate::{error::ApiError, AppState};

/// POST /cron/reconcile
///
/// webhook 누락 대비 체인 스캔 (cursor 이후 ~ head - confirmations)
pub async fn reconcile(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CatchUpSummary>>, ApiError> {
    let summary = state.catch_up.run().await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// POST /cron/sweep
///
/// treasury 설정은 매 실행마다 로드/검증 (관리자 변경 즉시 반영)
pub async fn sweep(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<SweepSummary>>, ApiError> {
    let settings = state.treasury_settings().await?;
    let summary = state.sweeper.sweep_all(&settings).await?;
    Ok(Json(ApiResponse::success(summary)))
}
