//! API Routes Module
//!
//! 모든 HTTP 엔드포인트 정의
//!
//! # Routes
//! - `/health` - 헬스 체크
//! - `/webhooks/deposits` - Alchemy address-activity webhook (HMAC 서명)
//! - `/cron/*` - catch-up 스캔, sweep 트리거 (`x-cron-secret`)
//! - `/admin/*` - 계정, treasury 설정, 커미션 관리 (`x-admin-secret`)

pub mod admin;
pub mod cron;
pub mod health;
pub mod webhooks;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{error::ApiError, AppState};

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

type HmacSha256 = Hmac<Sha256>;

const SECRET_COMPARE_KEY: &[u8] = b"trading-hub-payments/secret-compare";

/// 라우터 생성
///
/// # Route Structure
///
/// ```text
/// GET  /health                                  - 서버 상태 확인
///
/// POST /webhooks/deposits                       - 입금 webhook
///
/// POST /cron/reconcile                          - 체인 catch-up 스캔
/// POST /cron/sweep                              - treasury sweep
///
/// POST /admin/accounts                          - 입금 계정 생성/조회
/// GET  /admin/accounts/:user_id/period          - 기간 상태
/// GET  /admin/treasury                          - treasury 설정 (비밀 값 제외)
/// PUT  /admin/treasury                          - treasury 설정 갱신
/// POST /admin/treasury/gas/:user_id             - 입금 주소 gas 충전
/// GET  /admin/commissions/review                - 초과 입금 검토 목록
/// POST /admin/payments/:payment_id/commissions  - 커미션 재분배
/// POST /admin/commissions/:id/paid              - 지급 완료
/// POST /admin/commissions/:id/cancel            - 취소
/// ```
pub fn create_router(state: AppState) -> Router {
    // webhook/cron/admin은 서버 간 호출이라 브라우저 origin이 필요 없음
    // 프로덕션에서는 CORS를 열지 않음
    let cors = if state.config.is_production() {
        CorsLayer::new()
    } else {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    };

    Router::new()
        // Health check
        .route("/health", get(health::health_check))

        // Webhook
        .route("/webhooks/deposits", post(webhooks::receive_deposits))

        // Cron
        .route("/cron/reconcile", post(cron::reconcile))
        .route("/cron/sweep", post(cron::sweep))

        // Admin
        .route("/admin/accounts", post(admin::open_account))
        .route("/admin/accounts/:user_id/period", get(admin::period_status))
        .route("/admin/treasury", get(admin::get_treasury).put(admin::update_treasury))
        .route("/admin/treasury/gas/:user_id", post(admin::fund_gas))
        .route("/admin/commissions/review", get(admin::review_queue))
        .route("/admin/payments/:payment_id/commissions", post(admin::redistribute))
        .route("/admin/commissions/:id/paid", post(admin::mark_paid))
        .route("/admin/commissions/:id/cancel", post(admin::cancel))

        // 미들웨어
        .layer(TraceLayer::new_for_http())
        .layer(cors)

        // 상태 주입
        .with_state(state)
}

/// 공유 secret 헤더 검증
///
/// secret이 설정되지 않았으면 모든 요청 거부
fn check_secret(headers: &HeaderMap, header: &str, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        tracing::warn!(header, "secret not configured; request rejected");
        return Err(ApiError::Unauthorized);
    };

    let provided = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if !secrets_match(provided.as_bytes(), expected.as_bytes()) {
        tracing::warn!(header, "invalid secret");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// 두 값을 같은 키로 HMAC 태그한 뒤 `verify_slice`로 비교
///
/// 태그 길이가 고정이라 입력 길이 차이도 비교 시간에 드러나지 않음
fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    let tag = |value: &[u8]| {
        let mut mac = HmacSha256::new_from_slice(SECRET_COMPARE_KEY).ok()?;
        mac.update(value);
        Some(mac)
    };

    match (tag(provided), tag(expected)) {
        (Some(provided), Some(expected)) => provided.verify_slice(&expected.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}

/// `x-cron-secret` 인증 extractor
pub struct CronAuth;

#[async_trait]
impl FromRequestParts<AppState> for CronAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        check_secret(&parts.headers, CRON_SECRET_HEADER, state.config.cron_secret.as_deref())?;
        Ok(CronAuth)
    }
}

/// `x-admin-secret` 인증 extractor
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        check_secret(&parts.headers, ADMIN_SECRET_HEADER, state.config.admin_secret.as_deref())?;
        Ok(AdminAuth)
    }
}

/// 라우터 테스트용 상태 (in-memory 저장소 + mock 체인)
#[cfg(test)]
pub mod fixtures {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Response;

    use crate::config::Config;
    use crate::db::mock::MemoryStore;
    use crate::services::commission::fixtures::RecordingNetwork;
    use crate::services::usdc_client::mock::MockChain;
    use crate::AppState;

    pub struct TestApp {
        pub state: AppState,
        pub store: Arc<MemoryStore>,
        pub chain: Arc<MockChain>,
    }

    pub fn app_with(config: Config) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let state = AppState::new(config, store.clone(), chain.clone(), Arc::new(RecordingNetwork::default()));
        TestApp { state, store, chain }
    }

    pub fn app() -> TestApp {
        app_with(crate::config::fixtures::config())
    }

    pub async fn json_body(resp: Response<Body>) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
