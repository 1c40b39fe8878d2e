//! Health Check Endpoint
//!
//! # Interview Q&A
//!
//! Q: Health check 엔드포인트는 왜 필요한가?
//! A: 3가지 용도
//!    1. 로드밸런서 헬스체크 (ALB, nginx)
//!    2. Kubernetes liveness/readiness check
//!    3. 모니터링 시스템 연동 (Prometheus, Datadog)
//!
//! Q: DB뿐 아니라 RPC도 체크하는 이유는?
//! A: "깊은 헬스체크"(deep health check) 패턴
//!    - 단순 200 OK: 프로세스 살아있음
//!    - DB 체크: 입금 기록 가능 상태
//!    - RPC 체크: catch-up/sweep 가능 상태 (webhook도 확인 수 검사에 head 조회 필요)

use std::time::Instant;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

/// Health check 응답
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: DependencyStatus,
    pub chain: ChainStatus,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct DependencyStatus {
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct ChainStatus {
    pub connected: bool,
    pub latest_block: Option<u64>,
}

/// GET /health
///
/// 서버 및 의존성 상태 확인
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    // DB 연결 테스트
    let db_start = Instant::now();
    let database = match state.store.health_check().await {
        Ok(_) => DependencyStatus {
            connected: true,
            latency_ms: Some(db_start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "database health check failed");
            DependencyStatus {
                connected: false,
                latency_ms: None,
            }
        }
    };

    let chain = match state.chain.block_number().await {
        Ok(block) => ChainStatus {
            connected: true,
            latest_block: Some(block),
        },
        Err(e) => {
            tracing::warn!(error = %e, "chain health check failed");
            ChainStatus {
                connected: false,
                latest_block: None,
            }
        }
    };

    let healthy = database.connected && chain.connected;
    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
        chain,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
