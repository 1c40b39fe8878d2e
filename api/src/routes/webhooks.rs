//! Deposit Webhook Endpoint
//!
//! 서명 검증 → payload 파싱 → 확인 수 검사 → reconciliation 순서.
//! 서명이 틀리면 body를 파싱하지도 않음.
//!
//! 확인 수가 모자란 전송은 기록하지 않고 `deferred`로만 보고 (catch-up이 나중에 처리).
//!
//! 처리 중 에러가 나면 5xx를 반환해서 제공자가 재전송하게 함.
//! 이미 처리된 전송은 재전송돼도 Duplicate로 끝남.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Serialize;

use crate::services::webhook::{parse_address_activity, split_by_depth, verify_signature, SIGNATURE_HEADER};
use crate::services::ReconcileOutcome;
use crate::types::ApiResponse;
use crate::{error::ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct WebhookReceipt {
    pub received: usize,
    pub deferred: usize,
    pub outcomes: Vec<ReconcileOutcome>,
}

/// POST /webhooks/deposits
pub async fn receive_deposits(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<WebhookReceipt>>, ApiError> {
    let Some(signing_key) = state.config.webhook_signing_key.as_deref() else {
        tracing::warn!("ALCHEMY_WEBHOOK_SIGNING_KEY not set; webhook rejected");
        return Err(ApiError::Unauthorized);
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if !verify_signature(signing_key, &body, signature) {
        tracing::warn!("invalid webhook signature");
        return Err(ApiError::Unauthorized);
    }

    let transfers = parse_address_activity(&body, &state.config.chain.usdc_contract).map_err(|e| {
        tracing::warn!(error = %e, "webhook payload rejected");
        ApiError::BadRequest(e.to_string())
    })?;

    let received = transfers.len();
    let (ready, deferred) = if transfers.is_empty() {
        (transfers, Vec::new())
    } else {
        let head = state.chain.block_number().await?;
        split_by_depth(transfers, head, state.config.chain.required_confirmations)
    };

    for t in &deferred {
        tracing::info!(tx_hash = %t.tx_hash, block = t.block_number, "transfer below confirmation depth; deferred to catch-up");
    }

    let outcomes = state.reconciler.process_all(&ready).await?;

    tracing::info!(received, deferred = deferred.len(), "deposit webhook processed");
    Ok(Json(ApiResponse::success(WebhookReceipt {
        received,
        deferred: deferred.len(),
        outcomes,
    })))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::config::fixtures::{CRON_SECRET, WEBHOOK_KEY};
    use crate::db::TreasuryRepository;
    use crate::routes::{create_router, fixtures, CRON_SECRET_HEADER};
    use crate::services::deposit_matcher::fixtures::account;
    use crate::services::webhook::fixtures::{payload, sign};
    use crate::services::webhook::{parse_address_activity, SIGNATURE_HEADER};
    use crate::types::PaymentSchedule;

    /// 99 USDC (base units, hex)
    const UNLOCK_RAW: &str = "0x5e69ec0";

    /// fixture payload의 blockNum
    const BLOCK: u64 = 0xdf34a3;

    fn request(body: &str, signature: &str) -> Request<Body> {
        Request::post("/webhooks/deposits")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_signed_payload_completes_unlock_and_replay_is_noop() {
        let app = fixtures::app();
        app.chain.set_head(BLOCK + 10);
        let acct = account(Uuid::new_v4(), 0, PaymentSchedule::Weekly);
        app.store.put_account(acct.clone());
        let body = payload("ab", acct.deposit_address.as_str(), UNLOCK_RAW);
        let signature = sign(WEBHOOK_KEY, body.as_bytes());

        let resp = create_router(app.state.clone())
            .oneshot(request(&body, &signature))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = fixtures::json_body(resp).await;
        assert_eq!(json["data"]["outcomes"][0]["outcome"], "completed");

        let resp = create_router(app.state.clone())
            .oneshot(request(&body, &signature))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = fixtures::json_body(resp).await;
        assert_eq!(json["data"]["outcomes"][0]["outcome"], "duplicate");

        assert_eq!(app.store.deposits().len(), 1);
        assert_eq!(app.store.payments().len(), 1);
        assert!(app.store.account(acct.user_id).unwrap().initial_payment_completed);
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected_without_processing() {
        let app = fixtures::app();
        let acct = account(Uuid::new_v4(), 0, PaymentSchedule::Weekly);
        app.store.put_account(acct.clone());
        let body = payload("ab", acct.deposit_address.as_str(), UNLOCK_RAW);
        let forged = sign("not-the-key", body.as_bytes());

        let resp = create_router(app.state.clone())
            .oneshot(request(&body, &forged))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(app.store.deposits().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let app = fixtures::app();
        let body = r#"{"type":"ADDRESS_ACTIVITY","event":{"activity":"nope"}}"#;

        let resp = create_router(app.state.clone())
            .oneshot(request(body, &sign(WEBHOOK_KEY, body.as_bytes())))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_storage_failure_returns_server_error() {
        let app = fixtures::app();
        let acct = account(Uuid::new_v4(), 0, PaymentSchedule::Weekly);
        app.store.put_account(acct.clone());
        app.store.fail_deposit_inserts(true);
        app.chain.set_head(BLOCK + 10);
        let body = payload("cd", acct.deposit_address.as_str(), UNLOCK_RAW);

        let resp = create_router(app.state.clone())
            .oneshot(request(&body, &sign(WEBHOOK_KEY, body.as_bytes())))
            .await
            .unwrap();

        // 제공자가 재전송하도록 5xx
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(app.store.payments().is_empty());
    }

    #[tokio::test]
    async fn test_shallow_transfer_deferred_until_catch_up() {
        let app = fixtures::app();
        app.chain.set_head(BLOCK);
        let acct = account(Uuid::new_v4(), 0, PaymentSchedule::Weekly);
        app.store.put_account(acct.clone());
        let body = payload("ef", acct.deposit_address.as_str(), UNLOCK_RAW);

        let resp = create_router(app.state.clone())
            .oneshot(request(&body, &sign(WEBHOOK_KEY, body.as_bytes())))
            .await
            .unwrap();

        // 성공 응답이지만 기록하지 않음 (제공자가 재전송하지 않게)
        assert_eq!(resp.status(), StatusCode::OK);
        let json = fixtures::json_body(resp).await;
        assert_eq!(json["data"]["received"], 1);
        assert_eq!(json["data"]["deferred"], 1);
        assert!(app.store.deposits().is_empty());

        // 블록이 충분히 깊어진 뒤 catch-up이 같은 전송을 처리
        let usdc = &app.state.config.chain.usdc_contract;
        for t in parse_address_activity(body.as_bytes(), usdc).unwrap() {
            app.chain.push_log(t);
        }
        app.chain.set_head(BLOCK + 10);
        app.store.set_scan_cursor(BLOCK - 1).await.unwrap();

        let resp = create_router(app.state.clone())
            .oneshot(
                Request::post("/cron/reconcile")
                    .header(CRON_SECRET_HEADER, CRON_SECRET)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(app.store.deposits().len(), 1);
        assert_eq!(app.store.payments().len(), 1);
    }
}
