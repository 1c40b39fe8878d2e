//! Notification Hub
//!
//! 결제 상태 전이 이벤트를 외부 알림 파이프라인(email/SMS)으로 넘기는 경계.
//!
//! # Features
//! - 상태 전이당 정확히 1회 기록 (전이를 "이긴" 트랜잭션 안에서 outbox insert)
//! - dispatcher가 outbox를 비우며 외부 webhook으로 전달 (at-least-once)
//! - 수신 측은 envelope의 `id`로 중복 제거
//!
//! # Interview Q&A
//!
//! Q: 왜 broadcast 채널이 아니라 outbox인가?
//! A: 채널은 프로세스가 죽거나 구독자가 밀리면 이벤트가 사라짐.
//!    완료 이벤트는 결제 row와 같은 트랜잭션에 기록되므로
//!    "결제는 됐는데 알림은 없음" 상태가 생기지 않음

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::db::{OutboxEntry, OverpaymentCredit, PaymentRecord, PaymentStore};
use crate::error::PaymentError;
use crate::types::{EthAddress, PaymentType, TxHash, UsdcAmount};

/// 한 번에 전달할 outbox 항목 수
const DRAIN_BATCH: i64 = 100;

/// wake 신호가 없어도 outbox를 다시 확인하는 주기
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// 결제 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PaymentEvent {
    /// 기간 결제 완료
    PaymentCompleted(PaymentCompleted),
    /// 부분 입금 (누적 금액 부족)
    PartialPayment(PartialPayment),
    /// 허용 오차를 넘는 초과 입금 (관리자 검토)
    OverpaymentFlagged(OverpaymentFlagged),
    /// sweep 실패
    SweepFailed(SweepFailed),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub user_id: Uuid,
    pub payment_id: Uuid,
    pub payment_type: PaymentType,
    pub amount: UsdcAmount,
    pub period_end: DateTime<Utc>,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialPayment {
    pub user_id: Uuid,
    pub payment_type: PaymentType,
    pub paid: UsdcAmount,
    pub expected: UsdcAmount,
    pub remaining: UsdcAmount,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverpaymentFlagged {
    pub user_id: Uuid,
    pub payment_id: Uuid,
    pub overpaid: UsdcAmount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepFailed {
    pub deposit_address: EthAddress,
    pub reason: String,
}

impl PaymentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentEvent::PaymentCompleted(_) => "payment_completed",
            PaymentEvent::PartialPayment(_) => "partial_payment",
            PaymentEvent::OverpaymentFlagged(_) => "overpayment_flagged",
            PaymentEvent::SweepFailed(_) => "sweep_failed",
        }
    }
}

/// 기간 완료 트랜잭션이 outbox에 남기는 이벤트
pub fn completion_events(
    payment: &PaymentRecord,
    overpayment: Option<&OverpaymentCredit>,
) -> Vec<PaymentEvent> {
    let mut events = vec![PaymentEvent::PaymentCompleted(PaymentCompleted {
        user_id: payment.user_id,
        payment_id: payment.id,
        payment_type: payment.payment_type,
        amount: payment.amount,
        period_end: payment.period_end,
        tx_hash: payment.trigger_tx_hash.clone(),
    })];

    if let Some(credit) = overpayment.filter(|c| c.requires_admin_review) {
        events.push(PaymentEvent::OverpaymentFlagged(OverpaymentFlagged {
            user_id: payment.user_id,
            payment_id: payment.id,
            overpaid: credit.amount,
        }));
    }

    events
}

/// 이벤트 허브
///
/// # Architecture
/// ```text
/// ┌──────────────┐                         ┌──────────────────┐
/// │ Reconciler   │──┐  ┌───────────────┐   │                  │
/// ├──────────────┤  ├─▶│ outbox table  │──▶│ Dispatcher       │──▶ webhook
/// │ Sweep        │──┘  └───────────────┘   │  (wake / poll)   │
/// └──────────────┘                         └──────────────────┘
/// ```
#[derive(Clone)]
pub struct NotificationHub {
    store: Arc<dyn PaymentStore>,
    wake: Arc<Notify>,
}

impl NotificationHub {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self {
            store,
            wake: Arc::new(Notify::new()),
        }
    }

    /// 상태 전이 트랜잭션 밖에서 생기는 이벤트 (부분 입금, sweep 실패)
    pub async fn publish(&self, event: PaymentEvent) -> Result<(), PaymentError> {
        self.store.enqueue_event(&event).await?;
        tracing::debug!(event = event.kind(), "event queued");
        self.wake();
        Ok(())
    }

    /// store가 직접 outbox에 기록한 뒤 dispatcher를 깨움
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

/// 외부 webhook으로 보내는 형태
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: Uuid,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a PaymentEvent,
}

/// 외부 알림 webhook 전달자
pub struct NotificationDispatcher {
    store: Arc<dyn PaymentStore>,
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn PaymentStore>, webhook_url: Option<String>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            webhook_url,
        }
    }

    /// 백그라운드 전달 루프 시작. 기동 시 밀린 outbox부터 비움
    pub fn spawn(self, hub: &NotificationHub) -> JoinHandle<()> {
        let wake = hub.wake.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.drain().await {
                    tracing::error!(error = %e, "notification outbox drain failed");
                }
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        })
    }

    /// 대기 중인 이벤트 전달. 실패하면 순서 유지를 위해 그 자리에서 멈춤
    pub async fn drain(&self) -> Result<usize, PaymentError> {
        let pending = self.store.pending_events(DRAIN_BATCH).await?;
        let mut delivered = 0;

        for entry in pending {
            match self.deliver(&entry).await {
                Ok(()) => {
                    self.store.mark_event_delivered(entry.id).await?;
                    delivered += 1;
                }
                Err(reason) => {
                    tracing::warn!(
                        id = %entry.id,
                        event = entry.event.kind(),
                        attempts = entry.attempts + 1,
                        error = %reason,
                        "notification delivery failed"
                    );
                    self.store.record_delivery_failure(entry.id, &reason).await?;
                    break;
                }
            }
        }

        Ok(delivered)
    }

    async fn deliver(&self, entry: &OutboxEntry) -> Result<(), String> {
        let Some(url) = &self.webhook_url else {
            tracing::info!(
                id = %entry.id,
                event = entry.event.kind(),
                payload = ?entry.event,
                "payment event (no notification webhook configured)"
            );
            return Ok(());
        };

        let envelope = Envelope {
            id: entry.id,
            created_at: entry.created_at,
            event: &entry.event,
        };

        let resp = self
            .client
            .post(url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("webhook returned {}", resp.status()));
        }

        tracing::debug!(id = %entry.id, event = entry.event.kind(), "notification delivered");
        Ok(())
    }
}
