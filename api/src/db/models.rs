//! Database Models
//!
//! Rows for deposit accounts, observed on-chain deposits, completed payments,
//! commissions and sweep attempts. Amounts are NUMERIC (`UsdcAmount`), never floats.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::notifications::PaymentEvent;
use crate::types::{
    CommissionStatus, CommissionType, DepositStatus, EthAddress, PaymentSchedule, PaymentType,
    SweepStatus, TxHash, UsdcAmount,
};

/// 사용자별 영구 입금 계정
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DepositAccount {
    pub user_id: Uuid,

    /// HD 파생 입금 주소 (한 번 설정되면 불변)
    pub deposit_address: EthAddress,

    /// `.../0/{index}` 파생 인덱스 (전역 유일)
    pub derivation_index: i64,

    pub payment_schedule: PaymentSchedule,

    /// 최초 unlock 결제 완료 여부
    pub initial_payment_completed: bool,

    /// 현재 기간 시작 (period anchor). 없으면 epoch부터 누적
    pub previous_period_due_date: Option<DateTime<Utc>>,

    pub next_period_due_date: Option<DateTime<Utc>>,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
}

/// 입금 계정 생성 요청
#[derive(Debug, Clone)]
pub struct NewDepositAccount {
    pub user_id: Uuid,
    pub deposit_address: EthAddress,
    pub derivation_index: i64,
    pub payment_schedule: PaymentSchedule,
}

/// 관측된 온체인 입금 1건
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DepositTransaction {
    /// 전역 유일 (멱등성 키)
    pub tx_hash: TxHash,
    pub from_address: EthAddress,
    pub to_address: EthAddress,
    pub amount_usdc: UsdcAmount,
    pub status: DepositStatus,
    pub user_id: Uuid,
    pub block_number: i64,
    pub confirmed_at: DateTime<Utc>,

    /// 완료된 결제에 소비되면 설정 (재집계 방지)
    pub related_payment_id: Option<Uuid>,
}

/// Insert-ready deposit (no `related_payment_id`).
#[derive(Debug, Clone)]
pub struct NewDepositTransaction {
    pub tx_hash: TxHash,
    pub from_address: EthAddress,
    pub to_address: EthAddress,
    pub amount_usdc: UsdcAmount,
    pub user_id: Uuid,
    pub block_number: i64,
    pub confirmed_at: DateTime<Utc>,
}

/// 완료된 결제 (기간당 정확히 1건)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: UsdcAmount,
    pub payment_type: PaymentType,
    /// 항상 "succeeded"
    pub status: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: DateTime<Utc>,
    pub trigger_tx_hash: TxHash,
    pub created_at: DateTime<Utc>,
}

/// 커미션/보너스
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Commission {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub commission_type: CommissionType,
    pub amount: UsdcAmount,
    pub status: CommissionStatus,
    /// residual 업라인 깊이 (1 = 직접 추천인)
    pub level: Option<i32>,
    pub payment_id: Option<Uuid>,
    /// 초과 입금이 허용 오차를 넘으면 관리자 검토 필요
    pub requires_admin_review: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCommission {
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub commission_type: CommissionType,
    pub amount: UsdcAmount,
    pub level: Option<i32>,
    pub payment_id: Option<Uuid>,
    pub requires_admin_review: bool,
}

/// 초과 입금 크레딧
#[derive(Debug, Clone, PartialEq)]
pub struct OverpaymentCredit {
    pub amount: UsdcAmount,
    pub requires_admin_review: bool,
}

impl OverpaymentCredit {
    /// 실제로 연결된 입금 합계 기준. 초과분이 없으면 `None`
    pub fn assess(expected: UsdcAmount, paid: UsdcAmount, tolerance: UsdcAmount) -> Option<Self> {
        let overpaid = paid.saturating_sub(expected);
        (!overpaid.is_zero()).then(|| Self {
            amount: overpaid,
            requires_admin_review: overpaid > tolerance,
        })
    }
}

/// 기간 완료 처리 (하나의 트랜잭션으로 적용)
///
/// 1. 계정 row lock
/// 2. 최근 결제 재확인 (있으면 아무것도 하지 않음)
/// 3. payment insert
/// 4. 미소비 입금에 payment id 연결 + lock 안에서 합계 재계산
/// 5. due date 갱신 + initial_payment_completed
/// 6. 초과 입금 크레딧 insert (재계산된 합계 기준)
/// 7. 알림 outbox insert
#[derive(Debug, Clone)]
pub struct PeriodCompletion {
    pub user_id: Uuid,
    pub payment_type: PaymentType,
    /// 기간 요금 (payment 금액)
    pub amount: UsdcAmount,
    pub tolerance: UsdcAmount,
    /// 완료된 결제가 아직 없는 계정에만 적용되는 집계 하한
    pub period_anchor: DateTime<Utc>,
    pub period_start: Option<DateTime<Utc>>,
    pub new_previous_due: DateTime<Utc>,
    pub new_next_due: DateTime<Utc>,
    pub trigger_tx_hash: TxHash,
    pub recent_window_start: DateTime<Utc>,
}

/// 완료 결과. `paid`는 결제에 실제로 연결된 입금 합계
#[derive(Debug, Clone)]
pub struct CompletedPeriod {
    pub payment: PaymentRecord,
    pub paid: UsdcAmount,
    pub overpayment: Option<OverpaymentCredit>,
}

/// 전달 대기 중인 알림
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event: PaymentEvent,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// Sweep 시도 기록
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SweepAttempt {
    pub tx_hash: TxHash,
    pub deposit_address: EthAddress,
    pub amount: UsdcAmount,
    pub status: SweepStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
