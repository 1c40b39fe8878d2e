//! Repository Pattern Implementation
//!
//! # Interview Q&A
//!
//! Q: Repository 패턴을 왜 썼는가?
//! A: 결제 엔진은 "저장소가 보장하는 것"에 정확성이 달려 있음
//!
//!    - tx_hash 유일성 (중복 입금 차단의 1차 관문)
//!    - 기간 완료의 원자성 (payment insert + 입금 연결 + due date 갱신)
//!    - derivation index 원자적 증가
//!
//!    이 계약을 trait로 명시하면:
//!    - PostgreSQL 구현(db/mod.rs)과 테스트용 in-memory 구현이 같은 계약을 지킴
//!    - 서비스 레이어 테스트에서 DB 없이 경쟁 조건/멱등성 검증 가능
//!
//! Q: trait을 세 개로 나눈 이유는?
//! A: 관심사 분리
//!    - DepositRepository: 입금 계정, 입금 트랜잭션, 기간 완료
//!    - CommissionRepository: 추천 관계, 커미션
//!    - TreasuryRepository: treasury 설정, sweep 기록, 체인 스캔 커서
//!    - OutboxRepository: 알림 outbox (상태 전이와 같은 트랜잭션에 기록)
//!
//!    서비스는 `PaymentStore`(네 trait 합집합)를 `Arc<dyn PaymentStore>`로 받음

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    Commission, CompletedPeriod, DepositAccount, NewCommission, NewDepositAccount,
    NewDepositTransaction, OutboxEntry, PaymentRecord, PeriodCompletion, SweepAttempt,
};
use crate::error::PaymentError;
use crate::services::notifications::PaymentEvent;
use crate::types::{CommissionStatus, DepositStatus, EthAddress, SweepStatus, TxHash, UsdcAmount};

pub type StoreResult<T> = Result<T, PaymentError>;

/// 입금 계정 / 입금 트랜잭션 / 결제
#[async_trait]
pub trait DepositRepository: Send + Sync {
    async fn health_check(&self) -> StoreResult<()>;

    /// 다음 derivation index를 원자적으로 할당 (read-then-write 금지)
    async fn allocate_derivation_index(&self) -> StoreResult<i64>;

    /// 입금 계정 생성. 이미 있으면 기존 계정 반환 (user당 1개)
    async fn insert_deposit_account(&self, account: &NewDepositAccount) -> StoreResult<DepositAccount>;

    async fn find_account_by_user(&self, user_id: Uuid) -> StoreResult<Option<DepositAccount>>;

    async fn find_account_by_address(&self, address: &EthAddress) -> StoreResult<Option<DepositAccount>>;

    async fn list_active_accounts(&self) -> StoreResult<Vec<DepositAccount>>;

    async fn deposit_exists(&self, tx_hash: &TxHash) -> StoreResult<bool>;

    /// 입금 기록. 같은 tx_hash가 이미 있으면 `false` (no-op)
    async fn record_deposit(&self, deposit: &NewDepositTransaction) -> StoreResult<bool>;

    async fn mark_deposit_status(&self, tx_hash: &TxHash, status: DepositStatus) -> StoreResult<()>;

    /// 아직 결제에 소비되지 않은 입금 합계 (현재 열린 기간)
    ///
    /// 완료된 결제가 있으면 소비 여부(`related_payment_id`)가 기간 경계이고,
    /// 없으면 `anchor` 이후 확정된 입금만 집계
    async fn sum_unapplied_deposits(&self, user_id: Uuid, anchor: DateTime<Utc>) -> StoreResult<UsdcAmount>;

    async fn has_recent_payment(&self, user_id: Uuid, since: DateTime<Utc>) -> StoreResult<bool>;

    /// 기간 완료 (원자적). 윈도우 내 결제가 이미 있으면 `None`
    ///
    /// 연결된 입금 합계와 초과 입금 크레딧은 lock 안에서 계산하고,
    /// 완료 알림은 같은 트랜잭션에서 outbox에 기록
    async fn complete_period(&self, completion: &PeriodCompletion) -> StoreResult<Option<CompletedPeriod>>;

    async fn find_payment(&self, payment_id: Uuid) -> StoreResult<Option<PaymentRecord>>;
}

/// 추천 관계 / 커미션
#[async_trait]
pub trait CommissionRepository: Send + Sync {
    /// referrals 테이블의 추천인
    async fn find_referrer(&self, referred_id: Uuid) -> StoreResult<Option<Uuid>>;

    /// users.referred_by 포인터 (referral edge 누락 복구용)
    async fn find_referred_by(&self, user_id: Uuid) -> StoreResult<Option<Uuid>>;

    /// referral edge 생성 (이미 있으면 no-op)
    async fn ensure_referral_edge(&self, referrer_id: Uuid, referred_id: Uuid) -> StoreResult<()>;

    async fn direct_bonus_exists(&self, referrer_id: Uuid, referred_id: Uuid) -> StoreResult<bool>;

    /// direct bonus insert. (referrer, referred) 쌍이 이미 있으면 `false`
    async fn insert_direct_bonus(&self, bonus: &NewCommission) -> StoreResult<bool>;

    /// 업라인 (가까운 순서), 최대 `max_depth`
    async fn find_upline(&self, user_id: Uuid, max_depth: usize) -> StoreResult<Vec<Uuid>>;

    /// 원자적 batch insert. 이미 있는 (payment, referrer, type)은 건너뜀.
    /// 반환값: 새로 생성된 개수
    async fn insert_commission_batch(&self, batch: &[NewCommission]) -> StoreResult<usize>;

    /// pending 상태의 초과 입금 크레딧 (관리자 검토 목록)
    async fn pending_overpayment_credits(&self) -> StoreResult<Vec<Commission>>;

    /// pending → paid | cancelled. pending이 아니면 `None`
    async fn transition_commission(&self, id: Uuid, to: CommissionStatus) -> StoreResult<Option<Commission>>;
}

/// Treasury 설정 / sweep / 체인 스캔 커서
#[async_trait]
pub trait TreasuryRepository: Send + Sync {
    async fn load_treasury_entries(&self) -> StoreResult<HashMap<String, String>>;

    async fn save_treasury_entries(&self, entries: &[(String, String)]) -> StoreResult<()>;

    /// 해당 주소의 미확정(submitted) sweep
    async fn pending_sweep(&self, address: &EthAddress) -> StoreResult<Option<SweepAttempt>>;

    async fn record_sweep_submitted(
        &self,
        tx_hash: &TxHash,
        address: &EthAddress,
        amount: UsdcAmount,
    ) -> StoreResult<()>;

    async fn finish_sweep(&self, tx_hash: &TxHash, status: SweepStatus) -> StoreResult<()>;

    async fn scan_cursor(&self) -> StoreResult<Option<u64>>;

    async fn set_scan_cursor(&self, block: u64) -> StoreResult<()>;
}

/// 알림 outbox
///
/// 전달은 at-least-once. 수신 측은 entry id로 중복 제거
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn enqueue_event(&self, event: &PaymentEvent) -> StoreResult<()>;

    /// 미전달 이벤트 (오래된 순)
    async fn pending_events(&self, limit: i64) -> StoreResult<Vec<OutboxEntry>>;

    async fn mark_event_delivered(&self, id: Uuid) -> StoreResult<()>;

    async fn record_delivery_failure(&self, id: Uuid, error: &str) -> StoreResult<()>;
}

/// 결제 엔진이 의존하는 저장소 전체
pub trait PaymentStore:
    DepositRepository + CommissionRepository + TreasuryRepository + OutboxRepository
{
}

impl<T> PaymentStore for T where
    T: DepositRepository + CommissionRepository + TreasuryRepository + OutboxRepository
{
}

// PostgreSQL 구현은 db/mod.rs의 Database 구조체에 있음
// 테스트용 Mock 구현:
