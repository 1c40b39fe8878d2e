//! Deposit Matcher
//!
//! 수신 전송 → (사용자, 결제 종류, 기대 금액).
//!
//! 순서가 중요함:
//! 1. tx_hash 중복 확인 (어떤 상태 변경보다 먼저)
//! 2. 수신 주소 → 입금 계정 (없으면 무시, 대부분의 체인 활동은 무관함)
//! 3. 의무 결정: unlock 미완료면 unlock fee, 아니면 저장된 schedule의 구독료

use std::sync::Arc;

use crate::config::PaymentPolicy;
use crate::db::{DepositAccount, PaymentStore};
use crate::error::PaymentError;
use crate::types::{PaymentType, UsdcAmount};

use super::usdc_client::ParsedTransfer;

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    /// 이미 처리된 tx_hash (성공으로 간주, no-op)
    Duplicate,
    /// 우리 입금 주소가 아님 또는 비활성 계정
    Unmatched,
    Matched(DepositMatch),
}

#[derive(Debug, Clone)]
pub struct DepositMatch {
    pub account: DepositAccount,
    pub payment_type: PaymentType,
    pub expected_amount: UsdcAmount,
}

/// 계정 상태로부터 이번 기간 의무 결정
///
/// 구독 등급은 저장된 `payment_schedule`에서만 결정 (입금액으로 추론하지 않음)
pub fn obligation(account: &DepositAccount, policy: &PaymentPolicy) -> (PaymentType, UsdcAmount) {
    let payment_type = if account.initial_payment_completed {
        account.payment_schedule.subscription_type()
    } else {
        PaymentType::InitialUnlock
    };
    (payment_type, policy.expected_amount(payment_type))
}

pub struct DepositMatcher {
    store: Arc<dyn PaymentStore>,
    policy: PaymentPolicy,
}

impl DepositMatcher {
    pub fn new(store: Arc<dyn PaymentStore>, policy: PaymentPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn match_transfer(&self, transfer: &ParsedTransfer) -> Result<MatchOutcome, PaymentError> {
        if self.store.deposit_exists(&transfer.tx_hash).await? {
            tracing::debug!(tx_hash = %transfer.tx_hash, "duplicate transfer ignored");
            return Ok(MatchOutcome::Duplicate);
        }

        let Some(account) = self.store.find_account_by_address(&transfer.to).await? else {
            return Ok(MatchOutcome::Unmatched);
        };

        if !account.is_active {
            tracing::warn!(
                user_id = %account.user_id,
                tx_hash = %transfer.tx_hash,
                "transfer to inactive deposit account ignored"
            );
            return Ok(MatchOutcome::Unmatched);
        }

        let (payment_type, expected_amount) = obligation(&account, &self.policy);
        Ok(MatchOutcome::Matched(DepositMatch {
            account,
            payment_type,
            expected_amount,
        }))
    }
}
