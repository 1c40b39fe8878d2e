//! Period Reconciliation Engine
//!
//! # Interview Q&A
//!
//! Q: webhook과 cron이 같은 전송을 동시에 처리하면?
//! A: "at-least-once 전달 + 멱등 소비자" 모델
//!
//!    ```text
//!    webhook ──┐                      ┌─ tx_hash 유일성 (ON CONFLICT DO NOTHING)
//!              ├─▶ process_transfer ──┤
//!    cron ─────┘                      └─ 24h 최근 결제 가드 (트랜잭션 밖 + 안, 두 번)
//!    ```
//!
//!    - 같은 tx_hash: 한쪽만 insert 성공, 다른 쪽은 Duplicate
//!    - 다른 tx_hash로 같은 기간이 동시에 완료: 계정 row lock + 재확인으로 payment 1건
//!
//! Q: 입금 기록에 실패하면?
//! A: fail closed. 에러를 반환하고 아무 상태도 바꾸지 않음 (제공자가 재전송)
//!
//! Q: 부분 입금은 어떻게 누적되는가?
//! A: 아직 결제에 소비되지 않은 입금의 합
//!    - 완료 시 집계된 입금에 payment id를 연결 → 다음 기간에 재집계되지 않음
//!    - 완료 후 다음 due date 전에 들어온 입금은 다음 기간으로 이월 (버려지지 않음)
//!    - 결제 이력이 없는 계정만 anchor(previous_period_due_date) 이후 입금으로 제한
//!
//! Q: 합계를 읽은 뒤 완료 전에 다른 입금이 들어오면?
//! A: store가 계정 lock 안에서 실제로 연결한 입금으로 합계와 초과분을 다시 계산

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::PaymentPolicy;
use crate::db::{CompletedPeriod, DepositAccount, NewDepositTransaction, PaymentStore, PeriodCompletion};
use crate::error::PaymentError;
use crate::types::{DepositStatus, PaymentType, TxHash, UsdcAmount};

use super::commission::CommissionDistributor;
use super::deposit_matcher::{obligation, DepositMatch, DepositMatcher, MatchOutcome};
use super::notifications::{NotificationHub, PartialPayment, PaymentEvent};
use super::period::{evaluate, period_anchor, roll_forward, PeriodState};
use super::usdc_client::ParsedTransfer;

/// 전송 1건 처리 결과 (에러가 아닌 정상 결과들)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Duplicate {
        tx_hash: TxHash,
    },
    Unmatched {
        tx_hash: TxHash,
    },
    /// 기록됐지만 현재 기간 집계에 들어가지 않음 (anchor 이전 입금)
    CarriedForward {
        user_id: Uuid,
        tx_hash: TxHash,
    },
    Partial {
        user_id: Uuid,
        payment_type: PaymentType,
        paid: UsdcAmount,
        expected: UsdcAmount,
        remaining: UsdcAmount,
    },
    Completed {
        user_id: Uuid,
        payment_id: Uuid,
        payment_type: PaymentType,
        amount: UsdcAmount,
        overpaid: UsdcAmount,
    },
    /// 최근 24h 내 결제가 이미 있음 (입금은 기록됨, 다음 기간에 집계)
    AlreadyCompleted {
        user_id: Uuid,
    },
}

/// 관리자 조회용 기간 상태
#[derive(Debug, Clone, Serialize)]
pub struct PeriodStatus {
    pub user_id: Uuid,
    pub payment_type: PaymentType,
    pub initial_payment_completed: bool,
    #[serde(flatten)]
    pub state: PeriodState,
    pub expected: UsdcAmount,
    pub paid: UsdcAmount,
    pub period_anchor: Option<DateTime<Utc>>,
    pub next_due_date: Option<DateTime<Utc>>,
}

pub struct PeriodReconciler {
    store: Arc<dyn PaymentStore>,
    matcher: DepositMatcher,
    commissions: Arc<CommissionDistributor>,
    events: NotificationHub,
    policy: PaymentPolicy,
}

impl PeriodReconciler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        commissions: Arc<CommissionDistributor>,
        events: NotificationHub,
        policy: PaymentPolicy,
    ) -> Self {
        Self {
            matcher: DepositMatcher::new(store.clone(), policy.clone()),
            store,
            commissions,
            events,
            policy,
        }
    }

    /// 여러 건 순서대로 처리. 첫 에러에서 중단 (재전송 시 처리된 건은 Duplicate)
    pub async fn process_all(&self, transfers: &[ParsedTransfer]) -> Result<Vec<ReconcileOutcome>, PaymentError> {
        let mut outcomes = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            outcomes.push(self.process_transfer(transfer).await?);
        }
        Ok(outcomes)
    }

    pub async fn process_transfer(&self, transfer: &ParsedTransfer) -> Result<ReconcileOutcome, PaymentError> {
        let DepositMatch {
            account,
            payment_type,
            expected_amount,
        } = match self.matcher.match_transfer(transfer).await? {
            MatchOutcome::Matched(m) => m,
            MatchOutcome::Duplicate => {
                return Ok(ReconcileOutcome::Duplicate {
                    tx_hash: transfer.tx_hash.clone(),
                })
            }
            MatchOutcome::Unmatched => {
                return Ok(ReconcileOutcome::Unmatched {
                    tx_hash: transfer.tx_hash.clone(),
                })
            }
        };

        // 1. 입금 기록 (fail closed)
        let inserted = self
            .store
            .record_deposit(&NewDepositTransaction {
                tx_hash: transfer.tx_hash.clone(),
                from_address: transfer.from.clone(),
                to_address: transfer.to.clone(),
                amount_usdc: transfer.amount,
                user_id: account.user_id,
                block_number: transfer.block_number as i64,
                confirmed_at: transfer.confirmed_at,
            })
            .await
            .map_err(|e| {
                tracing::error!(tx_hash = %transfer.tx_hash, error = %e, "failed to record deposit");
                e
            })?;

        if !inserted {
            // 동시 처리에서 다른 쪽이 먼저 기록함
            return Ok(ReconcileOutcome::Duplicate {
                tx_hash: transfer.tx_hash.clone(),
            });
        }

        tracing::info!(
            user_id = %account.user_id,
            tx_hash = %transfer.tx_hash,
            amount = %transfer.amount,
            payment_type = ?payment_type,
            "deposit recorded"
        );

        // 2. 기간 누적
        let anchor = period_anchor(account.previous_period_due_date);
        let paid = self.store.sum_unapplied_deposits(account.user_id, anchor).await?;
        let tolerance = self.policy.tolerance(expected_amount);

        match evaluate(expected_amount, paid, tolerance) {
            PeriodState::Complete { .. } => {
                self.complete_period(&account, payment_type, expected_amount, anchor, transfer)
                    .await
            }
            PeriodState::NoFundsReceived => {
                tracing::info!(
                    user_id = %account.user_id,
                    tx_hash = %transfer.tx_hash,
                    anchor = %anchor,
                    "deposit predates the open period; left unapplied"
                );
                Ok(ReconcileOutcome::CarriedForward {
                    user_id: account.user_id,
                    tx_hash: transfer.tx_hash.clone(),
                })
            }
            PeriodState::Partial { remaining } => {
                self.store
                    .mark_deposit_status(&transfer.tx_hash, DepositStatus::Partial)
                    .await?;

                tracing::info!(
                    user_id = %account.user_id,
                    paid = %paid,
                    expected = %expected_amount,
                    remaining = %remaining,
                    "partial payment"
                );
                self.events.publish(PaymentEvent::PartialPayment(PartialPayment {
                    user_id: account.user_id,
                    payment_type,
                    paid,
                    expected: expected_amount,
                    remaining,
                    tx_hash: transfer.tx_hash.clone(),
                }))
                .await?;

                Ok(ReconcileOutcome::Partial {
                    user_id: account.user_id,
                    payment_type,
                    paid,
                    expected: expected_amount,
                    remaining,
                })
            }
        }
    }

    async fn complete_period(
        &self,
        account: &DepositAccount,
        payment_type: PaymentType,
        expected: UsdcAmount,
        anchor: DateTime<Utc>,
        transfer: &ParsedTransfer,
    ) -> Result<ReconcileOutcome, PaymentError> {
        let user_id = account.user_id;
        let now = Utc::now();
        let window_start = now - self.policy.recent_payment_window;

        // 3. 최근 결제 가드 (1차, 트랜잭션 밖)
        if self.store.has_recent_payment(user_id, window_start).await? {
            tracing::info!(%user_id, tx_hash = %transfer.tx_hash, "payment within recent window exists; completion skipped");
            return Ok(ReconcileOutcome::AlreadyCompleted { user_id });
        }

        // 4. due date 전진 (예정일 기준)
        let due = roll_forward(account.payment_schedule, account.next_period_due_date, now)?;
        let completion = PeriodCompletion {
            user_id,
            payment_type,
            amount: expected,
            tolerance: self.policy.tolerance(expected),
            period_anchor: anchor,
            period_start: Some(due.previous),
            new_previous_due: due.previous,
            new_next_due: due.next,
            trigger_tx_hash: transfer.tx_hash.clone(),
            recent_window_start: window_start,
        };

        // 5. 원자적 완료 (가드 재확인, 합계 재계산, 알림 outbox 기록)
        let Some(CompletedPeriod { payment, paid, overpayment }) = self.store.complete_period(&completion).await? else {
            tracing::info!(%user_id, "concurrent completion won the race; skipped");
            return Ok(ReconcileOutcome::AlreadyCompleted { user_id });
        };

        tracing::info!(
            %user_id,
            payment_id = %payment.id,
            payment_type = ?payment_type,
            paid = %paid,
            next_due = %due.next,
            "period completed"
        );

        self.events.wake();

        if let Some(credit) = overpayment.as_ref().filter(|c| c.requires_admin_review) {
            tracing::warn!(%user_id, overpaid = %credit.amount, "overpayment exceeds tolerance; flagged for review");
        }

        // 6. 커미션 분배. 실패해도 결제는 확정 (관리자 redistribute로 복구)
        if let Err(e) = self.commissions.distribute(&payment).await {
            tracing::error!(
                %user_id,
                payment_id = %payment.id,
                error = %e,
                "commission distribution failed; use redistribute to repair"
            );
        }

        Ok(ReconcileOutcome::Completed {
            user_id,
            payment_id: payment.id,
            payment_type,
            amount: payment.amount,
            overpaid: overpayment.map(|c| c.amount).unwrap_or(UsdcAmount::ZERO),
        })
    }

    /// 사용자의 현재 기간 상태 (읽기 전용)
    pub async fn period_status(&self, user_id: Uuid) -> Result<PeriodStatus, PaymentError> {
        let account = self
            .store
            .find_account_by_user(user_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("deposit account for user {}", user_id)))?;

        let (payment_type, expected) = obligation(&account, &self.policy);
        let paid = self
            .store
            .sum_unapplied_deposits(user_id, period_anchor(account.previous_period_due_date))
            .await?;

        Ok(PeriodStatus {
            user_id,
            payment_type,
            initial_payment_completed: account.initial_payment_completed,
            state: evaluate(expected, paid, self.policy.tolerance(expected)),
            expected,
            paid,
            period_anchor: account.previous_period_due_date,
            next_due_date: account.next_period_due_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MemoryStore;
    use crate::services::commission::fixtures::RecordingNetwork;
    use crate::services::deposit_matcher::fixtures::{account, address, transfer};
    use crate::types::{CommissionType, PaymentSchedule};
    use crate::db::DepositRepository;
    use chrono::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        reconciler: Arc<PeriodReconciler>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let hub = NotificationHub::new(store.clone());
        let commissions = Arc::new(CommissionDistributor::new(
            store.clone(),
            Arc::new(RecordingNetwork::default()),
            PaymentPolicy::default(),
        ));
        let reconciler = Arc::new(PeriodReconciler::new(
            store.clone(),
            commissions,
            hub,
            PaymentPolicy::default(),
        ));
        Harness { store, reconciler }
    }

    /// unlock 완료, 주간 구독 중인 사용자 (기간 시작 3일 전)
    fn weekly_subscriber(h: &Harness, index: i64) -> DepositAccount {
        let mut acct = account(Uuid::new_v4(), index, PaymentSchedule::Weekly);
        acct.initial_payment_completed = true;
        acct.previous_period_due_date = Some(Utc::now() - Duration::days(3));
        acct.next_period_due_date = Some(Utc::now() + Duration::days(4));
        h.store.put_account(acct.clone());
        acct
    }

    fn amount(s: &str) -> UsdcAmount {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let h = harness();
        let referrer = Uuid::new_v4();
        let acct = account(Uuid::new_v4(), 0, PaymentSchedule::Weekly);
        h.store.put_account(acct.clone());
        h.store.add_referral(referrer, acct.user_id);

        let t = transfer(1, &acct.deposit_address, "99", Utc::now());
        let first = h.reconciler.process_transfer(&t).await.unwrap();
        assert!(matches!(first, ReconcileOutcome::Completed { .. }));

        for _ in 0..3 {
            let again = h.reconciler.process_transfer(&t).await.unwrap();
            assert_eq!(again, ReconcileOutcome::Duplicate { tx_hash: t.tx_hash.clone() });
        }

        assert_eq!(h.store.deposits().len(), 1);
        assert_eq!(h.store.payments().len(), 1);
        assert_eq!(h.store.commissions().len(), 1);
        let completed = h.store.outbox()
            .into_iter()
            .filter(|e| matches!(e, PaymentEvent::PaymentCompleted(_)))
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_first_unlock_starts_schedule() {
        let h = harness();
        let referrer = Uuid::new_v4();
        let acct = account(Uuid::new_v4(), 0, PaymentSchedule::Weekly);
        h.store.put_account(acct.clone());
        h.store.add_referral(referrer, acct.user_id);

        let outcome = h
            .reconciler
            .process_transfer(&transfer(1, &acct.deposit_address, "99", Utc::now()))
            .await
            .unwrap();

        match outcome {
            ReconcileOutcome::Completed { payment_type, amount: paid, .. } => {
                assert_eq!(payment_type, PaymentType::InitialUnlock);
                assert_eq!(paid, amount("99"));
            }
            other => panic!("Expected Completed, got {:?}", other),
        }

        let updated = h.store.account(acct.user_id).unwrap();
        assert!(updated.initial_payment_completed);
        let previous = updated.previous_period_due_date.unwrap();
        assert_eq!(updated.next_period_due_date.unwrap() - previous, Duration::days(7));

        let bonus = &h.store.commissions()[0];
        assert_eq!(bonus.commission_type, CommissionType::DirectBonus);
        assert_eq!(bonus.referrer_id, referrer);
    }

    #[tokio::test]
    async fn test_partial_then_complete_accumulates() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);
        let scheduled_next = acct.next_period_due_date.unwrap();
        let at = Utc::now() - Duration::hours(1);

        let outcome = h
            .reconciler
            .process_transfer(&transfer(1, &acct.deposit_address, "49.00", at))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Partial {
                user_id: acct.user_id,
                payment_type: PaymentType::WeeklySubscription,
                paid: amount("49.00"),
                expected: amount("49.75"),
                remaining: amount("0.75"),
            }
        );
        assert_eq!(h.store.deposits()[0].status, DepositStatus::Partial);

        let outcome = h
            .reconciler
            .process_transfer(&transfer(2, &acct.deposit_address, "0.75", at))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Completed { overpaid, .. } if overpaid.is_zero()));

        let payment = &h.store.payments()[0];
        assert_eq!(payment.amount, amount("49.75"));
        assert_eq!(payment.payment_type, PaymentType::WeeklySubscription);
        assert!(h
            .store
            .deposits()
            .iter()
            .all(|d| d.related_payment_id == Some(payment.id) && d.status == DepositStatus::Confirmed));

        // 예정일 기준 전진
        let updated = h.store.account(acct.user_id).unwrap();
        assert_eq!(updated.previous_period_due_date, Some(scheduled_next));
        assert_eq!(updated.next_period_due_date, Some(scheduled_next + Duration::days(7)));

        let kinds: Vec<_> = h.store.outbox().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["partial_payment", "payment_completed"]);
    }

    #[tokio::test]
    async fn test_within_tolerance_completes_without_credit() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);

        let outcome = h
            .reconciler
            .process_transfer(&transfer(1, &acct.deposit_address, "49.50", Utc::now()))
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Completed { .. }));
        assert!(h
            .store
            .commissions()
            .iter()
            .all(|c| c.commission_type != CommissionType::OverpaymentCredit));
    }

    #[tokio::test]
    async fn test_overpayment_credit() {
        let h = harness();
        let small = weekly_subscriber(&h, 1);
        let large = weekly_subscriber(&h, 2);

        h.reconciler
            .process_transfer(&transfer(1, &small.deposit_address, "50.00", Utc::now()))
            .await
            .unwrap();
        h.reconciler
            .process_transfer(&transfer(2, &large.deposit_address, "60.00", Utc::now()))
            .await
            .unwrap();

        let credits: Vec<_> = h
            .store
            .commissions()
            .into_iter()
            .filter(|c| c.commission_type == CommissionType::OverpaymentCredit)
            .collect();
        assert_eq!(credits.len(), 2);

        let small_credit = credits.iter().find(|c| c.referred_id == small.user_id).unwrap();
        assert_eq!(small_credit.amount, amount("0.25"));
        assert!(!small_credit.requires_admin_review);

        let large_credit = credits.iter().find(|c| c.referred_id == large.user_id).unwrap();
        assert_eq!(large_credit.amount, amount("10.25"));
        assert!(large_credit.requires_admin_review);
        assert_eq!(large_credit.referrer_id, large.user_id);

        let flagged: Vec<_> = h.store.outbox()
            .into_iter()
            .filter_map(|e| match e {
                PaymentEvent::OverpaymentFlagged(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].user_id, large.user_id);
    }

    #[tokio::test]
    async fn test_recent_payment_guard() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);

        h.reconciler
            .process_transfer(&transfer(1, &acct.deposit_address, "49.75", Utc::now()))
            .await
            .unwrap();
        let outcome = h
            .reconciler
            .process_transfer(&transfer(2, &acct.deposit_address, "49.75", Utc::now()))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::AlreadyCompleted { user_id: acct.user_id });
        assert_eq!(h.store.payments().len(), 1);
        // 두 번째 입금은 기록되고 다음 기간을 위해 남아 있음
        assert_eq!(h.store.deposits().len(), 2);
        assert!(h.store.deposits().iter().any(|d| d.related_payment_id.is_none()));
    }

    #[tokio::test]
    async fn test_concurrent_completions_create_one_payment() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);
        let t1 = transfer(1, &acct.deposit_address, "49.75", Utc::now());
        let t2 = transfer(2, &acct.deposit_address, "49.75", Utc::now());

        let (a, b) = tokio::join!(
            h.reconciler.process_transfer(&t1),
            h.reconciler.process_transfer(&t2)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(h.store.payments().len(), 1);
        assert_eq!(h.store.deposits().len(), 2);
    }

    #[tokio::test]
    async fn test_record_failure_fails_closed() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);
        h.store.fail_deposit_inserts(true);

        let result = h
            .reconciler
            .process_transfer(&transfer(1, &acct.deposit_address, "49.75", Utc::now()))
            .await;

        assert!(matches!(result, Err(PaymentError::Storage(_))));
        assert!(h.store.payments().is_empty());
        assert!(h.store.outbox().is_empty());
        assert!(h.store.account(acct.user_id).unwrap().next_period_due_date == acct.next_period_due_date);
    }

    #[tokio::test]
    async fn test_unmatched_transfer_ignored() {
        let h = harness();
        let t = transfer(1, &address(0x5555), "49.75", Utc::now());

        let outcome = h.reconciler.process_transfer(&t).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unmatched { tx_hash: t.tx_hash.clone() });
        assert!(h.store.deposits().is_empty());
    }

    #[tokio::test]
    async fn test_deposits_before_anchor_not_counted() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);
        let before_anchor = acct.previous_period_due_date.unwrap() - Duration::hours(1);

        let early = transfer(1, &acct.deposit_address, "49.75", before_anchor);
        let outcome = h.reconciler.process_transfer(&early).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::CarriedForward { user_id: acct.user_id, tx_hash: early.tx_hash.clone() }
        );
        assert!(h.store.outbox().is_empty());

        // 현재 기간은 기간 안의 입금만으로 완료
        let outcome = h
            .reconciler
            .process_transfer(&transfer(2, &acct.deposit_address, "49.75", Utc::now()))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Completed { overpaid, .. } if overpaid.is_zero()));

        // anchor 이전 입금은 버려지지 않고 다음 기간으로 이월
        let status = h.reconciler.period_status(acct.user_id).await.unwrap();
        assert_eq!(status.paid, amount("49.75"));
        let carried = h.store.deposits().into_iter().find(|d| d.tx_hash == early.tx_hash).unwrap();
        assert!(carried.related_payment_id.is_none());
    }

    #[tokio::test]
    async fn test_early_payment_counts_toward_next_period() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);
        let scheduled_next = acct.next_period_due_date.unwrap();

        h.reconciler
            .process_transfer(&transfer(1, &acct.deposit_address, "49.75", Utc::now()))
            .await
            .unwrap();
        h.store.backdate_payments(Duration::days(2));

        // 완료 직후, 다음 due date 이전의 입금
        let outcome = h
            .reconciler
            .process_transfer(&transfer(2, &acct.deposit_address, "49.75", Utc::now()))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Completed { .. }));

        assert_eq!(h.store.payments().len(), 2);
        assert!(h.store.deposits().iter().all(|d| d.related_payment_id.is_some()));
        let updated = h.store.account(acct.user_id).unwrap();
        assert_eq!(updated.previous_period_due_date, Some(scheduled_next + Duration::days(7)));
        assert_eq!(updated.next_period_due_date, Some(scheduled_next + Duration::days(14)));
    }

    #[tokio::test]
    async fn test_completion_credits_deposits_recorded_after_sum() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);
        let anchor = acct.previous_period_due_date.unwrap();

        let first = transfer(1, &acct.deposit_address, "49.75", Utc::now());
        let second = transfer(2, &acct.deposit_address, "20.00", Utc::now());
        for t in [&first, &second] {
            h.store
                .record_deposit(&NewDepositTransaction {
                    tx_hash: t.tx_hash.clone(),
                    from_address: t.from.clone(),
                    to_address: t.to.clone(),
                    amount_usdc: t.amount,
                    user_id: acct.user_id,
                    block_number: t.block_number as i64,
                    confirmed_at: t.confirmed_at,
                })
                .await
                .unwrap();
        }

        // 합계는 첫 입금만 본 상태에서 읽었다고 가정
        let now = Utc::now();
        let completed = h
            .store
            .complete_period(&PeriodCompletion {
                user_id: acct.user_id,
                payment_type: PaymentType::WeeklySubscription,
                amount: amount("49.75"),
                tolerance: amount("0.50"),
                period_anchor: anchor,
                period_start: Some(anchor),
                new_previous_due: acct.next_period_due_date.unwrap(),
                new_next_due: acct.next_period_due_date.unwrap() + Duration::days(7),
                trigger_tx_hash: first.tx_hash.clone(),
                recent_window_start: now - Duration::hours(24),
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(completed.paid, amount("69.75"));
        let credit = completed.overpayment.unwrap();
        assert_eq!(credit.amount, amount("20.00"));
        assert!(credit.requires_admin_review);
        assert!(h
            .store
            .deposits()
            .iter()
            .all(|d| d.related_payment_id == Some(completed.payment.id)));

        let kinds: Vec<_> = h.store.outbox().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["payment_completed", "overpayment_flagged"]);
    }

    #[tokio::test]
    async fn test_period_status_read_model() {
        let h = harness();
        let acct = weekly_subscriber(&h, 1);
        h.reconciler
            .process_transfer(&transfer(1, &acct.deposit_address, "20", Utc::now()))
            .await
            .unwrap();

        let status = h.reconciler.period_status(acct.user_id).await.unwrap();
        assert_eq!(status.paid, amount("20"));
        assert_eq!(status.expected, amount("49.75"));
        assert_eq!(status.state, PeriodState::Partial { remaining: amount("29.75") });

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "partial");

        let missing = h.reconciler.period_status(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(PaymentError::NotFound(_))));
    }
}
