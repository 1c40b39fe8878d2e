//! Database Module
//!
//! # Interview Q&A
//!
//! Q: 왜 PostgreSQL을 선택했는가?
//! A: 결제 정합성에 필요한 기능이 전부 있음
//!
//!    1. ACID 트랜잭션: 기간 완료(payment + 입금 연결 + due date)를 한 번에
//!    2. UNIQUE / ON CONFLICT: tx_hash 중복 입금을 저장소 레벨에서 차단
//!    3. SELECT ... FOR UPDATE: webhook과 cron이 같은 사용자를 동시에 완료시키는 경쟁 방지
//!    4. NUMERIC: 금액을 부동소수점 없이 저장
//!
//! Q: webhook과 cron이 같은 입금을 동시에 처리하면?
//! A: 2중 방어
//!
//!    ```text
//!    webhook ──┐                  ┌─ INSERT ... ON CONFLICT (tx_hash) DO NOTHING
//!              ├─▶ record_deposit ┤   → 한쪽만 true
//!    cron ─────┘                  └─ 다른 쪽은 Duplicate (no-op)
//!
//!    서로 다른 tx가 같은 기간을 동시에 채우는 경우:
//!    complete_period → 계정 row FOR UPDATE → 최근 24h 결제 재확인 → 한쪽만 생성
//!    ```
//!
//! Q: 커넥션 풀은 어떻게 관리하는가?
//! A: SQLx의 PgPool 사용
//!    - 최소/최대 커넥션 수 설정
//!    - 커넥션 재사용 (오버헤드 감소)
//!    - 타임아웃 처리

mod models;
mod repository;

pub use models::*;
pub use repository::{
    CommissionRepository, DepositRepository, OutboxRepository, PaymentStore, StoreResult,
    TreasuryRepository,
};

#[cfg(test)]
pub use repository::mock;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::services::notifications::{completion_events, PaymentEvent};
use crate::types::{CommissionStatus, CommissionType, DepositStatus, EthAddress, SweepStatus, TxHash, UsdcAmount};

const ACCOUNT_COLUMNS: &str = r#"
    user_id, deposit_address, derivation_index, payment_schedule,
    initial_payment_completed, previous_period_due_date, next_period_due_date,
    is_active, created_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, user_id, amount, payment_type, status, period_start, period_end,
    trigger_tx_hash, created_at
"#;

const COMMISSION_COLUMNS: &str = r#"
    id, referrer_id, referred_id, commission_type, amount, status, level,
    payment_id, requires_admin_review, paid_at, created_at
"#;

/// 데이터베이스 연결 및 쿼리 담당
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 데이터베이스 연결
    ///
    /// # Connection Pool Settings
    ///
    /// - max_connections: 10 (트래픽에 따라 조정)
    /// - min_connections: 1 (idle 시 최소 유지)
    /// - acquire_timeout: 3초 (커넥션 획득 대기)
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// 마이그레이션 실행
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DepositRepository for Database {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 단일 row UPDATE ... RETURNING → row lock 하에서 원자적 증가
    async fn allocate_derivation_index(&self) -> StoreResult<i64> {
        let index: i64 = sqlx::query_scalar(
            r#"
            UPDATE derivation_counter
            SET next_index = next_index + 1
            WHERE id = 1
            RETURNING next_index - 1
            "#
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(index)
    }

    async fn insert_deposit_account(&self, account: &NewDepositAccount) -> StoreResult<DepositAccount> {
        let inserted = sqlx::query_as::<_, DepositAccount>(&format!(
            r#"
            INSERT INTO deposit_accounts (user_id, deposit_address, derivation_index, payment_schedule)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(account.user_id)
        .bind(&account.deposit_address)
        .bind(account.derivation_index)
        .bind(account.payment_schedule)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(row),
            // 동시 생성 경쟁에서 진 경우: 먼저 만들어진 계정을 반환
            None => self
                .find_account_by_user(account.user_id)
                .await?
                .ok_or_else(|| PaymentError::NotFound(format!("deposit account {}", account.user_id))),
        }
    }

    async fn find_account_by_user(&self, user_id: Uuid) -> StoreResult<Option<DepositAccount>> {
        let account = sqlx::query_as::<_, DepositAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM deposit_accounts WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_account_by_address(&self, address: &EthAddress) -> StoreResult<Option<DepositAccount>> {
        let account = sqlx::query_as::<_, DepositAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM deposit_accounts WHERE deposit_address = $1"
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn list_active_accounts(&self) -> StoreResult<Vec<DepositAccount>> {
        let accounts = sqlx::query_as::<_, DepositAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM deposit_accounts WHERE is_active ORDER BY derivation_index"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn deposit_exists(&self, tx_hash: &TxHash) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM deposit_transactions WHERE tx_hash = $1)"
        )
        .bind(tx_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn record_deposit(&self, deposit: &NewDepositTransaction) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO deposit_transactions (
                tx_hash, from_address, to_address, amount_usdc, status,
                user_id, block_number, confirmed_at
            )
            VALUES ($1, $2, $3, $4, 'confirmed', $5, $6, $7)
            ON CONFLICT (tx_hash) DO NOTHING
            "#
        )
        .bind(&deposit.tx_hash)
        .bind(&deposit.from_address)
        .bind(&deposit.to_address)
        .bind(deposit.amount_usdc)
        .bind(deposit.user_id)
        .bind(deposit.block_number)
        .bind(deposit.confirmed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_deposit_status(&self, tx_hash: &TxHash, status: DepositStatus) -> StoreResult<()> {
        sqlx::query("UPDATE deposit_transactions SET status = $2 WHERE tx_hash = $1")
            .bind(tx_hash)
            .bind(status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn sum_unapplied_deposits(&self, user_id: Uuid, anchor: DateTime<Utc>) -> StoreResult<UsdcAmount> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(d.amount_usdc), 0)
            FROM deposit_transactions d
            WHERE d.user_id = $1
              AND d.related_payment_id IS NULL
              AND d.status <> 'failed'
              AND (
                  d.confirmed_at > $2
                  OR EXISTS (SELECT 1 FROM payments p WHERE p.user_id = $1)
              )
            "#
        )
        .bind(user_id)
        .bind(anchor)
        .fetch_one(&self.pool)
        .await?;

        UsdcAmount::new(total)
    }

    async fn has_recent_payment(&self, user_id: Uuid, since: DateTime<Utc>) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM payments
                WHERE user_id = $1 AND status = 'succeeded' AND created_at >= $2
            )
            "#
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn complete_period(&self, completion: &PeriodCompletion) -> StoreResult<Option<CompletedPeriod>> {
        let mut tx = self.pool.begin().await?;

        // 같은 사용자에 대한 동시 완료를 직렬화
        let locked: Option<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM deposit_accounts WHERE user_id = $1 FOR UPDATE"
        )
        .bind(completion.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if locked.is_none() {
            return Err(PaymentError::NotFound(format!("deposit account {}", completion.user_id)));
        }

        let recent: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM payments
                WHERE user_id = $1 AND status = 'succeeded' AND created_at >= $2
            )
            "#
        )
        .bind(completion.user_id)
        .bind(completion.recent_window_start)
        .fetch_one(&mut *tx)
        .await?;

        if recent {
            tx.rollback().await?;
            return Ok(None);
        }

        let has_prior_payment: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM payments WHERE user_id = $1)"
        )
        .bind(completion.user_id)
        .fetch_one(&mut *tx)
        .await?;

        let payment = sqlx::query_as::<_, PaymentRecord>(&format!(
            r#"
            INSERT INTO payments (
                id, user_id, amount, payment_type, status,
                period_start, period_end, trigger_tx_hash
            )
            VALUES ($1, $2, $3, $4, 'succeeded', $5, $6, $7)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(completion.user_id)
        .bind(completion.amount)
        .bind(completion.payment_type)
        .bind(completion.period_start)
        .bind(completion.new_next_due)
        .bind(&completion.trigger_tx_hash)
        .fetch_one(&mut *tx)
        .await?;

        // 연결한 행의 금액으로 합계 재계산 (lock 이전 집계 이후 기록된 입금 포함)
        let linked: Vec<Decimal> = sqlx::query_scalar(
            r#"
            UPDATE deposit_transactions
            SET related_payment_id = $1, status = 'confirmed'
            WHERE user_id = $2
              AND related_payment_id IS NULL
              AND status <> 'failed'
              AND (confirmed_at > $3 OR $4)
            RETURNING amount_usdc
            "#
        )
        .bind(payment.id)
        .bind(completion.user_id)
        .bind(completion.period_anchor)
        .bind(has_prior_payment)
        .fetch_all(&mut *tx)
        .await?;

        let paid = UsdcAmount::new(linked.into_iter().sum())?;
        if paid < completion.amount.saturating_sub(completion.tolerance) {
            tracing::warn!(
                user_id = %completion.user_id,
                paid = %paid,
                "period no longer complete under lock; completion rolled back"
            );
            tx.rollback().await?;
            return Ok(None);
        }
        let overpayment = OverpaymentCredit::assess(completion.amount, paid, completion.tolerance);

        sqlx::query(
            r#"
            UPDATE deposit_accounts
            SET previous_period_due_date = $2,
                next_period_due_date = $3,
                initial_payment_completed = TRUE
            WHERE user_id = $1
            "#
        )
        .bind(completion.user_id)
        .bind(completion.new_previous_due)
        .bind(completion.new_next_due)
        .execute(&mut *tx)
        .await?;

        if let Some(credit) = &overpayment {
            sqlx::query(
                r#"
                INSERT INTO commissions (
                    id, referrer_id, referred_id, commission_type, amount, status,
                    payment_id, requires_admin_review
                )
                VALUES ($1, $2, $2, 'overpayment_credit', $3, 'pending', $4, $5)
                "#
            )
            .bind(Uuid::new_v4())
            .bind(completion.user_id)
            .bind(credit.amount)
            .bind(payment.id)
            .bind(credit.requires_admin_review)
            .execute(&mut *tx)
            .await?;
        }

        for event in completion_events(&payment, overpayment.as_ref()) {
            insert_outbox(&mut tx, &event).await?;
        }

        tx.commit().await?;
        Ok(Some(CompletedPeriod {
            payment,
            paid,
            overpayment,
        }))
    }

    async fn find_payment(&self, payment_id: Uuid) -> StoreResult<Option<PaymentRecord>> {
        let payment = sqlx::query_as::<_, PaymentRecord>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }
}

#[async_trait]
impl CommissionRepository for Database {
    async fn find_referrer(&self, referred_id: Uuid) -> StoreResult<Option<Uuid>> {
        let referrer = sqlx::query_scalar("SELECT referrer_id FROM referrals WHERE referred_id = $1")
            .bind(referred_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(referrer)
    }

    async fn find_referred_by(&self, user_id: Uuid) -> StoreResult<Option<Uuid>> {
        let referred_by: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT referred_by FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(referred_by.flatten())
    }

    async fn ensure_referral_edge(&self, referrer_id: Uuid, referred_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO referrals (referrer_id, referred_id)
            VALUES ($1, $2)
            ON CONFLICT (referred_id) DO NOTHING
            "#
        )
        .bind(referrer_id)
        .bind(referred_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn direct_bonus_exists(&self, referrer_id: Uuid, referred_id: Uuid) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM commissions
                WHERE referrer_id = $1 AND referred_id = $2 AND commission_type = 'direct_bonus'
            )
            "#
        )
        .bind(referrer_id)
        .bind(referred_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_direct_bonus(&self, bonus: &NewCommission) -> StoreResult<bool> {
        // uq_direct_bonus_pair: (referrer_id, referred_id) WHERE commission_type = 'direct_bonus'
        let result = sqlx::query(
            r#"
            INSERT INTO commissions (
                id, referrer_id, referred_id, commission_type, amount, status,
                level, payment_id, requires_admin_review
            )
            VALUES ($1, $2, $3, 'direct_bonus', $4, 'pending', NULL, $5, FALSE)
            ON CONFLICT (referrer_id, referred_id) WHERE commission_type = 'direct_bonus'
            DO NOTHING
            "#
        )
        .bind(Uuid::new_v4())
        .bind(bonus.referrer_id)
        .bind(bonus.referred_id)
        .bind(bonus.amount)
        .bind(bonus.payment_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_upline(&self, user_id: Uuid, max_depth: usize) -> StoreResult<Vec<Uuid>> {
        // depth 제한이 순환 참조도 끊어줌
        let upline: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE upline AS (
                SELECT referrer_id, 1 AS depth
                FROM referrals
                WHERE referred_id = $1
              UNION ALL
                SELECT r.referrer_id, u.depth + 1
                FROM referrals r
                JOIN upline u ON r.referred_id = u.referrer_id
                WHERE u.depth < $2
            )
            SELECT referrer_id FROM upline ORDER BY depth
            "#
        )
        .bind(user_id)
        .bind(max_depth as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(upline)
    }

    async fn insert_commission_batch(&self, batch: &[NewCommission]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for commission in batch {
            let result = sqlx::query(
                r#"
                INSERT INTO commissions (
                    id, referrer_id, referred_id, commission_type, amount, status,
                    level, payment_id, requires_admin_review
                )
                VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8)
                ON CONFLICT (payment_id, referrer_id, commission_type) DO NOTHING
                "#
            )
            .bind(Uuid::new_v4())
            .bind(commission.referrer_id)
            .bind(commission.referred_id)
            .bind(commission.commission_type)
            .bind(commission.amount)
            .bind(commission.level)
            .bind(commission.payment_id)
            .bind(commission.requires_admin_review)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected() as usize;
        }

        // 중간에 실패하면 drop 시 rollback → 일부만 지급되는 트리 없음
        tx.commit().await?;
        Ok(inserted)
    }

    async fn pending_overpayment_credits(&self) -> StoreResult<Vec<Commission>> {
        let commissions = sqlx::query_as::<_, Commission>(&format!(
            r#"
            SELECT {COMMISSION_COLUMNS}
            FROM commissions
            WHERE commission_type = $1 AND status = 'pending'
            ORDER BY requires_admin_review DESC, created_at
            "#
        ))
        .bind(CommissionType::OverpaymentCredit)
        .fetch_all(&self.pool)
        .await?;

        Ok(commissions)
    }

    async fn transition_commission(&self, id: Uuid, to: CommissionStatus) -> StoreResult<Option<Commission>> {
        let commission = sqlx::query_as::<_, Commission>(&format!(
            r#"
            UPDATE commissions
            SET status = $2,
                paid_at = CASE WHEN $2 = 'paid'::commission_status THEN NOW() ELSE paid_at END
            WHERE id = $1 AND status = 'pending'
            RETURNING {COMMISSION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;

        Ok(commission)
    }
}

#[async_trait]
impl TreasuryRepository for Database {
    async fn load_treasury_entries(&self) -> StoreResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM treasury_settings")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().collect())
    }

    async fn save_treasury_entries(&self, entries: &[(String, String)]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO treasury_settings (key, value, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (key)
                DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                "#
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn pending_sweep(&self, address: &EthAddress) -> StoreResult<Option<SweepAttempt>> {
        let attempt = sqlx::query_as::<_, SweepAttempt>(
            r#"
            SELECT tx_hash, deposit_address, amount, status, created_at, updated_at
            FROM sweep_attempts
            WHERE deposit_address = $1 AND status = 'submitted'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attempt)
    }

    async fn record_sweep_submitted(
        &self,
        tx_hash: &TxHash,
        address: &EthAddress,
        amount: UsdcAmount,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sweep_attempts (tx_hash, deposit_address, amount, status)
            VALUES ($1, $2, $3, 'submitted')
            ON CONFLICT (tx_hash) DO NOTHING
            "#
        )
        .bind(tx_hash)
        .bind(address)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_sweep(&self, tx_hash: &TxHash, status: SweepStatus) -> StoreResult<()> {
        sqlx::query("UPDATE sweep_attempts SET status = $2, updated_at = NOW() WHERE tx_hash = $1")
            .bind(tx_hash)
            .bind(status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn scan_cursor(&self) -> StoreResult<Option<u64>> {
        let block: Option<i64> = sqlx::query_scalar("SELECT last_block FROM chain_scan_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(block.map(|b| b as u64))
    }

    async fn set_scan_cursor(&self, block: u64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_scan_cursor (id, last_block, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id)
            DO UPDATE SET last_block = GREATEST(chain_scan_cursor.last_block, EXCLUDED.last_block),
                          updated_at = NOW()
            "#
        )
        .bind(block as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for Database {
    async fn enqueue_event(&self, event: &PaymentEvent) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_outbox(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pending_events(&self, limit: i64) -> StoreResult<Vec<OutboxEntry>> {
        let rows: Vec<(Uuid, Json<PaymentEvent>, i32, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, payload, attempts, created_at
            FROM notification_outbox
            WHERE delivered_at IS NULL
            ORDER BY created_at, seq
            LIMIT $1
            "#
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, Json(event), attempts, created_at)| OutboxEntry {
                id,
                event,
                attempts,
                created_at,
            })
            .collect())
    }

    async fn mark_event_delivered(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE notification_outbox SET delivered_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_delivery_failure(&self, id: Uuid, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE notification_outbox SET attempts = attempts + 1, last_error = $2 WHERE id = $1"
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

async fn insert_outbox(tx: &mut Transaction<'_, Postgres>, event: &PaymentEvent) -> StoreResult<()> {
    sqlx::query("INSERT INTO notification_outbox (id, kind, payload) VALUES ($1, $2, $3)")
        .bind(Uuid::new_v4())
        .bind(event.kind())
        .bind(Json(event))
        .execute(&mut **tx)
        .await?;

    Ok(())
}
