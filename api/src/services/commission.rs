//! Commission / Bonus Distributor
//!
//! # Interview Q&A
//!
//! Q: 같은 결제에 대해 커미션이 두 번 생성되지 않는 근거는?
//! A: 두 겹의 방어
//!    1. 사전 조회: (referrer, referred, direct_bonus)가 이미 있으면 건너뜀
//!    2. 저장소 유일성: direct_bonus 부분 유일 인덱스, (payment, referrer, type) 유일 제약
//!
//!    webhook + cron이 동시에 같은 결제를 완료시키려 해도 한쪽만 payment를 만들고,
//!    커미션은 payment를 만든 쪽만 분배함
//!
//! Q: residual 분배를 왜 한 번의 batch로 넣는가?
//! A: 일부 레벨만 지급된 "반쪽 트리"를 막기 위해. 전부 생성되거나 전부 실패
//!
//! Q: referral edge가 없는데 users.referred_by는 있는 경우?
//! A: 데이터 누락 복구 경로. edge를 먼저 만들고(멱등) 그 다음 bonus 생성

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::config::PaymentPolicy;
use crate::db::{Commission, NewCommission, PaymentRecord, PaymentStore};
use crate::error::PaymentError;
use crate::types::{CommissionStatus, CommissionType, PaymentType, UsdcAmount};

/// 외부 추천 네트워크 포지션 서비스
#[async_trait]
pub trait NetworkPositionService: Send + Sync {
    /// 최초 unlock 시 네트워크 포지션 배정 (외부 서비스에서 멱등)
    async fn assign_position(&self, user_id: Uuid, referrer_id: Option<Uuid>) -> Result<(), PaymentError>;
}

/// HTTP 구현 (`POST {base}/positions`)
pub struct HttpNetworkPositionService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNetworkPositionService {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Serialize)]
struct AssignPositionRequest {
    user_id: Uuid,
    referrer_id: Option<Uuid>,
}

#[async_trait]
impl NetworkPositionService for HttpNetworkPositionService {
    async fn assign_position(&self, user_id: Uuid, referrer_id: Option<Uuid>) -> Result<(), PaymentError> {
        let resp = self
            .client
            .post(format!("{}/positions", self.base_url))
            .json(&AssignPositionRequest { user_id, referrer_id })
            .send()
            .await
            .map_err(|e| PaymentError::Chain(format!("network position service unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(PaymentError::Chain(format!(
                "network position service returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// 포지션 서비스가 설정되지 않은 환경 (로그만 남김)
pub struct UnconfiguredNetworkPositionService;

#[async_trait]
impl NetworkPositionService for UnconfiguredNetworkPositionService {
    async fn assign_position(&self, user_id: Uuid, _referrer_id: Option<Uuid>) -> Result<(), PaymentError> {
        tracing::warn!(%user_id, "NETWORK_SERVICE_URL not set; network position not assigned");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributionSummary {
    pub direct_bonus_created: bool,
    pub residuals_created: usize,
}

pub struct CommissionDistributor {
    store: Arc<dyn PaymentStore>,
    network: Arc<dyn NetworkPositionService>,
    policy: PaymentPolicy,
}

impl CommissionDistributor {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        network: Arc<dyn NetworkPositionService>,
        policy: PaymentPolicy,
    ) -> Self {
        Self { store, network, policy }
    }

    /// 완료된 결제 1건에 대한 분배 (재실행 안전)
    pub async fn distribute(&self, payment: &PaymentRecord) -> Result<DistributionSummary, PaymentError> {
        match payment.payment_type {
            PaymentType::InitialUnlock => Ok(DistributionSummary {
                direct_bonus_created: self.on_initial_unlock(payment).await?,
                residuals_created: 0,
            }),
            PaymentType::WeeklySubscription | PaymentType::MonthlySubscription => Ok(DistributionSummary {
                direct_bonus_created: false,
                residuals_created: self.distribute_residuals(payment).await?,
            }),
        }
    }

    /// 최초 unlock: 네트워크 포지션 배정 + direct bonus 1건
    pub async fn on_initial_unlock(&self, payment: &PaymentRecord) -> Result<bool, PaymentError> {
        let user_id = payment.user_id;
        let referrer = self.resolve_referrer(user_id).await?;

        // 포지션 배정 실패는 bonus를 막지 않음 (redistribute로 재시도)
        if let Err(e) = self.network.assign_position(user_id, referrer).await {
            tracing::error!(%user_id, error = %e, "network position assignment failed");
        }

        let Some(referrer_id) = referrer else {
            tracing::debug!(%user_id, "no referrer; direct bonus skipped");
            return Ok(false);
        };

        if self.store.direct_bonus_exists(referrer_id, user_id).await? {
            tracing::debug!(%referrer_id, %user_id, "direct bonus already exists");
            return Ok(false);
        }

        let created = self
            .store
            .insert_direct_bonus(&NewCommission {
                referrer_id,
                referred_id: user_id,
                commission_type: CommissionType::DirectBonus,
                amount: self.policy.direct_bonus,
                level: None,
                payment_id: Some(payment.id),
                requires_admin_review: false,
            })
            .await?;

        if created {
            tracing::info!(%referrer_id, %user_id, amount = %self.policy.direct_bonus, "direct bonus created");
        }
        Ok(created)
    }

    /// 구독 결제: 업라인 residual을 하나의 batch로
    pub async fn distribute_residuals(&self, payment: &PaymentRecord) -> Result<usize, PaymentError> {
        let levels = &self.policy.residual_level_bps;
        let upline = self.store.find_upline(payment.user_id, levels.len()).await?;

        let batch = residual_batch(payment, &upline, levels);
        if batch.is_empty() {
            return Ok(0);
        }

        let created = self.store.insert_commission_batch(&batch).await?;
        tracing::info!(
            payment_id = %payment.id,
            user_id = %payment.user_id,
            upline = upline.len(),
            created,
            "residual commissions distributed"
        );
        Ok(created)
    }

    /// 관리자 복구 경로: 저장된 결제로 분배 재실행
    pub async fn redistribute(&self, payment_id: Uuid) -> Result<DistributionSummary, PaymentError> {
        let payment = self
            .store
            .find_payment(payment_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {}", payment_id)))?;
        self.distribute(&payment).await
    }

    pub async fn mark_paid(&self, commission_id: Uuid) -> Result<Commission, PaymentError> {
        self.transition(commission_id, CommissionStatus::Paid).await
    }

    pub async fn cancel(&self, commission_id: Uuid) -> Result<Commission, PaymentError> {
        self.transition(commission_id, CommissionStatus::Cancelled).await
    }

    /// 관리자 검토 대기 중인 초과 입금 크레딧
    pub async fn review_queue(&self) -> Result<Vec<Commission>, PaymentError> {
        self.store.pending_overpayment_credits().await
    }

    async fn transition(&self, commission_id: Uuid, to: CommissionStatus) -> Result<Commission, PaymentError> {
        let updated = self
            .store
            .transition_commission(commission_id, to)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("pending commission {}", commission_id)))?;
        tracing::info!(commission_id = %commission_id, status = ?to, "commission status changed");
        Ok(updated)
    }

    /// referral edge → 없으면 users.referred_by 로 edge 복구
    async fn resolve_referrer(&self, user_id: Uuid) -> Result<Option<Uuid>, PaymentError> {
        if let Some(referrer) = self.store.find_referrer(user_id).await? {
            return Ok(Some(referrer));
        }

        match self.store.find_referred_by(user_id).await? {
            Some(referrer) if referrer != user_id => {
                tracing::warn!(%user_id, %referrer, "referral edge missing; repairing from referred_by");
                self.store.ensure_referral_edge(referrer, user_id).await?;
                Ok(Some(referrer))
            }
            _ => Ok(None),
        }
    }
}

fn residual_batch(payment: &PaymentRecord, upline: &[Uuid], levels: &[u32]) -> Vec<NewCommission> {
    upline
        .iter()
        .zip(levels)
        .enumerate()
        .filter_map(|(depth, (referrer_id, bps))| {
            let amount: UsdcAmount = payment.amount.bps(*bps);
            (!amount.is_zero()).then(|| NewCommission {
                referrer_id: *referrer_id,
                referred_id: payment.user_id,
                commission_type: CommissionType::Residual,
                amount,
                level: Some(depth as i32 + 1),
                payment_id: Some(payment.id),
                requires_admin_review: false,
            })
        })
        .collect()
}
