//! Treasury Sweep Service
//!
//! 입금 주소에 쌓인 USDC를 treasury로 모으는 배치 작업.
//!
//! # Interview Q&A
//!
//! Q: 파생 키가 저장된 주소와 다르면?
//! A: 즉시 중단. 그 주소에 대해서는 어떤 체인 호출도 하지 않음
//!    - 잘못된 xprv로 서명하면 다른 주소의 자금을 움직이려는 시도가 됨
//!    - `security` 타깃으로 경고 로그
//!
//! Q: 전송 후 확인 대기가 타임아웃되면?
//! A: 결과 불확정. attempt를 `submitted`로 남겨 둠
//!    - 다음 실행에서 새로 보내지 않고 같은 tx를 다시 조회
//!    - 이중 전송 방지: sweep_attempts 원장
//!
//! Q: 한 주소가 실패하면?
//! A: 해당 주소만 실패로 집계, 배치는 계속 진행

use std::sync::Arc;
use std::time::Duration;

use ethers::types::U256;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{ChainConfig, SweepPolicy};
use crate::db::{DepositAccount, PaymentStore};
use crate::error::PaymentError;
use crate::types::{EthAddress, SweepStatus, TxHash, UsdcAmount};

use super::address_deriver::AddressDeriver;
use super::notifications::{NotificationHub, PaymentEvent, SweepFailed};
use super::settings::TreasurySettings;
use super::usdc_client::{ChainClient, ConfirmationStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SweepOutcome {
    Swept { tx_hash: TxHash, amount: UsdcAmount },
    /// 제출됐지만 아직 확정되지 않음 (다음 실행에서 재조회)
    AwaitingConfirmation { tx_hash: TxHash },
    BelowDust { balance: UsdcAmount },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressSweep {
    pub user_id: Uuid,
    pub deposit_address: EthAddress,
    #[serde(flatten)]
    pub outcome: SweepOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<AddressSweep>,
}

impl SweepSummary {
    fn push(&mut self, result: AddressSweep) {
        match result.outcome {
            SweepOutcome::Swept { .. } => self.successful += 1,
            SweepOutcome::Failed { .. } => self.failed += 1,
            SweepOutcome::AwaitingConfirmation { .. } | SweepOutcome::BelowDust { .. } => self.skipped += 1,
        }
        self.results.push(result);
    }
}

/// gas tank 충전 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GasFunding {
    AlreadyFunded { balance_wei: U256, required_wei: U256 },
    Funded { tx_hash: TxHash, amount_wei: U256 },
}

pub struct SweepService {
    store: Arc<dyn PaymentStore>,
    chain: Arc<dyn ChainClient>,
    events: NotificationHub,
    policy: SweepPolicy,
    confirmations: usize,
    confirmation_timeout: Duration,
}

impl SweepService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        chain: Arc<dyn ChainClient>,
        events: NotificationHub,
        policy: SweepPolicy,
        chain_config: &ChainConfig,
    ) -> Self {
        Self {
            store,
            chain,
            events,
            policy,
            confirmations: chain_config.required_confirmations,
            confirmation_timeout: chain_config.confirmation_timeout,
        }
    }

    /// 모든 활성 입금 주소 sweep
    pub async fn sweep_all(&self, settings: &TreasurySettings) -> Result<SweepSummary, PaymentError> {
        // xprv가 없으면 배치 자체가 불가능
        let xprv = settings.master_xprv()?;
        let accounts = self.store.list_active_accounts().await?;
        let mut summary = SweepSummary::default();

        for account in &accounts {
            let outcome = match self.sweep_account(xprv, &settings.treasury_address, account).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        user_id = %account.user_id,
                        address = %account.deposit_address,
                        error = %e,
                        "sweep failed"
                    );
                    let event = PaymentEvent::SweepFailed(SweepFailed {
                        deposit_address: account.deposit_address.clone(),
                        reason: e.to_string(),
                    });
                    if let Err(queue_err) = self.events.publish(event).await {
                        tracing::error!(error = %queue_err, "failed to queue sweep failure notification");
                    }
                    SweepOutcome::Failed { reason: e.to_string() }
                }
            };

            summary.push(AddressSweep {
                user_id: account.user_id,
                deposit_address: account.deposit_address.clone(),
                outcome,
            });
        }

        tracing::info!(
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            "sweep batch finished"
        );
        Ok(summary)
    }

    async fn sweep_account(
        &self,
        xprv: &str,
        treasury: &EthAddress,
        account: &DepositAccount,
    ) -> Result<SweepOutcome, PaymentError> {
        let address = &account.deposit_address;

        // 1. 이전 실행에서 남은 미확정 sweep은 재조회만
        if let Some(pending) = self.store.pending_sweep(address).await? {
            match self.settle(&pending.tx_hash, pending.amount).await? {
                // revert된 경우에만 새로 시도
                SweepOutcome::Failed { reason } => {
                    tracing::warn!(%address, tx_hash = %pending.tx_hash, %reason, "previous sweep reverted; retrying");
                }
                settled => return Ok(settled),
            }
        }

        // 2. 잔액 / dust
        let balance = self.chain.usdc_balance(address).await?;
        if balance < self.policy.dust_threshold {
            tracing::debug!(%address, %balance, "below dust threshold; skipped");
            return Ok(SweepOutcome::BelowDust { balance });
        }

        // 3. 가스
        let required = self.chain.estimate_transfer_cost(address, treasury, balance).await?;
        let available = self.chain.native_balance(address).await?;
        if available < required {
            return Err(PaymentError::InsufficientGas {
                available: available.to_string(),
                required: required.to_string(),
            });
        }

        // 4. 키 파생 + 주소 검증. 불일치면 여기서 끝
        let wallet = AddressDeriver::derive_verified_signer(xprv, account.derivation_index, address)?;

        // 5. 전송 + 원장 기록
        let tx_hash = self.chain.transfer_usdc(&wallet, treasury, balance).await?;
        self.store.record_sweep_submitted(&tx_hash, address, balance).await?;

        // 6. 확정 대기
        match self.settle(&tx_hash, balance).await? {
            SweepOutcome::Failed { reason } => Err(PaymentError::Chain(reason)),
            outcome => Ok(outcome),
        }
    }

    /// 제출된 sweep의 상태를 확인하고 원장 갱신
    async fn settle(&self, tx_hash: &TxHash, amount: UsdcAmount) -> Result<SweepOutcome, PaymentError> {
        let status = self
            .chain
            .wait_for_confirmation(tx_hash, self.confirmations, self.confirmation_timeout)
            .await?;

        match status {
            ConfirmationStatus::Confirmed { block } => {
                self.store.finish_sweep(tx_hash, SweepStatus::Confirmed).await?;
                tracing::info!(%tx_hash, %amount, block, "sweep confirmed");
                Ok(SweepOutcome::Swept {
                    tx_hash: tx_hash.clone(),
                    amount,
                })
            }
            ConfirmationStatus::Reverted => {
                self.store.finish_sweep(tx_hash, SweepStatus::Failed).await?;
                Ok(SweepOutcome::Failed {
                    reason: format!("sweep {} reverted", tx_hash),
                })
            }
            ConfirmationStatus::Pending => {
                tracing::warn!(%tx_hash, "sweep not confirmed before timeout; left submitted");
                Ok(SweepOutcome::AwaitingConfirmation {
                    tx_hash: tx_hash.clone(),
                })
            }
        }
    }

    /// gas tank(payout 지갑)에서 입금 주소로 MATIC 충전
    ///
    /// sweep과 분리된 단계. 이미 충분하면 아무것도 보내지 않음
    pub async fn fund_gas(&self, settings: &TreasurySettings, user_id: Uuid) -> Result<GasFunding, PaymentError> {
        let account = self
            .store
            .find_account_by_user(user_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("deposit account for user {}", user_id)))?;
        let address = &account.deposit_address;

        let balance = self.chain.usdc_balance(address).await?;
        let required = self
            .chain
            .estimate_transfer_cost(address, &settings.treasury_address, balance.max(self.policy.dust_threshold))
            .await?;
        let available = self.chain.native_balance(address).await?;

        if available >= required {
            return Ok(GasFunding::AlreadyFunded {
                balance_wei: available,
                required_wei: required,
            });
        }

        let wallet = settings.payout_wallet()?;
        let amount_wei = self.policy.gas_topup_wei.max(required - available);
        let tx_hash = self.chain.send_native(&wallet, address, amount_wei).await?;

        match self
            .chain
            .wait_for_confirmation(&tx_hash, self.confirmations, self.confirmation_timeout)
            .await?
        {
            ConfirmationStatus::Reverted => {
                Err(PaymentError::Chain(format!("gas funding {} reverted", tx_hash)))
            }
            status => {
                tracing::info!(%user_id, %address, %tx_hash, amount_wei = %amount_wei, ?status, "gas funded");
                Ok(GasFunding::Funded { tx_hash, amount_wei })
            }
        }
    }
}
