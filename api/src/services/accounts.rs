//! Deposit Account Service
//!
//! 사용자당 영구 입금 주소 1개. 주소는 xpub에서만 파생 (서버에 xprv가 없어도 동작)

use std::sync::Arc;

use uuid::Uuid;

use crate::db::{DepositAccount, NewDepositAccount, PaymentStore};
use crate::error::PaymentError;
use crate::types::PaymentSchedule;

use super::address_deriver::AddressDeriver;
use super::settings::TreasurySettings;

pub struct AccountService {
    store: Arc<dyn PaymentStore>,
}

impl AccountService {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// 입금 계정 조회 또는 생성
    ///
    /// 1. 이미 있으면 그대로 반환 (schedule 변경 없음)
    /// 2. 인덱스를 원자적으로 할당
    /// 3. `xpub/0/{index}` 파생
    /// 4. insert (동시 생성 경쟁에서 지면 먼저 만들어진 계정 반환)
    ///
    /// 경쟁에서 진 쪽이 할당한 인덱스는 사용되지 않고 남음
    pub async fn open_account(
        &self,
        settings: &TreasurySettings,
        user_id: Uuid,
        schedule: PaymentSchedule,
    ) -> Result<DepositAccount, PaymentError> {
        if let Some(existing) = self.store.find_account_by_user(user_id).await? {
            return Ok(existing);
        }

        let index = self.store.allocate_derivation_index().await?;
        let deposit_address = AddressDeriver::derive_address(&settings.master_xpub, index)?;

        let account = self
            .store
            .insert_deposit_account(&NewDepositAccount {
                user_id,
                deposit_address,
                derivation_index: index,
                payment_schedule: schedule,
            })
            .await?;

        tracing::info!(
            %user_id,
            index = account.derivation_index,
            address = %account.deposit_address,
            schedule = ?account.payment_schedule,
            "deposit account opened"
        );
        Ok(account)
    }
}
