//! Chain Catch-Up
//!
//! webhook을 놓쳤을 때를 위한 안전망. 체인의 `Transfer` 로그를 직접 스캔해서
//! 같은 reconciliation 엔진에 넣음 (엔진이 멱등이므로 중복 전달은 무해).
//!
//! ```text
//! cursor+1 ──[2,000 blocks]──[2,000 blocks]──[...]── head - confirmations
//!              │
//!              └─ 주소 100개 단위 topic 필터 → process_transfer → cursor 갱신
//! ```
//!
//! 윈도우 처리 중 에러가 나면 cursor를 움직이지 않고 중단 → 다음 실행에서 같은 윈도우부터

use std::sync::Arc;

use serde::Serialize;

use crate::config::ChainConfig;
use crate::db::PaymentStore;
use crate::error::PaymentError;
use crate::types::EthAddress;

use super::reconciliation::{PeriodReconciler, ReconcileOutcome};
use super::usdc_client::{ChainClient, SCAN_WINDOW_BLOCKS};

/// `eth_getLogs` topic OR-list 최대 크기
pub const ADDRESS_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatchUpSummary {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub windows: usize,
    pub transfers: usize,
    pub completed: usize,
    pub partial: usize,
    pub duplicates: usize,
}

impl CatchUpSummary {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        self.transfers += 1;
        match outcome {
            ReconcileOutcome::Completed { .. } => self.completed += 1,
            ReconcileOutcome::Partial { .. } => self.partial += 1,
            ReconcileOutcome::Duplicate { .. } => self.duplicates += 1,
            ReconcileOutcome::Unmatched { .. }
            | ReconcileOutcome::CarriedForward { .. }
            | ReconcileOutcome::AlreadyCompleted { .. } => {}
        }
    }
}

pub struct CatchUpService {
    store: Arc<dyn PaymentStore>,
    chain: Arc<dyn ChainClient>,
    reconciler: Arc<PeriodReconciler>,
    confirmations: u64,
    scan_start_block: u64,
}

impl CatchUpService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        chain: Arc<dyn ChainClient>,
        reconciler: Arc<PeriodReconciler>,
        chain_config: &ChainConfig,
    ) -> Self {
        Self {
            store,
            chain,
            reconciler,
            confirmations: chain_config.required_confirmations as u64,
            scan_start_block: chain_config.scan_start_block,
        }
    }

    pub async fn run(&self) -> Result<CatchUpSummary, PaymentError> {
        let head = self.chain.block_number().await?;
        let safe_head = head.saturating_sub(self.confirmations);
        let start = match self.store.scan_cursor().await? {
            Some(cursor) => cursor + 1,
            None => self.scan_start_block,
        };

        let mut summary = CatchUpSummary::default();
        if start > safe_head {
            tracing::debug!(start, safe_head, "catch-up: nothing to scan");
            return Ok(summary);
        }

        let addresses: Vec<EthAddress> = self
            .store
            .list_active_accounts()
            .await?
            .into_iter()
            .map(|a| a.deposit_address)
            .collect();

        summary.from_block = Some(start);
        let mut from = start;
        while from <= safe_head {
            let to = (from + SCAN_WINDOW_BLOCKS - 1).min(safe_head);
            self.scan_window(&addresses, from, to, &mut summary).await?;

            self.store.set_scan_cursor(to).await?;
            summary.to_block = Some(to);
            summary.windows += 1;
            from = to + 1;
        }

        tracing::info!(
            from_block = start,
            to_block = safe_head,
            windows = summary.windows,
            transfers = summary.transfers,
            completed = summary.completed,
            partial = summary.partial,
            "catch-up finished"
        );
        Ok(summary)
    }

    async fn scan_window(
        &self,
        addresses: &[EthAddress],
        from: u64,
        to: u64,
        summary: &mut CatchUpSummary,
    ) -> Result<(), PaymentError> {
        for chunk in addresses.chunks(ADDRESS_CHUNK_SIZE) {
            let mut transfers = self.chain.scan_transfers(chunk, from, to).await?;
            // 블록 순서대로 누적
            transfers.sort_by_key(|t| t.block_number);

            for transfer in &transfers {
                let outcome = self.reconciler.process_transfer(transfer).await?;
                summary.record(&outcome);
            }
        }
        Ok(())
    }
}
