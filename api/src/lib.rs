//! Trading Hub Payments Library
//!
//! # Overview
//!
//! MLM Trading Hub의 USDC(Polygon) 결제 정합성 백엔드.
//! 사용자별 HD 입금 주소로 들어온 전송을 기간 단위로 누적해 결제를 확정하고,
//! 추천 보너스를 분배하고, 모인 자금을 treasury로 sweep 합니다.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                          API                              │
//! │                                                           │
//! │  webhook ─┐                                               │
//! │           ├─▶ PeriodReconciler ─▶ CommissionDistributor   │
//! │  cron ────┘         │                     │               │
//! │  (CatchUp)          ▼                     ▼               │
//! │               NotificationHub       PaymentStore (PG)     │
//! │                                                           │
//! │  cron ──▶ SweepService ──▶ AddressDeriver ──▶ UsdcClient  │
//! └───────────────────────────────────────────┬──────────────┘
//!                                             ▼
//!                                   ┌───────────────────┐
//!                                   │ Polygon (USDC)    │
//!                                   └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `error`: 에러 타입 및 처리
//! - `routes`: HTTP 엔드포인트 핸들러
//! - `services`: 결제 정합성 비즈니스 로직
//! - `db`: 데이터베이스 연동
//! - `types`: 공통 타입 정의
//!
//! ## Usage
//!
//! ```rust,ignore
//! use trading_hub_payments::{config::Config, db::Database, services::UsdcClient, AppState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let db = Arc::new(Database::connect(&config.database_url).await?);
//!     let chain = Arc::new(UsdcClient::new(&config.chain)?);
//!     let state = AppState::new(config, db, chain, network);
//!
//!     // ... 서버 시작
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod routes;
pub mod services;
pub mod db;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use error::{ApiError, PaymentError};
pub use db::Database;

use db::PaymentStore;
use services::{
    AccountService, CatchUpService, ChainClient, CommissionDistributor, NetworkPositionService,
    NotificationHub, PeriodReconciler, SweepService, TreasurySettings,
};

/// 애플리케이션 전역 상태
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PaymentStore>,
    pub chain: Arc<dyn ChainClient>,
    pub accounts: Arc<AccountService>,
    pub reconciler: Arc<PeriodReconciler>,
    pub commissions: Arc<CommissionDistributor>,
    pub sweeper: Arc<SweepService>,
    pub catch_up: Arc<CatchUpService>,
    pub events: NotificationHub,
    pub config: Arc<Config>,
}

impl AppState {
    /// 저장소/체인/네트워크 서비스를 받아 서비스 그래프 구성
    pub fn new(
        config: Config,
        store: Arc<dyn PaymentStore>,
        chain: Arc<dyn ChainClient>,
        network: Arc<dyn NetworkPositionService>,
    ) -> Self {
        let events = NotificationHub::new(store.clone());
        let commissions = Arc::new(CommissionDistributor::new(
            store.clone(),
            network,
            config.policy.clone(),
        ));
        let reconciler = Arc::new(PeriodReconciler::new(
            store.clone(),
            commissions.clone(),
            events.clone(),
            config.policy.clone(),
        ));
        let sweeper = Arc::new(SweepService::new(
            store.clone(),
            chain.clone(),
            events.clone(),
            config.sweep.clone(),
            &config.chain,
        ));
        let catch_up = Arc::new(CatchUpService::new(
            store.clone(),
            chain.clone(),
            reconciler.clone(),
            &config.chain,
        ));

        Self {
            accounts: Arc::new(AccountService::new(store.clone())),
            store,
            chain,
            reconciler,
            commissions,
            sweeper,
            catch_up,
            events,
            config: Arc::new(config),
        }
    }

    /// 사용 시점마다 treasury 설정 로드 + 검증 (관리자 변경 즉시 반영)
    pub async fn treasury_settings(&self) -> Result<TreasurySettings, PaymentError> {
        TreasurySettings::load(self.store.as_ref()).await
    }
}
