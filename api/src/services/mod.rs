//! Services Module
//!
//! 결제 정합성 비즈니스 로직
//!
//! # Services
//! - `AddressDeriver`: BIP-32 입금 주소 / 서명 키 파생
//! - `UsdcClient`: Polygon USDC 조회, 전송, 로그 스캔
//! - `PeriodReconciler`: 입금 → 기간 누적 → 결제 완료
//! - `CommissionDistributor`: direct bonus / residual 분배
//! - `SweepService`: 입금 주소 → treasury sweep, gas 충전
//! - `CatchUpService`: webhook 누락 대비 체인 스캔
//! - `NotificationHub`: 결제 이벤트 outbox + 외부 webhook 전달

pub mod accounts;
pub mod address_deriver;
pub mod catch_up;
pub mod commission;
pub mod deposit_matcher;
pub mod notifications;
pub mod period;
pub mod reconciliation;
pub mod settings;
pub mod sweep;
pub mod usdc_client;
pub mod webhook;

pub use accounts::AccountService;
pub use address_deriver::AddressDeriver;
pub use catch_up::{CatchUpService, CatchUpSummary};
pub use commission::{
    CommissionDistributor, HttpNetworkPositionService, NetworkPositionService,
    UnconfiguredNetworkPositionService,
};
pub use notifications::{NotificationDispatcher, NotificationHub, PaymentEvent};
pub use reconciliation::{PeriodReconciler, PeriodStatus, ReconcileOutcome};
pub use settings::{TreasurySettings, TreasuryUpdate};
pub use sweep::{GasFunding, SweepService, SweepSummary};
pub use usdc_client::{ChainClient, ParsedTransfer, UsdcClient};
