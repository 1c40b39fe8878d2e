//! Trading Hub Payments API Server
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Alchemy webhook  /  cron  /  admin console            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum Web Server                         │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                      Routes Layer                        ││
//! │  │  /health  /webhooks/*  /cron/*  /admin/*                ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Services Layer                        ││
//! │  │  PeriodReconciler  CommissionDistributor  SweepService  ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Data Layer                            ││
//! │  │  PostgreSQL Repository                                  ││
//! │  └─────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Polygon PoS (USDC ERC-20)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// 라이브러리에서 가져오기
use trading_hub_payments::{
    config::SchedulerConfig,
    routes,
    services::{
        HttpNetworkPositionService, NetworkPositionService, NotificationDispatcher,
        UnconfiguredNetworkPositionService, UsdcClient,
    },
    AppState, Config, Database,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 환경변수 로드
    dotenvy::dotenv().ok();

    // 로깅 초기화
    // RUST_LOG=debug,sqlx=warn 형태로 레벨 제어 가능
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "trading_hub_payments=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting Trading Hub Payments Server");

    // 설정 로드
    let config = Config::from_env()?;
    tracing::info!(
        chain_id = config.chain.chain_id,
        usdc = %config.chain.usdc_contract,
        "📋 Configuration loaded"
    );
    for (name, value) in [
        ("ALCHEMY_WEBHOOK_SIGNING_KEY", &config.webhook_signing_key),
        ("CRON_SECRET", &config.cron_secret),
        ("ADMIN_API_SECRET", &config.admin_secret),
    ] {
        if value.is_none() {
            tracing::warn!("{} not set; guarded endpoints will reject every request", name);
        }
    }

    // 데이터베이스 연결
    let db = Database::connect(&config.database_url).await?;
    tracing::info!("🗄️  Database connected");

    // 마이그레이션 실행
    db.run_migrations().await?;
    tracing::info!("📦 Migrations completed");

    // 서비스 초기화
    let chain = UsdcClient::new(&config.chain)?;
    tracing::info!("⛓️  Polygon RPC client initialized");

    let network: Arc<dyn NetworkPositionService> = match &config.network_service_url {
        Some(url) => Arc::new(HttpNetworkPositionService::new(url)),
        None => Arc::new(UnconfiguredNetworkPositionService),
    };

    // 앱 상태 구성
    let state = AppState::new(config.clone(), Arc::new(db), Arc::new(chain), network);

    NotificationDispatcher::new(state.store.clone(), config.notification_webhook_url.clone())
        .spawn(&state.events);
    tracing::info!("📣 Notification dispatcher started");

    if let Some(scheduler) = &config.scheduler {
        spawn_scheduler(state.clone(), scheduler.clone());
    }

    // 라우터 구성
    let app = routes::create_router(state);

    // 서버 시작
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("🌐 Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// 내장 스케줄러 (외부 cron 대신)
///
/// 각 작업은 재실행에 안전하므로 실패 시 로그만 남기고 다음 주기에 다시 시도
fn spawn_scheduler(state: AppState, scheduler: SchedulerConfig) {
    let reconcile_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scheduler.reconcile_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = reconcile_state.catch_up.run().await {
                tracing::error!(error = %e, "scheduled catch-up failed");
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scheduler.sweep_interval);
        loop {
            ticker.tick().await;
            let result = match state.treasury_settings().await {
                Ok(settings) => state.sweeper.sweep_all(&settings).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "scheduled sweep failed");
            }
        }
    });

    tracing::info!("⏰ In-process scheduler started");
}
