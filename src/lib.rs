//! Tampereen Energia 消費量スクレイパー
//!
//! - ヘッドレスブラウザでポータルにログインし、内部APIのセッションを捕捉
//! - 捕捉したセッションで確定済みの消費量をHTTPで取得
//! - ローカル台帳に追記し、累計を再計算
//! - Home Assistant の長期統計として累計を送信
//!
//! # 日次実行の使用例
//!
//! ```rust,ignore
//! use energy_scraper_service::{build_service, Config, RunRequest};
//! use tower::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().unwrap();
//!     let mut service = build_service(config).unwrap();
//!
//!     let today = chrono::Utc::now().date_naive();
//!     let report = service.call(RunRequest::daily(today)).await.unwrap();
//!     println!("Published: {}", report.published());
//! }
//! ```
//!
//! # 過去分の取込
//!
//! ```rust,ignore
//! use energy_scraper_service::{build_orchestrator, Config, DateRange};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().unwrap();
//!     let mut orchestrator = build_orchestrator(config).unwrap();
//!
//!     let start = chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
//!     let end = chrono::NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
//!     let report = orchestrator.backfill(DateRange::new(start, end)).await.unwrap();
//!     println!("Accepted: {}", report.accepted());
//! }
//! ```

pub mod config;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod portal;
pub mod service;
pub mod statistics;
pub mod traits;
pub mod types;

// 主要な型をリエクスポート
pub use config::{Config, Credentials, PortalConfig, StoreConfig};
pub use error::{AuthError, ConfigError, FetchError, LedgerError, PublishError, RunError};
pub use ledger::{LedgerRecord, LedgerStore};
pub use orchestrator::{MeteringPointReport, Orchestrator, RunReport, RunState};
pub use portal::{ChromiumSessionBroker, HttpDataFetcher, SessionContext};
pub use service::{RunRequest, RunService};
pub use statistics::{
    HomeAssistantStore, PublishMode, PublishResult, Resolution, StatisticBatch, StatisticEntry,
    StatisticsPublisher,
};
pub use traits::{DataFetcher, SessionBroker, StatisticsStore};
pub use types::{ConsumptionPoint, DateRange, MeteringPoint};

/// 実際のポータルと Home Assistant を使う構成
pub type DefaultOrchestrator =
    Orchestrator<ChromiumSessionBroker, HttpDataFetcher, HomeAssistantStore>;

/// 設定から標準構成のオーケストレーターを組み立てる
pub fn build_orchestrator(config: Config) -> Result<DefaultOrchestrator, RunError> {
    let broker = ChromiumSessionBroker::new(config.portal.clone());
    let fetcher = HttpDataFetcher::new(config.portal.request_timeout)?;
    let store = HomeAssistantStore::new(&config.store);
    Ok(Orchestrator::new(broker, fetcher, store, config))
}

/// 設定から標準構成のサービスを組み立てる
pub fn build_service(
    config: Config,
) -> Result<RunService<ChromiumSessionBroker, HttpDataFetcher, HomeAssistantStore>, RunError> {
    Ok(RunService::new(build_orchestrator(config)?))
}
