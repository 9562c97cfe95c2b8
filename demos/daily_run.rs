use energy_scraper_service::{build_service, Config, RunRequest, RunState};
use tower::Service;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // ログ設定 (RUST_LOG で上書き可)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("energy_scraper_service=debug,info")),
        )
        .init();

    // TE_USERNAME / TE_PASSWORD / HA_URL / HA_TOKEN ほか
    let config = Config::from_env().expect("configuration error");
    let mut service = build_service(config).expect("failed to build service");

    let today = chrono::Utc::now().date_naive();
    println!("=== Daily Run ({}) ===", today);

    match service.call(RunRequest::daily(today)).await {
        Ok(report) => {
            for mp in &report.metering_points {
                println!(
                    "{}: accepted={}, published={}, total={:.3} kWh, deferred={}",
                    mp.statistic_id,
                    mp.accepted,
                    mp.published,
                    mp.cumulative_total,
                    mp.deferred.len()
                );
            }
            assert_eq!(report.final_state(), RunState::Done);
        }
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    }
}
