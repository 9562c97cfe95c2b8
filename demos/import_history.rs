use chrono::NaiveDate;
use energy_scraper_service::{build_orchestrator, Config, DateRange};
use tracing_subscriber::EnvFilter;

fn date_from_env(key: &str) -> NaiveDate {
    let raw = std::env::var(key).unwrap_or_else(|_| panic!("{} environment variable not set", key));
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .unwrap_or_else(|e| panic!("{} must be YYYY-MM-DD: {}", key, e))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("energy_scraper_service=debug,info")),
        )
        .init();

    let start = date_from_env("START_DATE");
    let end = date_from_env("END_DATE");

    // 履歴用に別の統計IDを使う場合は STATISTIC_ID を指定する
    let config = Config::from_env().expect("configuration error");
    let mut orchestrator = build_orchestrator(config).expect("failed to build orchestrator");

    let range = DateRange::new(start, end);
    println!("=== Import History {} ===", range);

    match orchestrator.backfill(range).await {
        Ok(report) => {
            for mp in &report.metering_points {
                println!(
                    "{}: accepted={}, published={} ({:?}), total={:.3} kWh",
                    mp.statistic_id, mp.accepted, mp.published, mp.publish_mode, mp.cumulative_total
                );
                for skipped in &mp.deferred {
                    println!("  skipped (not finalized): {}", skipped);
                }
            }
        }
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    }
}
