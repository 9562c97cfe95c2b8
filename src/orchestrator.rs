//! 1回の実行を駆動する状態機械
//!
//! `Idle → Authenticating → Fetching → Merging → Publishing → Done`。
//! どの状態からでも `Failed` に遷移しうる。

use chrono::{Days, NaiveDate};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, FetchError, RunError};
use crate::ledger::LedgerStore;
use crate::portal::SessionContext;
use crate::statistics::{PublishMode, StatisticsPublisher};
use crate::traits::{DataFetcher, SessionBroker, StatisticsStore};
use crate::types::{ConsumptionPoint, DateRange, MeteringPoint};

/// 実行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Authenticating,
    Fetching,
    Merging,
    Publishing,
    Done,
    Failed,
}

/// 計量点ごとの結果
#[derive(Debug, Clone, PartialEq)]
pub struct MeteringPointReport {
    pub metering_point: MeteringPoint,
    pub statistic_id: String,
    /// ポータルから受け取った確定済みの点
    pub fetched: usize,
    /// 台帳に新規追加された点
    pub accepted: usize,
    /// 未確定で見送った取得範囲
    pub deferred: Vec<DateRange>,
    pub published: usize,
    pub publish_mode: PublishMode,
    pub cumulative_total: f64,
}

/// 実行結果
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub range: DateRange,
    pub transitions: Vec<RunState>,
    pub metering_points: Vec<MeteringPointReport>,
}

impl RunReport {
    pub fn final_state(&self) -> RunState {
        self.transitions.last().copied().unwrap_or(RunState::Idle)
    }

    pub fn accepted(&self) -> usize {
        self.metering_points.iter().map(|r| r.accepted).sum()
    }

    pub fn published(&self) -> usize {
        self.metering_points.iter().map(|r| r.published).sum()
    }
}

/// オーケストレーター
pub struct Orchestrator<B, F, S> {
    broker: B,
    fetcher: F,
    ledger: LedgerStore,
    publisher: StatisticsPublisher<S>,
    config: Config,
    state: RunState,
    transitions: Vec<RunState>,
}

impl<B, F, S> Orchestrator<B, F, S>
where
    B: SessionBroker,
    F: DataFetcher,
    S: StatisticsStore,
{
    pub fn new(broker: B, fetcher: F, store: S, config: Config) -> Self {
        let ledger = LedgerStore::new(config.ledger_path.clone());
        let publisher = StatisticsPublisher::new(store, &config.store);
        Self {
            broker,
            fetcher,
            ledger,
            publisher,
            config,
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// 直近の実行で辿った状態
    pub fn transitions(&self) -> &[RunState] {
        &self.transitions
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn publisher(&self) -> &StatisticsPublisher<S> {
        &self.publisher
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// 日次実行の対象日（実行日から確定遅れ分さかのぼる）
    pub fn target_date(&self, run_date: NaiveDate) -> Result<NaiveDate, ConfigError> {
        let lag = self.config.finalization_lag_days;
        run_date
            .checked_sub_days(Days::new(lag))
            .ok_or_else(|| ConfigError::Invalid {
                key: "FINALIZATION_LAG_DAYS",
                value: lag.to_string(),
            })
    }

    /// 日次実行: 対象日1日分を取得・記録・送信する
    pub async fn run(&mut self, run_date: NaiveDate) -> Result<RunReport, RunError> {
        let range = DateRange::single(self.target_date(run_date)?);
        info!("Daily run for {} (run date {})", range, run_date);
        self.execute(range, vec![range]).await
    }

    /// 過去分の一括取込: 月単位で順に取得する
    pub async fn backfill(&mut self, range: DateRange) -> Result<RunReport, RunError> {
        let chunks = range.month_chunks();
        info!("Backfill {} in {} chunk(s)", range, chunks.len());
        self.execute(range, chunks).await
    }

    async fn execute(
        &mut self,
        range: DateRange,
        chunks: Vec<DateRange>,
    ) -> Result<RunReport, RunError> {
        self.state = RunState::Idle;
        self.transitions = vec![RunState::Idle];

        match self.execute_inner(&chunks).await {
            Ok(metering_points) => {
                self.transition(RunState::Done);
                Ok(RunReport {
                    range,
                    transitions: self.transitions.clone(),
                    metering_points,
                })
            }
            Err(e) => {
                error!("Run for {} failed in {:?}: {}", range, self.state, e);
                self.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    async fn execute_inner(
        &mut self,
        chunks: &[DateRange],
    ) -> Result<Vec<MeteringPointReport>, RunError> {
        self.config.validate()?;
        self.transition(RunState::Authenticating);
        let mut session = self.broker.authenticate(&self.config.credentials).await?;
        let mut reauthenticated = false;

        let metering_points = if self.config.metering_points.is_empty() {
            vec![MeteringPoint::account_default()]
        } else {
            self.config.metering_points.clone()
        };
        let point_count = metering_points.len();

        let mut reports = Vec::with_capacity(point_count);
        let mut requests = 0usize;
        for metering_point in metering_points {
            self.transition(RunState::Fetching);
            let mut fetched = Vec::new();
            let mut deferred = Vec::new();
            for chunk in chunks {
                if requests > 0 {
                    sleep(self.config.portal.request_interval).await;
                }
                requests += 1;

                match self
                    .fetch_chunk(&mut session, &mut reauthenticated, &metering_point, *chunk)
                    .await
                {
                    Ok(points) => {
                        info!(
                            "Fetched {} point(s) for {} in {}",
                            points.len(),
                            metering_point,
                            chunk
                        );
                        fetched.extend(points);
                    }
                    Err(RunError::Fetch(FetchError::IncompleteData(reason))) => {
                        warn!(
                            "Data for {} in {} not finalized yet, deferring: {}",
                            metering_point, chunk, reason
                        );
                        deferred.push(*chunk);
                    }
                    Err(e) => return Err(e),
                }
            }

            let statistic_id = self
                .config
                .store
                .statistic_id_for(&metering_point, point_count);

            // 全範囲が未確定なら台帳にも統計にも触れない
            if !chunks.is_empty() && deferred.len() == chunks.len() {
                info!(
                    "Nothing finalized for {}, leaving ledger and store as is",
                    metering_point
                );
                let record = self.ledger.load(&metering_point)?;
                reports.push(MeteringPointReport {
                    metering_point,
                    statistic_id,
                    fetched: 0,
                    accepted: 0,
                    deferred,
                    published: 0,
                    publish_mode: PublishMode::Append,
                    cumulative_total: record.running_cumulative_total,
                });
                continue;
            }

            self.transition(RunState::Merging);
            let fetched_count = fetched.len();
            let (record, accepted) = self.ledger.load(&metering_point)?.merge(fetched);
            if accepted.is_empty() {
                info!("No new points for {}", metering_point);
            } else {
                self.ledger.persist(&record)?;
            }

            self.transition(RunState::Publishing);
            let cursor = self.ledger.load_cursor(&statistic_id)?;
            let result = self
                .publisher
                .publish(&statistic_id, &record, &accepted, cursor)
                .await?;
            if let Some(last_start) = result.last_start {
                self.ledger.persist_cursor(&statistic_id, last_start)?;
            }

            reports.push(MeteringPointReport {
                metering_point,
                statistic_id,
                fetched: fetched_count,
                accepted: accepted.len(),
                deferred,
                published: result.submitted,
                publish_mode: result.mode,
                cumulative_total: record.running_cumulative_total,
            });
        }

        Ok(reports)
    }

    /// 1範囲を取得する
    ///
    /// セッション切れは実行全体で1回だけ再ログインし、通信エラーは範囲ごとに
    /// 1回だけ再試行する。
    async fn fetch_chunk(
        &mut self,
        session: &mut SessionContext,
        reauthenticated: &mut bool,
        metering_point: &MeteringPoint,
        range: DateRange,
    ) -> Result<Vec<ConsumptionPoint>, RunError> {
        let mut network_retried = false;
        loop {
            match self.fetcher.fetch(session, metering_point, range).await {
                Ok(points) => return Ok(points),
                Err(FetchError::AuthExpired(reason)) if !*reauthenticated => {
                    warn!("Session expired ({}), authenticating again", reason);
                    *reauthenticated = true;
                    self.transition(RunState::Authenticating);
                    *session = self.broker.authenticate(&self.config.credentials).await?;
                    self.transition(RunState::Fetching);
                }
                Err(e) if e.is_retryable() && !network_retried => {
                    warn!("Fetch for {} failed, retrying once: {}", range, e);
                    network_retried = true;
                    sleep(self.config.portal.request_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            info!("{:?} -> {:?}", self.state, next);
        }
        self.state = next;
        self.transitions.push(next);
    }
}
