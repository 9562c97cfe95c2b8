use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tower::Service;
use tracing::info;

use crate::error::RunError;
use crate::orchestrator::{Orchestrator, RunReport};
use crate::traits::{DataFetcher, SessionBroker, StatisticsStore};
use crate::types::DateRange;

/// 実行リクエスト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    /// 実行日を指定した日次実行
    Daily { run_date: NaiveDate },
    /// 期間を指定した過去分の取込
    Backfill { range: DateRange },
}

impl RunRequest {
    pub fn daily(run_date: NaiveDate) -> Self {
        RunRequest::Daily { run_date }
    }

    pub fn backfill(start: NaiveDate, end: NaiveDate) -> Self {
        RunRequest::Backfill {
            range: DateRange::new(start, end),
        }
    }
}

/// tower::Serviceを実装した実行サービス
///
/// 重なったリクエストは順番待ちになり、同時に2つの実行が走ることはない。
pub struct RunService<B, F, S> {
    orchestrator: Arc<Mutex<Orchestrator<B, F, S>>>,
}

impl<B, F, S> Clone for RunService<B, F, S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
        }
    }
}

impl<B, F, S> RunService<B, F, S> {
    pub fn new(orchestrator: Orchestrator<B, F, S>) -> Self {
        Self {
            orchestrator: Arc::new(Mutex::new(orchestrator)),
        }
    }

    pub fn orchestrator(&self) -> Arc<Mutex<Orchestrator<B, F, S>>> {
        Arc::clone(&self.orchestrator)
    }
}

impl<B, F, S> Service<RunRequest> for RunService<B, F, S>
where
    B: SessionBroker + 'static,
    F: DataFetcher + 'static,
    S: StatisticsStore + 'static,
{
    type Response = RunReport;
    type Error = RunError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RunRequest) -> Self::Future {
        info!("実行リクエスト受信: {:?}", req);
        let orchestrator = Arc::clone(&self.orchestrator);

        Box::pin(async move {
            let mut orchestrator = orchestrator.lock().await;
            let report = match req {
                RunRequest::Daily { run_date } => orchestrator.run(run_date).await?,
                RunRequest::Backfill { range } => orchestrator.backfill(range).await?,
            };

            info!(
                "実行完了: range={}, accepted={}, published={}",
                report.range,
                report.accepted(),
                report.published()
            );

            Ok(report)
        })
    }
}
