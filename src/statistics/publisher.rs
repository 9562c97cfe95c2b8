//! 台帳から累計統計を計算してストアへ送信する

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::PublishError;
use crate::ledger::LedgerRecord;
use crate::traits::StatisticsStore;
use crate::types::ConsumptionPoint;

use super::types::{
    PublishMode, PublishResult, Resolution, StatisticBatch, StatisticEntry, StatisticMetadata,
};

/// 送信するエントリとモードを決める
///
/// 累計は台帳の全点に対する前方累積で求める。送信範囲は「今回受け付けた最古の
/// 期間」と「カーソルより後の最初の期間」の早い方から最新期間まで。範囲の先頭が
/// カーソル以前なら既送信分の上書きになる。
pub fn plan_entries(
    record: &LedgerRecord,
    accepted: &[ConsumptionPoint],
    cursor: Option<DateTime<Utc>>,
    resolution: Resolution,
) -> (Vec<StatisticEntry>, PublishMode) {
    let mut periods: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
    for point in &record.points {
        *periods
            .entry(resolution.bucket_start(point.date, point.hour_index))
            .or_insert(0.0) += point.value;
    }

    let earliest_accepted = accepted
        .iter()
        .map(|p| resolution.bucket_start(p.date, p.hour_index))
        .min();
    let first_pending = periods
        .keys()
        .find(|start| cursor.map_or(true, |c| **start > c))
        .copied();

    let from = match (earliest_accepted, first_pending) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return (Vec::new(), PublishMode::Append),
    };

    let mut running = 0.0;
    let mut entries = Vec::new();
    for (start, period_sum) in periods {
        running += period_sum;
        if start >= from {
            entries.push(StatisticEntry {
                start,
                state: running,
                sum: Some(period_sum),
            });
        }
    }

    let mode = match cursor {
        Some(c) if from <= c => PublishMode::Replace,
        _ => PublishMode::Append,
    };
    (entries, mode)
}

/// 統計パブリッシャー
pub struct StatisticsPublisher<S> {
    store: S,
    name: String,
    unit: String,
    resolution: Resolution,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl<S: StatisticsStore> StatisticsPublisher<S> {
    pub fn new(store: S, config: &StoreConfig) -> Self {
        Self {
            store,
            name: config.name.clone(),
            unit: config.unit.clone(),
            resolution: config.resolution,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
        }
    }

    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// 受け付けた点（と未送信分）の累計統計を送信する
    pub async fn publish(
        &self,
        statistic_id: &str,
        record: &LedgerRecord,
        accepted: &[ConsumptionPoint],
        cursor: Option<DateTime<Utc>>,
    ) -> Result<PublishResult, PublishError> {
        let (entries, mode) = plan_entries(record, accepted, cursor, self.resolution);

        if entries.is_empty() {
            info!("Nothing to publish for {}", statistic_id);
            return Ok(PublishResult {
                statistic_id: statistic_id.to_string(),
                submitted: 0,
                mode,
                last_start: None,
                attempts: 0,
            });
        }

        let batch = StatisticBatch {
            metadata: StatisticMetadata::new(statistic_id, self.name.as_str(), self.unit.as_str()),
            entries,
            mode,
        };
        let first_start = batch.entries.first().map(|e| e.start);
        let last_start = batch.entries.last().map(|e| e.start);
        if mode == PublishMode::Replace {
            info!(
                "Overwriting {} already-published entries of {} from {:?}",
                batch.entries.len(),
                statistic_id,
                first_start
            );
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.import(&batch).await {
                Ok(()) => {
                    info!(
                        "Published {} entries to {} ({:?}, attempt {})",
                        batch.entries.len(),
                        statistic_id,
                        mode,
                        attempt
                    );
                    return Ok(PublishResult {
                        statistic_id: statistic_id.to_string(),
                        submitted: batch.entries.len(),
                        mode,
                        last_start,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let backoff = self.initial_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        "Publish attempt {} failed, retrying in {:?}: {}",
                        attempt, backoff, e
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MeteringPoint;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn midnight(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    /// 呼び出しを記録し、用意した応答を順に返すストア
    #[derive(Default)]
    struct ScriptedStore {
        replies: Mutex<VecDeque<Result<(), PublishError>>>,
        batches: Mutex<Vec<StatisticBatch>>,
    }

    impl ScriptedStore {
        fn with_replies(replies: Vec<Result<(), PublishError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn batches(&self) -> Vec<StatisticBatch> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatisticsStore for ScriptedStore {
        async fn import(&self, batch: &StatisticBatch) -> Result<(), PublishError> {
            self.batches.lock().unwrap().push(batch.clone());
            self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn publisher(store: ScriptedStore) -> StatisticsPublisher<ScriptedStore> {
        StatisticsPublisher::new(store, &StoreConfig::default()).with_backoff(Duration::ZERO)
    }

    #[test]
    fn test_plan_uses_prefix_sum_over_whole_ledger() {
        let (record, _) = LedgerRecord::empty(MeteringPoint::new("M1")).merge(vec![
            ConsumptionPoint::daily(d(1), 5.0),
            ConsumptionPoint::daily(d(2), 3.0),
        ]);
        let (record, accepted) = record.merge(vec![ConsumptionPoint::daily(d(3), 2.5)]);

        let (entries, mode) = plan_entries(&record, &accepted, Some(midnight(2)), Resolution::Daily);
        assert_eq!(mode, PublishMode::Append);
        assert_eq!(
            entries,
            vec![StatisticEntry {
                start: midnight(3),
                state: 10.5,
                sum: Some(2.5)
            }]
        );
    }

    #[test]
    fn test_plan_aggregates_hours_into_one_daily_entry() {
        let hours: Vec<_> = (0..24)
            .map(|h| ConsumptionPoint::hourly(d(10), h, if h == 23 { 1.0 } else { 0.5 }))
            .collect();
        let (record, accepted) = LedgerRecord::empty(MeteringPoint::new("M1")).merge(hours);

        let (entries, _) = plan_entries(&record, &accepted, None, Resolution::Daily);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start, midnight(10));
        assert_eq!(entries[0].state, 12.5);

        let (hourly, _) = plan_entries(&record, &accepted, None, Resolution::Hourly);
        assert_eq!(hourly.len(), 24);
        assert_eq!(hourly[0].state, 0.5);
        assert_eq!(hourly[23].state, 12.5);
    }

    #[test]
    fn test_plan_orders_out_of_order_discovery_ascending() {
        // 発見順 D-5, D-3, D-4
        let discovered = vec![
            ConsumptionPoint::daily(d(5), 1.0),
            ConsumptionPoint::daily(d(7), 3.0),
            ConsumptionPoint::daily(d(6), 2.0),
        ];
        let (record, accepted) = LedgerRecord::empty(MeteringPoint::new("M1")).merge(discovered);
        let (entries, _) = plan_entries(&record, &accepted, None, Resolution::Daily);

        let starts: Vec<_> = entries.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![midnight(5), midnight(6), midnight(7)]);
        let states: Vec<_> = entries.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![1.0, 3.0, 6.0]);
    }

    #[test]
    fn test_plan_backfill_before_cursor_replaces_tail() {
        let (record, _) = LedgerRecord::empty(MeteringPoint::new("M1")).merge(vec![
            ConsumptionPoint::daily(d(4), 4.0),
            ConsumptionPoint::daily(d(5), 5.0),
        ]);
        let (record, accepted) = record.merge(vec![ConsumptionPoint::daily(d(2), 2.0)]);

        let (entries, mode) = plan_entries(&record, &accepted, Some(midnight(5)), Resolution::Daily);
        assert_eq!(mode, PublishMode::Replace);
        let states: Vec<_> = entries.iter().map(|e| (e.start, e.state)).collect();
        assert_eq!(
            states,
            vec![(midnight(2), 2.0), (midnight(4), 6.0), (midnight(5), 11.0)]
        );
    }

    #[test]
    fn test_plan_catches_up_after_cursor_without_new_points() {
        let (record, _) = LedgerRecord::empty(MeteringPoint::new("M1")).merge(vec![
            ConsumptionPoint::daily(d(1), 1.0),
            ConsumptionPoint::daily(d(2), 2.0),
        ]);
        let (entries, mode) = plan_entries(&record, &[], Some(midnight(1)), Resolution::Daily);
        assert_eq!(mode, PublishMode::Append);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, 3.0);

        let (entries, _) = plan_entries(&record, &[], Some(midnight(2)), Resolution::Daily);
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_publish_retries_transport_then_succeeds() {
        let store = ScriptedStore::with_replies(vec![
            Err(PublishError::Transport("connection reset".into())),
            Err(PublishError::StaleAuth("auth_invalid".into())),
            Ok(()),
        ]);
        let publisher = publisher(store);
        let (record, accepted) = LedgerRecord::empty(MeteringPoint::new("M1"))
            .merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);

        let result = publisher
            .publish("tampereen_energia:consumption", &record, &accepted, None)
            .await
            .unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(result.submitted, 1);
        assert_eq!(result.last_start, Some(midnight(1)));
        assert_eq!(publisher.store().batches().len(), 3);
    }

    #[tokio::test]
    async fn test_publish_gives_up_after_max_attempts() {
        let store = ScriptedStore::with_replies(vec![
            Err(PublishError::Transport("a".into())),
            Err(PublishError::Transport("b".into())),
            Err(PublishError::Transport("c".into())),
            Ok(()),
        ]);
        let publisher = publisher(store);
        let (record, accepted) = LedgerRecord::empty(MeteringPoint::new("M1"))
            .merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);

        let err = publisher
            .publish("x:y", &record, &accepted, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Transport(ref m) if m == "c"));
        assert_eq!(publisher.store().batches().len(), 3);
    }

    #[tokio::test]
    async fn test_publish_rejected_is_not_retried() {
        let store = ScriptedStore::with_replies(vec![Err(PublishError::Rejected {
            code: "invalid_format".into(),
            message: "bad start".into(),
        })]);
        let publisher = publisher(store);
        let (record, accepted) = LedgerRecord::empty(MeteringPoint::new("M1"))
            .merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);

        let err = publisher
            .publish("x:y", &record, &accepted, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Rejected { .. }));
        assert_eq!(publisher.store().batches().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_nothing_skips_store() {
        let publisher = publisher(ScriptedStore::default());
        let record = LedgerRecord::empty(MeteringPoint::new("M1"));
        let result = publisher.publish("x:y", &record, &[], None).await.unwrap();
        assert_eq!(result.submitted, 0);
        assert!(publisher.store().batches().is_empty());
    }

    #[tokio::test]
    async fn test_publish_batch_metadata() {
        let publisher = publisher(ScriptedStore::default());
        let (record, accepted) = LedgerRecord::empty(MeteringPoint::new("M1"))
            .merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);
        publisher
            .publish("tampereen_energia:consumption", &record, &accepted, None)
            .await
            .unwrap();

        let batch = &publisher.store().batches()[0];
        assert_eq!(batch.metadata.source, "tampereen_energia");
        assert_eq!(batch.metadata.unit, "kWh");
        assert_eq!(batch.mode, PublishMode::Append);
    }
}
