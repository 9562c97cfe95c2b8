//! 計量点ごとの台帳レコードとマージ処理

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{ConsumptionPoint, MeteringPoint, PointKey};

/// 累計比較の許容誤差 (kWh)
pub(crate) const TOTAL_EPSILON: f64 = 1e-6;

/// 1計量点分の台帳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub metering_point: MeteringPoint,
    /// (date, hour_index) 昇順
    pub points: Vec<ConsumptionPoint>,
    pub last_finalized_date: Option<NaiveDate>,
    pub running_cumulative_total: f64,
}

/// 日付ごとの保持粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    Hourly,
    Daily,
}

fn granularity(point: &ConsumptionPoint) -> Granularity {
    if point.hour_index.is_some() {
        Granularity::Hourly
    } else {
        Granularity::Daily
    }
}

/// 台帳に入れられない点なら理由を返す
fn invalid_reason(point: &ConsumptionPoint) -> Option<&'static str> {
    if point.hour_index.map_or(false, |h| h > 23) {
        Some("hour index out of range")
    } else if !point.value.is_finite() {
        Some("value is not finite")
    } else if point.value < 0.0 {
        Some("negative value")
    } else {
        None
    }
}

impl LedgerRecord {
    pub fn empty(metering_point: MeteringPoint) -> Self {
        Self {
            metering_point,
            points: Vec::new(),
            last_finalized_date: None,
            running_cumulative_total: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 点列から累計を再計算する
    pub fn recomputed_total(&self) -> f64 {
        self.points.iter().map(|p| p.value).sum()
    }

    pub fn is_consistent(&self) -> bool {
        (self.recomputed_total() - self.running_cumulative_total).abs() <= TOTAL_EPSILON
    }

    /// 点ごとの累計（その点を含む）
    pub fn prefix_totals(&self) -> Vec<(PointKey, f64)> {
        let mut running = 0.0;
        self.points
            .iter()
            .map(|p| {
                running += p.value;
                (p.key(), running)
            })
            .collect()
    }

    pub fn contains(&self, key: &PointKey) -> bool {
        self.points
            .binary_search_by(|p| p.key().cmp(key))
            .is_ok()
    }

    /// 新しい点をマージする
    ///
    /// 既存の (date, hour_index) と重複する点、および既に別の粒度で保持している
    /// 日付の点は受け付けない。受け付けた点を取得順のまま返す。
    /// 累計は必ず点列から再計算する。
    pub fn merge(mut self, new_points: Vec<ConsumptionPoint>) -> (Self, Vec<ConsumptionPoint>) {
        let mut held: HashMap<NaiveDate, Granularity> = self
            .points
            .iter()
            .map(|p| (p.date, granularity(p)))
            .collect();
        let mut seen: HashSet<PointKey> = self.points.iter().map(|p| p.key()).collect();

        let mut accepted = Vec::new();
        for point in new_points {
            if let Some(reason) = invalid_reason(&point) {
                warn!(
                    "Dropping point {} hour {:?} for {}: {}",
                    point.date, point.hour_index, self.metering_point, reason
                );
                continue;
            }
            let key = point.key();
            if seen.contains(&key) {
                continue;
            }
            let incoming = granularity(&point);
            match held.get(&point.date) {
                Some(existing) if *existing != incoming => {
                    debug!(
                        "Skipping {:?} point for {} in {}: date already held as {:?}",
                        incoming, point.date, self.metering_point, existing
                    );
                    continue;
                }
                _ => {}
            }
            held.insert(point.date, incoming);
            seen.insert(key);
            accepted.push(point);
        }

        if accepted.is_empty() {
            return (self, accepted);
        }

        self.points.extend(accepted.iter().cloned());
        self.points.sort_by_key(|p| p.key());
        self.running_cumulative_total = self.recomputed_total();
        self.last_finalized_date = self.points.last().map(|p| p.date);

        (self, accepted)
    }
}
