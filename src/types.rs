//! 共通の型定義（計量点・消費量・日付範囲）

use std::fmt;

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// 計量点ID
///
/// 空文字はアカウントの既定計量点を意味する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeteringPoint(String);

impl MeteringPoint {
    const DEFAULT_KEY: &'static str = "default";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    /// アカウントの既定計量点
    pub fn account_default() -> Self {
        Self(String::new())
    }

    pub fn is_account_default(&self) -> bool {
        self.0.is_empty()
    }

    /// リクエストに埋め込むID（既定計量点なら None）
    pub fn request_id(&self) -> Option<&str> {
        if self.is_account_default() {
            None
        } else {
            Some(&self.0)
        }
    }

    /// 台帳上のキー
    pub fn ledger_key(&self) -> &str {
        if self.is_account_default() {
            Self::DEFAULT_KEY
        } else {
            &self.0
        }
    }
}

impl fmt::Display for MeteringPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ledger_key())
    }
}

/// 1時間または1日分の消費量 (kWh)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionPoint {
    pub date: NaiveDate,
    /// 0-23。日次データのみの場合は None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour_index: Option<u8>,
    pub value: f64,
}

impl ConsumptionPoint {
    pub fn hourly(date: NaiveDate, hour: u8, value: f64) -> Self {
        Self {
            date,
            hour_index: Some(hour),
            value,
        }
    }

    pub fn daily(date: NaiveDate, value: f64) -> Self {
        Self {
            date,
            hour_index: None,
            value,
        }
    }

    /// 台帳内の一意キー兼ソートキー
    pub fn key(&self) -> PointKey {
        PointKey {
            date: self.date,
            hour_index: self.hour_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointKey {
    pub date: NaiveDate,
    pub hour_index: Option<u8>,
}

/// 日付範囲（両端を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// start > end の場合は入れ替える
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn is_single_day(&self) -> bool {
        self.start == self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// 暦月ごとに分割する（日次解像度を強制するため月単位で取得する）
    pub fn month_chunks(&self) -> Vec<DateRange> {
        let mut chunks = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let month_end = last_day_of_month(cursor);
            let chunk_end = month_end.min(self.end);
            chunks.push(DateRange::new(cursor, chunk_end));
            match chunk_end.checked_add_days(Days::new(1)) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        chunks
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_day() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end)
        }
    }
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(date)
}
