//! 統計ストア関連の型定義

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

/// 統計エントリの時間解像度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    #[default]
    Daily,
    Hourly,
}

impl Resolution {
    /// 点が属する統計期間の開始時刻 (UTC, 正時)
    pub fn bucket_start(&self, date: NaiveDate, hour_index: Option<u8>) -> DateTime<Utc> {
        let hour = match self {
            Resolution::Daily => 0,
            Resolution::Hourly => u32::from(hour_index.unwrap_or(0)),
        };
        let naive = date.and_hms_opt(hour, 0, 0).unwrap_or_default();
        Utc.from_utc_datetime(&naive)
    }
}

/// 1期間分の統計値
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticEntry {
    pub start: DateTime<Utc>,
    /// その期間終了時点の累計
    pub state: f64,
    /// 期間内の合計
    pub sum: Option<f64>,
}

/// 統計のメタデータ
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticMetadata {
    /// 例: tampereen_energia:consumption
    pub statistic_id: String,
    pub name: String,
    /// statistic_id の ':' より前
    pub source: String,
    pub unit: String,
}

impl StatisticMetadata {
    pub fn new(
        statistic_id: impl Into<String>,
        name: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        let statistic_id = statistic_id.into();
        let source = statistic_id
            .split_once(':')
            .map(|(source, _)| source.to_string())
            .unwrap_or_else(|| "recorder".to_string());
        Self {
            statistic_id,
            name: name.into(),
            source,
            unit: unit.into(),
        }
    }
}

/// 送信モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// 既送信分より新しい期間のみ
    Append,
    /// 既送信の期間を含む（上書き）
    Replace,
}

/// ストアへの1回の送信内容（start 昇順）
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticBatch {
    pub metadata: StatisticMetadata,
    pub entries: Vec<StatisticEntry>,
    /// 報告用。上書きはストア側のタイムスタンプ単位の置換による
    pub mode: PublishMode,
}

/// 送信結果
#[derive(Debug, Clone, PartialEq)]
pub struct PublishResult {
    pub statistic_id: String,
    pub submitted: usize,
    pub mode: PublishMode,
    pub last_start: Option<DateTime<Utc>>,
    pub attempts: u32,
}
