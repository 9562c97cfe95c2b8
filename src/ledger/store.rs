//! 台帳ファイルの読み書き（アトミック置換）

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::types::MeteringPoint;

use super::record::{LedgerRecord, TOTAL_EPSILON};

const FORMAT_VERSION: u32 = 1;

/// ファイル全体の構造
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, LedgerRecord>,
    /// 統計IDごとの送信済み最終タイムスタンプ
    #[serde(default)]
    cursors: BTreeMap<String, DateTime<Utc>>,
}

/// デプロイメントごとに1ファイルの台帳
#[derive(Debug)]
pub struct LedgerStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 計量点の台帳を読み込む（無ければ空のレコード）
    pub fn load(&self, metering_point: &MeteringPoint) -> Result<LedgerRecord, LedgerError> {
        let _guard = self.guard();
        let doc = self.read_document()?;
        match doc.records.get(metering_point.ledger_key()) {
            Some(record) => {
                if !record.is_consistent() {
                    return Err(LedgerError::Inconsistent {
                        metering_point: metering_point.to_string(),
                        recorded: record.running_cumulative_total,
                        recomputed: record.recomputed_total(),
                    });
                }
                debug!(
                    "Loaded ledger for {}: {} points, total {:.3} kWh",
                    metering_point,
                    record.points.len(),
                    record.running_cumulative_total
                );
                Ok(record.clone())
            }
            None => {
                debug!("No ledger entry for {}, starting empty", metering_point);
                Ok(LedgerRecord::empty(metering_point.clone()))
            }
        }
    }

    /// レコードを永続化する
    ///
    /// 累計が点列と一致しないレコード、およびディスク上の内容から点が減る・累計が
    /// 下がるレコードは拒否する。
    pub fn persist(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let key = record.metering_point.ledger_key().to_string();
        if !record.is_consistent() {
            return Err(LedgerError::Inconsistent {
                metering_point: key,
                recorded: record.running_cumulative_total,
                recomputed: record.recomputed_total(),
            });
        }

        let _guard = self.guard();
        let mut doc = self.read_document()?;

        if let Some(existing) = doc.records.get(&key) {
            if record.running_cumulative_total + TOTAL_EPSILON < existing.running_cumulative_total
            {
                return Err(LedgerError::Regression {
                    metering_point: key,
                    reason: format!(
                        "total would drop from {} to {}",
                        existing.running_cumulative_total, record.running_cumulative_total
                    ),
                });
            }
            if let Some(missing) = existing.points.iter().find(|p| !record.contains(&p.key())) {
                return Err(LedgerError::Regression {
                    metering_point: key,
                    reason: format!(
                        "point {} hour {:?} would be dropped",
                        missing.date, missing.hour_index
                    ),
                });
            }
        }

        doc.records.insert(key, record.clone());
        self.write_document(&doc)?;
        info!(
            "Persisted ledger for {}: {} points, total {:.3} kWh",
            record.metering_point,
            record.points.len(),
            record.running_cumulative_total
        );
        Ok(())
    }

    /// 統計IDの送信カーソルを読む
    pub fn load_cursor(&self, statistic_id: &str) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let _guard = self.guard();
        Ok(self.read_document()?.cursors.get(statistic_id).copied())
    }

    /// 統計IDの送信カーソルを進める
    pub fn persist_cursor(
        &self,
        statistic_id: &str,
        last_start: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let _guard = self.guard();
        let mut doc = self.read_document()?;
        let current = doc.cursors.get(statistic_id).copied();
        // 再送でカーソルが過去に戻ることはない
        if current.map_or(true, |c| last_start > c) {
            doc.cursors.insert(statistic_id.to_string(), last_start);
            self.write_document(&doc)?;
            debug!("Publish cursor for {} -> {}", statistic_id, last_start);
        }
        Ok(())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // 保護対象はファイルのみなので poisoned でも継続できる
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_document(&self) -> Result<LedgerDocument, LedgerError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerDocument {
                    version: FORMAT_VERSION,
                    ..Default::default()
                })
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|source| LedgerError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// 一時ファイルに書いてから rename で置き換える
    fn write_document(&self, doc: &LedgerDocument) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(doc).map_err(std::io::Error::from)?;
        let tmp_path = self.temp_path();

        let written = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger.json".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConsumptionPoint;
    use chrono::{NaiveDate, TimeZone};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn store_in(dir: &tempfile::TempDir) -> LedgerStore {
        LedgerStore::new(dir.path().join("data").join("ledger.json"))
    }

    #[test]
    fn test_load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let record = store.load(&MeteringPoint::new("M1")).unwrap();
        assert!(record.is_empty());
        assert_eq!(record.running_cumulative_total, 0.0);
        assert_eq!(record.last_finalized_date, None);
    }

    #[test]
    fn test_persist_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mp = MeteringPoint::new("M1");
        let (record, _) = LedgerRecord::empty(mp.clone()).merge(vec![
            ConsumptionPoint::hourly(d(10), 0, 0.375),
            ConsumptionPoint::hourly(d(10), 1, 1.125),
            ConsumptionPoint::daily(d(9), 8.5),
        ]);
        store.persist(&record).unwrap();

        let reloaded = store.load(&mp).unwrap();
        assert_eq!(reloaded, record);
        assert_eq!(reloaded.running_cumulative_total, 10.0);

        // 一時ファイルは残らない
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("data"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_metering_points_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let (a, _) = LedgerRecord::empty(MeteringPoint::new("A"))
            .merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);
        let (b, _) = LedgerRecord::empty(MeteringPoint::new("B"))
            .merge(vec![ConsumptionPoint::daily(d(1), 2.0)]);
        store.persist(&a).unwrap();
        store.persist(&b).unwrap();

        assert_eq!(store.load(&MeteringPoint::new("A")).unwrap(), a);
        assert_eq!(store.load(&MeteringPoint::new("B")).unwrap(), b);
    }

    #[test]
    fn test_corrupt_file_is_reported_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{\"version\": 1, \"records\": {").unwrap();

        let err = store.load(&MeteringPoint::new("M1")).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));

        let (record, _) = LedgerRecord::empty(MeteringPoint::new("M1"))
            .merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);
        assert!(matches!(
            store.persist(&record),
            Err(LedgerError::Corrupt { .. })
        ));
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "{\"version\": 1, \"records\": {"
        );
    }

    #[test]
    fn test_persist_refuses_inconsistent_total() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let (mut record, _) = LedgerRecord::empty(MeteringPoint::new("M1"))
            .merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);
        record.running_cumulative_total = 5.0;
        assert!(matches!(
            store.persist(&record),
            Err(LedgerError::Inconsistent { .. })
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_persist_refuses_regression() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mp = MeteringPoint::new("M1");
        let (full, _) = LedgerRecord::empty(mp.clone()).merge(vec![
            ConsumptionPoint::daily(d(1), 1.0),
            ConsumptionPoint::daily(d(2), 2.0),
        ]);
        store.persist(&full).unwrap();

        let (shorter, _) =
            LedgerRecord::empty(mp.clone()).merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);
        assert!(matches!(
            store.persist(&shorter),
            Err(LedgerError::Regression { .. })
        ));
        assert_eq!(store.load(&mp).unwrap(), full);
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let id = "tampereen_energia:consumption";
        assert_eq!(store.load_cursor(id).unwrap(), None);

        let later = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        store.persist_cursor(id, later).unwrap();
        store.persist_cursor(id, earlier).unwrap();
        assert_eq!(store.load_cursor(id).unwrap(), Some(later));
    }

    #[test]
    fn test_cursor_and_records_share_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mp = MeteringPoint::new("M1");
        let (record, _) =
            LedgerRecord::empty(mp.clone()).merge(vec![ConsumptionPoint::daily(d(1), 1.0)]);
        store.persist(&record).unwrap();
        store
            .persist_cursor("x:y", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .unwrap();
        assert_eq!(store.load(&mp).unwrap(), record);
    }
}
