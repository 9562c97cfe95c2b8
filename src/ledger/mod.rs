//! ローカル台帳モジュール
//!
//! 取得済みの全消費量と累計を保持する追記専用の記録。統計ストアが
//! リセットされても復元できるバックアップを兼ねる。

mod record;
mod store;

pub use record::LedgerRecord;
pub use store::LedgerStore;
