use async_trait::async_trait;

use crate::config::Credentials;
use crate::error::{AuthError, FetchError, PublishError};
use crate::portal::SessionContext;
use crate::statistics::StatisticBatch;
use crate::types::{ConsumptionPoint, DateRange, MeteringPoint};

/// ポータルへのログインとセッション捕捉
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// ログインし、内部API呼び出しに必要なセッション情報を返す
    ///
    /// ブラウザ等のリソースは戻る前に必ず解放する。
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionContext, AuthError>;
}

/// 捕捉したセッションでの消費量取得
#[async_trait]
pub trait DataFetcher: Send + Sync {
    /// 確定済みの点のみを返す。未確定なら `FetchError::IncompleteData`
    async fn fetch(
        &self,
        session: &SessionContext,
        metering_point: &MeteringPoint,
        range: DateRange,
    ) -> Result<Vec<ConsumptionPoint>, FetchError>;
}

/// 長期統計ストア
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    /// バッチを送信する
    ///
    /// ストアは同じ `start` の既存エントリを置き換えること。`PublishMode::Replace`
    /// の上書きはこの置換だけで成立し、`batch.mode` 自体はワイヤーに載らない
    /// （ログと結果報告用）。
    async fn import(&self, batch: &StatisticBatch) -> Result<(), PublishError>;
}
