//! ポータル関連の型定義

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::AuthError;
use crate::types::{DateRange, MeteringPoint};

/// リプレイ時に引き継がないヘッダー
const SKIPPED_HEADERS: &[&str] = &[
    "content-length",
    "host",
    "cookie",
    "connection",
    "accept-encoding",
];

/// 期間指定: 日次/時間別をリクエスト範囲から自動選択させる値
const PERIOD_ID_AUTO: i64 = 9;

/// ブラウザから取得したクッキー
#[derive(Clone)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

impl SessionCookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: path.into(),
        }
    }

    fn matches(&self, host: &str, path: &str) -> bool {
        let domain = self.domain.trim_start_matches('.').to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        let domain_ok = host == domain || host.ends_with(&format!(".{}", domain));
        let cookie_path = if self.path.is_empty() { "/" } else { &self.path };
        domain_ok && path.starts_with(cookie_path)
    }
}

impl fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookie")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// SPAの内部API呼び出しから捕捉したセッション情報
///
/// 実行中のプロセス内でのみ使用し、永続化しない。
#[derive(Clone)]
pub struct SessionContext {
    pub endpoint_url: String,
    /// 捕捉したリクエストヘッダー（CSRFトークン等を含む）
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<SessionCookie>,
    /// 捕捉したリクエストボディ（期間・計量点を差し替えて再利用する）
    pub payload_template: Value,
    pub captured_at: DateTime<Utc>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("SessionContext")
            .field("endpoint_url", &self.endpoint_url)
            .field("headers", &header_names)
            .field("cookies", &self.cookies.len())
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// 捕捉したリクエストから組み立てる
    ///
    /// `raw_headers` は CDP の Network.Headers（ヘッダー名→値のJSONオブジェクト）。
    pub fn from_captured(
        endpoint_url: impl Into<String>,
        raw_headers: &Value,
        post_data: &str,
        cookies: Vec<SessionCookie>,
    ) -> Result<Self, AuthError> {
        let payload_template: Value = serde_json::from_str(post_data).map_err(|e| {
            AuthError::PortalChanged(format!("captured request body is not JSON: {}", e))
        })?;
        if !is_data_request(&payload_template) {
            return Err(AuthError::PortalChanged(
                "captured request has no screenData.variables.FilterParameters".to_string(),
            ));
        }

        let headers = raw_headers
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter(|(name, _)| {
                        let lower = name.to_ascii_lowercase();
                        !lower.starts_with(':') && !SKIPPED_HEADERS.contains(&lower.as_str())
                    })
                    .filter_map(|(name, value)| {
                        value.as_str().map(|v| (name.clone(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            endpoint_url: endpoint_url.into(),
            headers,
            cookies,
            payload_template,
            captured_at: Utc::now(),
        })
    }

    /// エンドポイントのホスト・パスに該当するクッキーを Cookie ヘッダー形式で返す
    pub fn cookie_header(&self) -> Option<String> {
        let url = reqwest::Url::parse(&self.endpoint_url).ok()?;
        let host = url.host_str()?;
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches(host, url.path()))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// 期間・計量点を差し替えたリクエストボディを作る
    pub fn build_payload(&self, metering_point: &MeteringPoint, range: DateRange) -> Value {
        let mut payload = self.payload_template.clone();

        if let Some(filter) = payload.pointer_mut("/screenData/variables/FilterParameters") {
            filter["StartDate"] = json!(format!("{}T00:00:00.000Z", range.start.format("%Y-%m-%d")));
            filter["EndDate"] = json!(format!("{}T23:59:59.000Z", range.end.format("%Y-%m-%d")));
            filter["PeriodId"] = json!(PERIOD_ID_AUTO);
            if let Some(id) = metering_point.request_id() {
                filter["MeteringPointId"] = json!(id);
            }
        }

        // 複数日の取得ではアーカイブ済みデータを解放させる
        if !range.is_single_day() {
            if let Some(variables) = payload.pointer_mut("/screenData/variables") {
                variables["IsHistoricaDataFetched"] = json!(true);
            }
        }

        payload
    }
}

/// 消費量データ取得リクエストのボディか
pub fn is_data_request(body: &Value) -> bool {
    body.pointer("/screenData/variables/FilterParameters")
        .map(Value::is_object)
        .unwrap_or(false)
}
