//! 捕捉したセッションを使った内部APIの直接呼び出し

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike};
use reqwest::header::COOKIE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::traits::DataFetcher;
use crate::types::{ConsumptionPoint, DateRange, MeteringPoint};

use super::types::SessionContext;

/// 1日あたりの時間数（UTC基準のため夏時間の増減はない）
const HOURS_PER_DAY: usize = 24;

/// 認証切れを示す OutSystems 例外名の断片
const AUTH_EXCEPTION_MARKERS: &[&str] = &["Security", "NotRegistered", "Login", "Session"];

/// reqwest で内部APIをリプレイするフェッチャー
#[derive(Debug, Clone)]
pub struct HttpDataFetcher {
    client: reqwest::Client,
}

impl HttpDataFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("HTTP client init: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DataFetcher for HttpDataFetcher {
    async fn fetch(
        &self,
        session: &SessionContext,
        metering_point: &MeteringPoint,
        range: DateRange,
    ) -> Result<Vec<ConsumptionPoint>, FetchError> {
        info!("Fetching consumption for {} ({})", metering_point, range);
        let payload = session.build_payload(metering_point, range);

        let mut request = self.client.post(&session.endpoint_url);
        for (name, value) in &session.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(cookie) = session.cookie_header() {
            request = request.header(COOKIE, cookie);
        }

        let response = request.json(&payload).send().await.map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        debug!("DataActionGetData -> HTTP {} ({} bytes)", status, body.len());

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::AuthExpired(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(FetchError::portal(
                format!("HTTP {} for {} ({})", status.as_u16(), metering_point, range),
                &body,
            ));
        }

        let points = parse_response(&body, range)?;
        info!(
            "Got {} complete points for {} ({})",
            points.len(),
            metering_point,
            range
        );
        Ok(points)
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_builder() {
        FetchError::Portal {
            message: format!("captured request could not be replayed: {}", e),
            excerpt: String::new(),
        }
    } else if e.is_timeout() {
        FetchError::Network(format!("request timed out: {}", e))
    } else {
        FetchError::Network(e.to_string())
    }
}

/// 応答の1要素
#[derive(Debug, Clone, PartialEq)]
struct RawItem {
    date: NaiveDate,
    hour: u32,
    value: Option<f64>,
}

/// 応答を解析し、確定済みの点だけを返す
///
/// 単日の取得は時間別、複数日の取得では日付ごとに要素が1つなら日次合計、複数なら
/// 時間別として扱う。時間別の日は24時間すべてに値があり、かつ全てゼロ（未計測の
/// プレースホルダー）でない場合のみ確定とみなす。日次は値の無い日と末尾のゼロ日を
/// 未確定として除外する。
pub(crate) fn parse_response(
    body: &str,
    range: DateRange,
) -> Result<Vec<ConsumptionPoint>, FetchError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| FetchError::portal(format!("response is not JSON: {}", e), body))?;

    if let Some(exception) = value.get("exception").filter(|v| !v.is_null()) {
        let name = exception
            .get("name")
            .or_else(|| exception.get("specificType"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if AUTH_EXCEPTION_MARKERS.iter().any(|m| name.contains(m)) {
            return Err(FetchError::AuthExpired(format!("portal exception {}", name)));
        }
        return Err(FetchError::portal(format!("portal exception {}", name), body));
    }

    let list = value
        .pointer("/data/Dataset/Data/List")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::portal("missing data.Dataset.Data.List", body))?;

    let mut by_date: BTreeMap<NaiveDate, Vec<RawItem>> = BTreeMap::new();
    for item in list {
        let raw = parse_item(item).map_err(|message| FetchError::portal(message, body))?;
        if raw.date < range.start || raw.date > range.end {
            debug!("Ignoring item outside requested range: {}", raw.date);
            continue;
        }
        by_date.entry(raw.date).or_default().push(raw);
    }

    if by_date.is_empty() {
        return Err(FetchError::IncompleteData(format!(
            "no values reported for {}",
            range
        )));
    }

    let mut points = Vec::new();
    let mut daily: Vec<(NaiveDate, f64)> = Vec::new();
    let expect_hourly = range.is_single_day();
    for (date, items) in &by_date {
        if !expect_hourly && items.len() == 1 {
            match items[0].value {
                Some(v) => daily.push((*date, v)),
                None => debug!("{}: daily value not reported yet", date),
            }
            continue;
        }
        match complete_hours(*date, items) {
            Some(hours) => points.extend(hours),
            None => debug!("{}: hourly values incomplete ({} items)", date, items.len()),
        }
    }

    // 末尾のゼロ日は未計測の可能性が高い
    while daily.last().map_or(false, |(_, v)| *v == 0.0) {
        if let Some((date, _)) = daily.pop() {
            debug!("{}: trailing zero daily total treated as not yet reported", date);
        }
    }
    points.extend(daily.into_iter().map(|(d, v)| ConsumptionPoint::daily(d, v)));
    points.sort_by_key(|p| p.key());

    if points.is_empty() {
        return Err(FetchError::IncompleteData(format!(
            "{} is not finalized yet",
            range
        )));
    }

    let skipped = range.days().count().saturating_sub(
        points
            .iter()
            .map(|p| p.date)
            .collect::<std::collections::BTreeSet<_>>()
            .len(),
    );
    if skipped > 0 && !range.is_single_day() {
        warn!("{} day(s) in {} are not finalized and were skipped", skipped, range);
    }

    Ok(points)
}

fn complete_hours(date: NaiveDate, items: &[RawItem]) -> Option<Vec<ConsumptionPoint>> {
    let mut hours: BTreeMap<u32, f64> = BTreeMap::new();
    for item in items {
        let value = item.value?;
        hours.entry(item.hour).or_insert(value);
    }
    if hours.len() != HOURS_PER_DAY || hours.values().all(|v| *v == 0.0) {
        return None;
    }
    Some(
        hours
            .into_iter()
            .map(|(h, v)| ConsumptionPoint::hourly(date, h as u8, v))
            .collect(),
    )
}

fn parse_item(item: &Value) -> Result<RawItem, String> {
    let date_from = item
        .get("DateFrom")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("item without DateFrom: {}", item))?;
    let stamp = parse_wall_clock(date_from)
        .ok_or_else(|| format!("unparsable DateFrom: {}", date_from))?;
    let value = parse_consumption(item.get("Consumption"))?;
    if let Some(v) = value {
        if v < 0.0 || !v.is_finite() {
            return Err(format!("invalid consumption {} at {}", v, date_from));
        }
    }
    Ok(RawItem {
        date: stamp.date(),
        hour: stamp.hour(),
        value,
    })
}

/// ポータルが返した表記どおりの日時（オフセットは換算しない）
fn parse_wall_clock(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive);
    }
    raw.get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn parse_consumption(raw: Option<&Value>) -> Result<Option<f64>, String> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("unparsable consumption {:?}", s)),
        Some(other) => Err(format!("unexpected consumption value {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::types::SessionCookie;
    use httpmock::prelude::*;
    use serde_json::json;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn hourly_body(date: &str, values: &[Value]) -> String {
        let list: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(h, v)| json!({"DateFrom": format!("{}T{:02}:00:00Z", date, h), "Consumption": v}))
            .collect();
        json!({
            "data": {
                "Dataset": {
                    "Data": {"List": list},
                    "Summary": {"TotalConsumptionSum": 12.5}
                }
            }
        })
        .to_string()
    }

    fn twelve_and_a_half() -> Vec<Value> {
        let mut values: Vec<Value> = (0..23).map(|_| json!(0.5)).collect();
        values.push(json!("1,0"));
        values
    }

    #[test]
    fn test_parse_complete_hourly_day() {
        let body = hourly_body("2024-01-10", &twelve_and_a_half());
        let points = parse_response(&body, DateRange::single(d(10))).unwrap();
        assert_eq!(points.len(), 24);
        assert_eq!(points[23], ConsumptionPoint::hourly(d(10), 23, 1.0));
        let total: f64 = points.iter().map(|p| p.value).sum();
        assert_eq!(total, 12.5);
    }

    #[test]
    fn test_parse_partial_day_is_incomplete() {
        let values: Vec<Value> = (0..17).map(|_| json!(0.4)).collect();
        let body = hourly_body("2024-01-10", &values);
        let err = parse_response(&body, DateRange::single(d(10))).unwrap_err();
        assert!(matches!(err, FetchError::IncompleteData(_)));
    }

    #[test]
    fn test_parse_null_hour_is_incomplete() {
        let mut values = twelve_and_a_half();
        values[5] = Value::Null;
        let body = hourly_body("2024-01-10", &values);
        assert!(matches!(
            parse_response(&body, DateRange::single(d(10))),
            Err(FetchError::IncompleteData(_))
        ));
    }

    #[test]
    fn test_parse_all_zero_placeholder_is_incomplete() {
        let values: Vec<Value> = (0..24).map(|_| json!(0)).collect();
        let body = hourly_body("2024-01-10", &values);
        assert!(matches!(
            parse_response(&body, DateRange::single(d(10))),
            Err(FetchError::IncompleteData(_))
        ));
    }

    #[test]
    fn test_parse_empty_list_is_incomplete() {
        let body = hourly_body("2024-01-10", &[]);
        assert!(matches!(
            parse_response(&body, DateRange::single(d(10))),
            Err(FetchError::IncompleteData(_))
        ));
    }

    #[test]
    fn test_parse_daily_range_drops_unreported_tail() {
        let body = json!({
            "data": {"Dataset": {"Data": {"List": [
                {"DateFrom": "2024-01-01T00:00:00.000Z", "Consumption": 10.5},
                {"DateFrom": "2024-01-02T00:00:00.000Z", "Consumption": "0"},
                {"DateFrom": "2024-01-03T00:00:00.000Z", "Consumption": 9.25},
                {"DateFrom": "2024-01-04T00:00:00.000Z", "Consumption": null},
                {"DateFrom": "2024-01-05T00:00:00.000Z", "Consumption": 0},
            ]}}}
        })
        .to_string();
        let points = parse_response(&body, DateRange::new(d(1), d(31))).unwrap();
        assert_eq!(
            points,
            vec![
                ConsumptionPoint::daily(d(1), 10.5),
                ConsumptionPoint::daily(d(2), 0.0),
                ConsumptionPoint::daily(d(3), 9.25),
            ]
        );
    }

    #[test]
    fn test_parse_negative_value_is_portal_error() {
        let mut values = twelve_and_a_half();
        values[0] = json!(-1.0);
        let body = hourly_body("2024-01-10", &values);
        assert!(matches!(
            parse_response(&body, DateRange::single(d(10))),
            Err(FetchError::Portal { .. })
        ));
    }

    #[test]
    fn test_parse_missing_list_is_portal_error() {
        let err = parse_response(r#"{"data":{"Dataset":null}}"#, DateRange::single(d(10)))
            .unwrap_err();
        match err {
            FetchError::Portal { excerpt, .. } => assert!(excerpt.contains("Dataset")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_security_exception_is_auth_expired() {
        let body = r#"{"exception":{"name":"OutSystems.RESTService.Security.NotRegistered","message":"x"}}"#;
        assert!(matches!(
            parse_response(body, DateRange::single(d(10))),
            Err(FetchError::AuthExpired(_))
        ));
        let body = r#"{"exception":{"name":"ServerException","message":"boom"}}"#;
        assert!(matches!(
            parse_response(body, DateRange::single(d(10))),
            Err(FetchError::Portal { .. })
        ));
    }

    fn session_for(server: &MockServer) -> SessionContext {
        let headers = json!({"X-CSRFToken": "T0k3n", "Content-Type": "application/json; charset=UTF-8"});
        let template = json!({"screenData": {"variables": {"FilterParameters": {"PeriodId": 3}}}});
        let host = reqwest::Url::parse(&server.base_url())
            .unwrap()
            .host_str()
            .unwrap()
            .to_string();
        SessionContext::from_captured(
            server.url("/PWA/DataActionGetData"),
            &headers,
            &template.to_string(),
            vec![SessionCookie::new("nr2Users", "abc", host, "/")],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_replays_captured_headers() {
        let server = MockServer::start_async().await;
        let body = hourly_body("2024-01-10", &twelve_and_a_half());
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/PWA/DataActionGetData")
                    .header("x-csrftoken", "T0k3n")
                    .header("cookie", "nr2Users=abc");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(body);
            })
            .await;

        let fetcher = HttpDataFetcher::new(Duration::from_secs(5)).unwrap();
        let points = fetcher
            .fetch(
                &session_for(&server),
                &MeteringPoint::new("M1"),
                DateRange::single(d(10)),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(points.len(), 24);
    }

    #[tokio::test]
    async fn test_fetch_unauthorized_is_auth_expired() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/PWA/DataActionGetData");
                then.status(401).body("Unauthorized");
            })
            .await;

        let fetcher = HttpDataFetcher::new(Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch(
                &session_for(&server),
                &MeteringPoint::new("M1"),
                DateRange::single(d(10)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn test_fetch_server_error_is_portal_error_with_excerpt() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/PWA/DataActionGetData");
                then.status(500).body("<html>Internal error</html>");
            })
            .await;

        let fetcher = HttpDataFetcher::new(Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch(
                &session_for(&server),
                &MeteringPoint::new("M1"),
                DateRange::single(d(10)),
            )
            .await
            .unwrap_err();
        match err {
            FetchError::Portal { message, excerpt } => {
                assert!(message.contains("HTTP 500"));
                assert!(excerpt.contains("Internal error"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host_is_network_error() {
        let mut session = {
            let server = MockServer::start_async().await;
            session_for(&server)
        };
        session.endpoint_url = "http://127.0.0.1:9/PWA/DataActionGetData".to_string();

        let fetcher = HttpDataFetcher::new(Duration::from_secs(2)).unwrap();
        let err = fetcher
            .fetch(&session, &MeteringPoint::new("M1"), DateRange::single(d(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }

    #[tokio::test]
    async fn test_fetch_slow_portal_times_out_as_network_error() {
        let server = MockServer::start_async().await;
        let body = hourly_body("2024-01-10", &twelve_and_a_half());
        server
            .mock_async(|when, then| {
                when.method(POST).path("/PWA/DataActionGetData");
                then.status(200)
                    .header("content-type", "application/json")
                    .delay(Duration::from_millis(1500))
                    .body(body);
            })
            .await;

        let fetcher = HttpDataFetcher::new(Duration::from_millis(200)).unwrap();
        let err = fetcher
            .fetch(
                &session_for(&server),
                &MeteringPoint::new("M1"),
                DateRange::single(d(10)),
            )
            .await
            .unwrap_err();
        match err {
            FetchError::Network(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(FetchError::Network(String::new()).is_retryable());
    }
}
