use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::statistics::Resolution;
use crate::types::MeteringPoint;

pub const DEFAULT_LOGIN_URL: &str = "https://kirjautuminen.tampereenenergia.fi/login";
pub const DEFAULT_CONSUMPTION_URL: &str =
    "https://app.tampereenenergia.fi/PowerPlantDistributionPWA/Consumption";
pub const DEFAULT_STATISTIC_ID: &str = "tampereen_energia:consumption";

/// ポータルのログイン情報
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// パスワードはログに出さない
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// ポータル（ブラウザ・HTTPリプレイ）設定
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub login_url: String,
    pub consumption_url: String,
    /// 捕捉対象の内部APIを示すURL断片
    pub data_action_marker: String,
    pub headless: bool,
    pub debug: bool,
    /// ログイン後ホーム画面への遷移待ち上限
    pub login_timeout: Duration,
    /// 内部API呼び出しの捕捉待ち上限
    pub capture_timeout: Duration,
    /// HTTPリプレイ1回あたりのタイムアウト
    pub request_timeout: Duration,
    /// バックフィル時のリクエスト間隔
    pub request_interval: Duration,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            login_url: DEFAULT_LOGIN_URL.to_string(),
            consumption_url: DEFAULT_CONSUMPTION_URL.to_string(),
            data_action_marker: "DataActionGetData".to_string(),
            headless: true,
            debug: false,
            login_timeout: Duration::from_secs(30),
            capture_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            request_interval: Duration::from_secs(1),
        }
    }
}

/// Home Assistant 統計ストア設定
#[derive(Clone)]
pub struct StoreConfig {
    /// 例: ws://192.168.1.10:8123/api/websocket
    pub url: String,
    pub token: String,
    pub statistic_id: String,
    pub name: String,
    pub unit: String,
    pub resolution: Resolution,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            statistic_id: DEFAULT_STATISTIC_ID.to_string(),
            name: "Tampereen Energia Consumption".to_string(),
            unit: "kWh".to_string(),
            resolution: Resolution::Daily,
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1000),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("token", &"***")
            .field("statistic_id", &self.statistic_id)
            .field("resolution", &self.resolution)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl StoreConfig {
    /// 計量点ごとの統計ID
    ///
    /// 計量点が1つなら設定値そのまま、複数なら `<id>_<英小文字・数字以外を '_' にした計量点>`。
    /// 計量点を1つから増やすと既存の統計IDと送信カーソルが切り替わる。
    /// 接尾辞が衝突する組み合わせは `Config::validate` で拒否する。
    pub fn statistic_id_for(&self, metering_point: &MeteringPoint, point_count: usize) -> String {
        if point_count <= 1 {
            return self.statistic_id.clone();
        }
        let suffix: String = metering_point
            .ledger_key()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", self.statistic_id, suffix)
    }
}

/// サービス全体の設定
#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub metering_points: Vec<MeteringPoint>,
    pub portal: PortalConfig,
    pub store: StoreConfig,
    pub ledger_path: PathBuf,
    /// 計量値確定までの遅れ（日数）
    pub finalization_lag_days: u64,
}

impl Config {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(username, password),
            metering_points: vec![MeteringPoint::account_default()],
            portal: PortalConfig::default(),
            store: StoreConfig::default(),
            ledger_path: PathBuf::from("./data/ledger.json"),
            finalization_lag_days: 2,
        }
    }

    /// 計量点を設定する
    ///
    /// 2つ以上にすると統計IDに計量点ごとの接尾辞が付くため、1つで運用していた
    /// 統計はHome Assistant上で別IDとして新たに作られる（`StoreConfig::statistic_id_for`）。
    pub fn with_metering_points(mut self, points: Vec<MeteringPoint>) -> Self {
        self.metering_points = if points.is_empty() {
            vec![MeteringPoint::account_default()]
        } else {
            points
        };
        self
    }

    pub fn with_store(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.store.url = url.into();
        self.store.token = token.into();
        self
    }

    pub fn with_statistic_id(mut self, statistic_id: impl Into<String>) -> Self {
        self.store.statistic_id = statistic_id.into();
        self
    }

    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = path.into();
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.portal.headless = headless;
        self
    }

    pub fn with_finalization_lag(mut self, days: u64) -> Self {
        self.finalization_lag_days = days;
        self
    }

    /// 計量点ごとの統計IDが重複しないことを確認する
    pub fn validate(&self) -> Result<(), ConfigError> {
        let count = self.metering_points.len();
        let mut seen: HashMap<String, &MeteringPoint> = HashMap::new();
        for mp in &self.metering_points {
            let id = self.store.statistic_id_for(mp, count);
            if let Some(other) = seen.insert(id.clone(), mp) {
                return Err(ConfigError::Invalid {
                    key: "TE_METERINGPOINT",
                    value: format!("{} and {} both map to {}", other, mp, id),
                });
            }
        }
        Ok(())
    }

    /// 環境変数から読み込む
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意のキー参照関数から読み込む
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let mut config = Config::new(required("TE_USERNAME")?, required("TE_PASSWORD")?)
            .with_store(required("HA_URL")?, required("HA_TOKEN")?);

        let points = lookup("TE_METERINGPOINT")
            .map(|raw| {
                raw.split(',')
                    .map(MeteringPoint::new)
                    .filter(|mp| !mp.is_account_default())
                    .collect()
            })
            .unwrap_or_default();
        config = config.with_metering_points(points);

        if let Some(id) = lookup("STATISTIC_ID").filter(|v| !v.trim().is_empty()) {
            if !id.contains(':') {
                return Err(ConfigError::Invalid {
                    key: "STATISTIC_ID",
                    value: id,
                });
            }
            config.store.statistic_id = id;
        }
        if let Some(path) = lookup("LEDGER_PATH").filter(|v| !v.trim().is_empty()) {
            config.ledger_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("HEADLESS") {
            config.portal.headless = parse_bool("HEADLESS", &raw)?;
        }
        if let Some(raw) = lookup("FINALIZATION_LAG_DAYS") {
            config.finalization_lag_days =
                raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: "FINALIZATION_LAG_DAYS",
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = lookup("STATISTICS_RESOLUTION") {
            config.store.resolution = match raw.trim().to_ascii_lowercase().as_str() {
                "daily" => Resolution::Daily,
                "hourly" => Resolution::Hourly,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "STATISTICS_RESOLUTION",
                        value: raw,
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
        }),
    }
}
