use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 応答抜粋の最大文字数
const EXCERPT_CHARS: usize = 300;

/// セッションブローカー（ログイン・API捕捉）のエラー
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("ログインエラー: {0}")]
    InvalidCredentials(String),

    #[error("ポータル画面の構成が変わっています: {0}")]
    PortalChanged(String),

    #[error("APIリクエストを{0:?}以内に捕捉できませんでした")]
    CaptureTimeout(Duration),
}

/// データ取得（HTTPリプレイ）のエラー
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("セッション期限切れ: {0}")]
    AuthExpired(String),

    #[error("データ未確定: {0}")]
    IncompleteData(String),

    #[error("ポータルエラー: {message} (応答抜粋: {excerpt})")]
    Portal { message: String, excerpt: String },

    #[error("通信エラー: {0}")]
    Network(String),
}

impl FetchError {
    pub(crate) fn portal(message: impl Into<String>, body: &str) -> Self {
        FetchError::Portal {
            message: message.into(),
            excerpt: excerpt(body),
        }
    }

    /// 同一実行内で一度だけ再試行してよいか
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// 統計ストアへの送信エラー
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("送信エラー: {0}")]
    Transport(String),

    #[error("ストアが拒否しました: {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("ストア認証エラー: {0}")]
    StaleAuth(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transport(_) | PublishError::StaleAuth(_))
    }
}

/// ローカル台帳のエラー
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ファイル操作エラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("台帳ファイルが壊れています: {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("累計値が不整合です ({metering_point}): 記録={recorded}, 再計算={recomputed}")]
    Inconsistent {
        metering_point: String,
        recorded: f64,
        recomputed: f64,
    },

    #[error("台帳の後退を拒否しました ({metering_point}): {reason}")]
    Regression {
        metering_point: String,
        reason: String,
    },
}

/// 設定エラー
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("必須設定がありません: {0}")]
    Missing(&'static str),

    #[error("設定値が不正です: {key}={value}")]
    Invalid { key: &'static str, value: String },
}

/// 一回の実行全体のエラー
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// ログ用に応答本文を切り詰める（文字境界を維持）
pub(crate) fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let body = "ä".repeat(400);
        let cut = excerpt(&body);
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 1);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn test_excerpt_keeps_short_body() {
        assert_eq!(excerpt("  {\"x\":1}\n"), "{\"x\":1}");
    }

    #[test]
    fn test_retryable_classes() {
        assert!(FetchError::Network("timeout".into()).is_retryable());
        assert!(!FetchError::IncompleteData("x".into()).is_retryable());
        assert!(!FetchError::AuthExpired("401".into()).is_retryable());
        assert!(PublishError::Transport("reset".into()).is_retryable());
        assert!(PublishError::StaleAuth("auth_invalid".into()).is_retryable());
        assert!(!PublishError::Rejected {
            code: "invalid_format".into(),
            message: "bad".into()
        }
        .is_retryable());
    }
}
