//! ヘッドレスブラウザによるログインとAPIリクエスト捕捉

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventRequestWillBeSent, GetRequestPostDataParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{Credentials, PortalConfig};
use crate::error::AuthError;
use crate::traits::SessionBroker;

use super::types::{is_data_request, SessionCookie, SessionContext};

/// ログインフォーム出現待ち（秒）
const LOGIN_FORM_WAIT_SECS: u64 = 15;
/// クッキー同意ダイアログ待ち（秒）
const CONSENT_WAIT_SECS: u64 = 2;
/// 「Siirry palveluun」ボタン待ち（秒）
const SERVICE_BUTTON_WAIT_SECS: u64 = 10;

const CONSENT_BUTTON_TEXT: &str = "Hyväksy";
const SERVICE_BUTTON_TEXT: &str = "Siirry palveluun";
const HOME_URL_MARKER: &str = "/Home";

/// 捕捉したリクエスト
struct CapturedRequest {
    url: String,
    headers: serde_json::Value,
    post_data: String,
}

/// chromiumoxide でポータルにログインし、SPAの内部API呼び出しを捕捉する
pub struct ChromiumSessionBroker {
    config: PortalConfig,
}

impl ChromiumSessionBroker {
    pub fn new(config: PortalConfig) -> Self {
        Self { config }
    }

    /// ブラウザを起動
    async fn launch(&self) -> Result<(Browser, JoinHandle<()>, PathBuf), AuthError> {
        // ユニークなユーザーデータディレクトリを生成
        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("energy-scraper-{}", unique_id));

        let chrome_path = std::env::var("CHROME_PATH")
            .or_else(|_| std::env::var("CHROMIUM_PATH"))
            .unwrap_or_else(|_| "chromium".to_string());

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&user_data_dir)
            .window_size(1280, 800);

        if !self.config.headless {
            builder = builder.with_head();
        }

        builder = builder
            .no_sandbox()
            .request_timeout(self.config.request_timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if self.config.debug {
            builder = builder.arg("--enable-logging=stderr").arg("--v=1");
        }

        let browser_config = builder.build().map_err(AuthError::BrowserInit)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| AuthError::BrowserInit(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {:?}", e);
                }
            }
        });

        info!("Browser launched");
        Ok((browser, handler_task, user_data_dir))
    }

    /// ブラウザを終了し一時ディレクトリを削除する
    async fn shutdown(browser: &mut Browser, handler_task: JoinHandle<()>, user_data_dir: &Path) {
        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        if let Err(e) = browser.wait().await {
            debug!("Browser wait failed: {}", e);
        }
        handler_task.abort();
        if let Err(e) = std::fs::remove_dir_all(user_data_dir) {
            debug!("Failed to remove user data dir {:?}: {}", user_data_dir, e);
        }
        info!("Browser closed");
    }

    async fn capture_session(
        &self,
        browser: &Browser,
        credentials: &Credentials,
    ) -> Result<SessionContext, AuthError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AuthError::BrowserInit(e.to_string()))?;

        // ナビゲーション前に購読しておく
        page.execute(EnableParams::default())
            .await
            .map_err(|e| AuthError::BrowserInit(format!("Network.enable: {}", e)))?;
        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| AuthError::BrowserInit(e.to_string()))?;

        self.login(&page, credentials).await?;

        info!("Opening consumption view to trigger the data request...");
        page.goto(self.config.consumption_url.as_str())
            .await
            .map_err(|e| AuthError::Navigation(e.to_string()))?;

        let deadline = Instant::now() + self.config.capture_timeout;
        let captured = loop {
            let event = match tokio::time::timeout_at(deadline, requests.next()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(AuthError::PortalChanged(
                        "network event stream closed before the data request".to_string(),
                    ))
                }
                Err(_) => {
                    self.debug_screenshot(&page, "capture timeout").await;
                    return Err(AuthError::CaptureTimeout(self.config.capture_timeout));
                }
            };
            if let Some(captured) = self.inspect_request(&page, &event).await {
                break captured;
            }
        };
        info!("Intercepted data request and security headers");

        let cookies = page
            .get_cookies()
            .await
            .map_err(|e| AuthError::BrowserInit(format!("get_cookies: {}", e)))?
            .into_iter()
            .map(|c| SessionCookie::new(c.name, c.value, c.domain, c.path))
            .collect::<Vec<_>>();
        debug!("Captured {} cookies", cookies.len());

        if let Err(e) = page.close().await {
            debug!("Failed to close page: {}", e);
        }

        SessionContext::from_captured(captured.url, &captured.headers, &captured.post_data, cookies)
    }

    /// 対象の内部API呼び出しなら捕捉内容を返す
    async fn inspect_request(
        &self,
        page: &Page,
        event: &Arc<EventRequestWillBeSent>,
    ) -> Option<CapturedRequest> {
        if !event.request.url.contains(&self.config.data_action_marker) {
            return None;
        }

        let post_data = match page
            .execute(GetRequestPostDataParams::new(event.request_id.clone()))
            .await
        {
            Ok(resp) => resp.result.post_data.clone(),
            Err(e) => {
                debug!("No post data for {}: {}", event.request.url, e);
                return None;
            }
        };

        let body: serde_json::Value = serde_json::from_str(&post_data).ok()?;
        if !is_data_request(&body) {
            debug!("Skipping {} without FilterParameters", event.request.url);
            return None;
        }

        Some(CapturedRequest {
            url: event.request.url.clone(),
            headers: event.request.headers.inner().clone(),
            post_data,
        })
    }

    /// ログイン実行
    async fn login(&self, page: &Page, credentials: &Credentials) -> Result<(), AuthError> {
        info!("Logging in to portal as {}", credentials.username);

        page.goto(self.config.login_url.as_str())
            .await
            .map_err(|e| AuthError::Navigation(e.to_string()))?;

        // クッキー同意ダイアログ（表示された場合のみ）
        let consent_wait = Duration::from_secs(CONSENT_WAIT_SECS);
        if click_by_text(page, CONSENT_BUTTON_TEXT, consent_wait).await {
            debug!("Cookie consent accepted");
        }

        let mut form_ready = false;
        for i in 0..LOGIN_FORM_WAIT_SECS {
            if eval_bool(page, "document.querySelector(\"input[name='username']\") !== null").await
            {
                form_ready = true;
                break;
            }
            if i % 5 == 0 {
                debug!("Waiting for login form... ({}/{})", i + 1, LOGIN_FORM_WAIT_SECS);
            }
            sleep(Duration::from_secs(1)).await;
        }
        if !form_ready {
            self.debug_screenshot(page, "login form missing").await;
            return Err(AuthError::PortalChanged("login form not found".to_string()));
        }

        page.find_element("input[name='username']")
            .await
            .map_err(|e| AuthError::PortalChanged(format!("username field: {}", e)))?
            .click()
            .await
            .map_err(|e| AuthError::PortalChanged(format!("username field: {}", e)))?
            .type_str(&credentials.username)
            .await
            .map_err(|e| AuthError::Navigation(format!("username input: {}", e)))?;

        page.find_element("input[name='password']")
            .await
            .map_err(|e| AuthError::PortalChanged(format!("password field: {}", e)))?
            .click()
            .await
            .map_err(|e| AuthError::PortalChanged(format!("password field: {}", e)))?
            .type_str(&credentials.password)
            .await
            .map_err(|e| AuthError::Navigation(format!("password input: {}", e)))?;

        page.find_element("button[type='submit']")
            .await
            .map_err(|e| AuthError::PortalChanged(format!("submit button: {}", e)))?
            .click()
            .await
            .map_err(|e| AuthError::Navigation(format!("submit click: {}", e)))?;
        debug!("Login form submitted");

        let service_wait = Duration::from_secs(SERVICE_BUTTON_WAIT_SECS);
        if click_by_text(page, SERVICE_BUTTON_TEXT, service_wait).await {
            debug!("Service button clicked");
        }

        // ホーム画面への遷移を待機
        let start = Instant::now();
        let mut url = String::new();
        while start.elapsed() < self.config.login_timeout {
            url = current_url(page).await;
            if url.contains(HOME_URL_MARKER) {
                info!("Login successful after {:?}", start.elapsed());
                return Ok(());
            }
            sleep(Duration::from_secs(1)).await;
        }

        self.debug_screenshot(page, "login did not reach home").await;
        let login_host = reqwest::Url::parse(&self.config.login_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if !login_host.is_empty() && url.contains(&login_host) {
            Err(AuthError::InvalidCredentials(format!(
                "still on login page after {:?}",
                self.config.login_timeout
            )))
        } else {
            Err(AuthError::PortalChanged(format!(
                "home page not reached, stopped at {}",
                url
            )))
        }
    }

    /// デバッグスクリーンショット
    async fn debug_screenshot(&self, page: &Page, label: &str) {
        if !self.config.debug {
            return;
        }
        match page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
        {
            Ok(screenshot) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&screenshot);
                debug!("Screenshot ({}): data:image/png;base64,{}", label, encoded);
            }
            Err(e) => debug!("Screenshot failed: {}", e),
        }
    }
}

#[async_trait]
impl SessionBroker for ChromiumSessionBroker {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionContext, AuthError> {
        let (mut browser, handler_task, user_data_dir) = self.launch().await?;

        let result = self.capture_session(&browser, credentials).await;

        // 成否にかかわらずブラウザを終了する
        Self::shutdown(&mut browser, handler_task, &user_data_dir).await;

        if let Err(e) = &result {
            warn!("Portal authentication failed: {}", e);
        }
        result
    }
}

async fn eval_bool(page: &Page, script: &str) -> bool {
    match page.evaluate(script).await {
        Ok(v) => v.into_value::<bool>().unwrap_or(false),
        Err(e) => {
            debug!("evaluate failed: {}", e);
            false
        }
    }
}

async fn current_url(page: &Page) -> String {
    match page.evaluate("window.location.href").await {
        Ok(v) => v.into_value::<String>().unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// 表示中のボタンを文字列で探してクリックする（見つからなければ false）
async fn click_by_text(page: &Page, text: &str, wait: Duration) -> bool {
    let quoted = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
    let script = format!(
        r#"
        (() => {{
            const wanted = {};
            const candidates = document.querySelectorAll('button, a, [role="button"]');
            for (const el of candidates) {{
                if (el.textContent && el.textContent.includes(wanted) && el.offsetParent !== null) {{
                    el.click();
                    return true;
                }}
            }}
            return false;
        }})()
        "#,
        quoted
    );

    let start = Instant::now();
    loop {
        if eval_bool(page, &script).await {
            return true;
        }
        if start.elapsed() >= wait {
            return false;
        }
        sleep(Duration::from_millis(500)).await;
    }
}
