//! Home Assistant の WebSocket API への統計インポート

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::PublishError;
use crate::traits::StatisticsStore;

use super::types::StatisticBatch;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const IMPORT_MESSAGE_ID: u64 = 1;

/// `recorder/import_statistics` で外部統計を書き込むストア
///
/// 1回の送信ごとに接続・認証・インポート・切断を行う。
pub struct HomeAssistantStore {
    url: String,
    token: String,
    timeout: Duration,
}

impl HomeAssistantStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            url: config.url.clone(),
            token: config.token.clone(),
            timeout: config.request_timeout,
        }
    }

    async fn exchange(&self, batch: &StatisticBatch) -> Result<(), PublishError> {
        debug!("Connecting to {}", self.url);
        let (mut socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| PublishError::Transport(format!("connect {}: {}", self.url, e)))?;

        let greeting = recv_json(&mut socket).await?;
        if message_type(&greeting) != "auth_required" {
            return Err(PublishError::Transport(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }

        send_json(
            &mut socket,
            &json!({ "type": "auth", "access_token": self.token }),
        )
        .await?;

        let auth = recv_json(&mut socket).await?;
        match message_type(&auth) {
            "auth_ok" => debug!("Authenticated with Home Assistant"),
            "auth_invalid" => {
                let message = auth["message"].as_str().unwrap_or("auth_invalid").to_string();
                return Err(PublishError::StaleAuth(message));
            }
            other => {
                return Err(PublishError::Transport(format!(
                    "unexpected auth reply: {}",
                    other
                )))
            }
        }

        send_json(&mut socket, &import_message(batch, IMPORT_MESSAGE_ID)).await?;

        let result = loop {
            let message = recv_json(&mut socket).await?;
            let is_reply = message["id"].as_u64() == Some(IMPORT_MESSAGE_ID);
            if is_reply && message_type(&message) == "result" {
                break message;
            }
            debug!("Ignoring message: {}", message);
        };

        if let Err(e) = socket.close(None).await {
            debug!("Close failed: {}", e);
        }

        if result["success"].as_bool() == Some(true) {
            info!(
                "Home Assistant accepted {} entries for {}",
                batch.entries.len(),
                batch.metadata.statistic_id
            );
            Ok(())
        } else {
            let error = &result["error"];
            Err(PublishError::Rejected {
                code: error["code"].as_str().unwrap_or("unknown").to_string(),
                message: error["message"].as_str().unwrap_or_default().to_string(),
            })
        }
    }
}

#[async_trait]
impl StatisticsStore for HomeAssistantStore {
    async fn import(&self, batch: &StatisticBatch) -> Result<(), PublishError> {
        match tokio::time::timeout(self.timeout, self.exchange(batch)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Home Assistant did not answer within {:?}", self.timeout);
                Err(PublishError::Transport(format!(
                    "timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

/// インポート要求の JSON を組み立てる
///
/// Home Assistant の外部統計では `state` と `sum` の両方に累計を入れる。
pub(crate) fn import_message(batch: &StatisticBatch, id: u64) -> Value {
    let stats: Vec<Value> = batch
        .entries
        .iter()
        .map(|entry| {
            json!({
                "start": entry.start.to_rfc3339(),
                "state": entry.state,
                "sum": entry.state,
            })
        })
        .collect();

    json!({
        "id": id,
        "type": "recorder/import_statistics",
        "metadata": {
            "has_mean": false,
            "has_sum": true,
            "name": batch.metadata.name,
            "source": batch.metadata.source,
            "statistic_id": batch.metadata.statistic_id,
            "unit_of_measurement": batch.metadata.unit,
        },
        "stats": stats,
    })
}

fn message_type(message: &Value) -> &str {
    message["type"].as_str().unwrap_or_default()
}

async fn send_json(socket: &mut Socket, message: &Value) -> Result<(), PublishError> {
    socket
        .send(Message::Text(message.to_string()))
        .await
        .map_err(|e| PublishError::Transport(format!("send: {}", e)))
}

async fn recv_json(socket: &mut Socket) -> Result<Value, PublishError> {
    while let Some(frame) = socket.next().await {
        match frame.map_err(|e| PublishError::Transport(format!("receive: {}", e)))? {
            Message::Text(text) => {
                return serde_json::from_str(&text).map_err(|e| {
                    PublishError::Transport(format!("malformed message: {}", e))
                });
            }
            Message::Close(frame) => {
                return Err(PublishError::Transport(format!(
                    "connection closed: {:?}",
                    frame
                )));
            }
            _ => continue,
        }
    }
    Err(PublishError::Transport("connection closed".into()))
}
