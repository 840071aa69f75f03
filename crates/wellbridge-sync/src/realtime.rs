//! # Realtime Validation Channel
//!
//! WebSocket subscription that waits for the hub to report a validated token.
//!
//! ## Channel Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Realtime Channel States                             │
//! │                                                                         │
//! │  subscribe() ──► Connecting ──handshake + Subscribed──► Subscribed     │
//! │                      │  ▲                                   │           │
//! │             failure  │  │ backoff elapsed        drop/error │           │
//! │                      ▼  │                                   ▼           │
//! │                    Retrying ◄────────────────────────────────┘          │
//! │                      │                                                  │
//! │                      │ attempts > max                                   │
//! │                      ▼                                                  │
//! │                 NetworkError (task ends)                               │
//! │                                                                         │
//! │  Statuses are reported for UI feedback. Only a TokenValidated message  │
//! │  is forwarded as a validation signal.                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use wellbridge_core::connection::{RealtimeStatus, ValidationSignal};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::RealtimeMessage;

// =============================================================================
// Channel Port
// =============================================================================

/// What a subscription reports.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeUpdate {
    Status(RealtimeStatus),
    Validation(ValidationSignal),
}

/// A source of validation signals for one token.
pub trait RealtimeChannel: Send + Sync {
    /// Starts listening for `token`. Updates stop when the subscription is
    /// dropped or `updates` is closed.
    fn subscribe(&self, token: &str, updates: mpsc::Sender<RealtimeUpdate>) -> RealtimeSubscription;
}

/// Live subscription. Dropping it stops the listener.
#[derive(Debug, Default)]
pub struct RealtimeSubscription {
    task: Option<JoinHandle<()>>,
}

impl RealtimeSubscription {
    pub fn from_task(task: JoinHandle<()>) -> Self {
        RealtimeSubscription { task: Some(task) }
    }

    /// A subscription with no background task.
    pub fn detached() -> Self {
        RealtimeSubscription { task: None }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// WebSocket Channel
// =============================================================================

/// Configuration for the WebSocket channel.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub device_id: String,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Reconnects before reporting `NetworkError`.
    pub max_retries: u32,
    pub ping_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            url: String::new(),
            device_id: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_retries: 5,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Realtime channel over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketRealtime {
    config: RealtimeConfig,
}

impl WebSocketRealtime {
    pub fn new(config: RealtimeConfig) -> Self {
        WebSocketRealtime { config }
    }
}

impl RealtimeChannel for WebSocketRealtime {
    fn subscribe(&self, token: &str, updates: mpsc::Sender<RealtimeUpdate>) -> RealtimeSubscription {
        let listener = Listener {
            config: self.config.clone(),
            token: token.to_string(),
            updates,
        };
        RealtimeSubscription::from_task(tokio::spawn(listener.run()))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connection loop ended.
enum LoopExit {
    /// Validation delivered or receiver gone; stop for good.
    Done,
    /// Connection lost; reconnect.
    Lost,
}

struct Listener {
    config: RealtimeConfig,
    token: String,
    updates: mpsc::Sender<RealtimeUpdate>,
}

impl Listener {
    async fn run(self) {
        let prefix: String = self.token.chars().take(4).collect();
        info!(token_prefix = %prefix, "Realtime listener starting");

        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0u32;

        loop {
            if !self.report(RealtimeStatus::Connecting).await {
                return;
            }

            match self.connect().await {
                Ok(stream) => {
                    backoff.reset();
                    attempts = 0;
                    match self.connection_loop(stream).await {
                        Ok(LoopExit::Done) => return,
                        Ok(LoopExit::Lost) => debug!("Realtime connection lost"),
                        Err(e) => warn!(?e, "Realtime connection ended with error"),
                    }
                }
                Err(e) => warn!(?e, attempt = attempts + 1, "Realtime connect failed"),
            }

            attempts += 1;
            if attempts > self.config.max_retries {
                warn!(max_retries = self.config.max_retries, "Realtime retries exhausted");
                self.report(RealtimeStatus::NetworkError).await;
                return;
            }

            if !self.report(RealtimeStatus::Retrying).await {
                return;
            }
            let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
            debug!(?delay, attempt = attempts, "Waiting before realtime reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    /// Sends a status; false once nobody is listening.
    async fn report(&self, status: RealtimeStatus) -> bool {
        self.updates.send(RealtimeUpdate::Status(status)).await.is_ok()
    }

    fn subscription_url(&self) -> BridgeResult<Url> {
        let mut url = Url::parse(&self.config.url)?;
        url.query_pairs_mut()
            .append_pair("token", &self.token)
            .append_pair("device", &self.config.device_id);
        Ok(url)
    }

    async fn connect(&self) -> BridgeResult<WsStream> {
        let url = self.subscription_url()?;
        match timeout(self.config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, response))) => {
                debug!(status = ?response.status(), "Realtime handshake complete");
                Ok(stream)
            }
            Ok(Err(e)) => Err(BridgeError::from(e)),
            Err(_) => Err(BridgeError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }

    async fn connection_loop(&self, stream: WsStream) -> BridgeResult<LoopExit> {
        let (mut write, mut read) = stream.split();

        let subscribe = RealtimeMessage::subscribe(&self.token, &self.config.device_id);
        write.send(WsMessage::Text(subscribe.to_json()?.into())).await?;

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Ok(LoopExit::Lost);
                    };
                    match frame? {
                        WsMessage::Text(text) => {
                            let message = match RealtimeMessage::from_json(&text) {
                                Ok(message) => message,
                                Err(e) => {
                                    warn!(?e, "Ignoring unparseable realtime message");
                                    continue;
                                }
                            };
                            debug!(msg_type = %message.type_name(), "Realtime message");
                            match message {
                                RealtimeMessage::Subscribed { .. } => {
                                    if !self.report(RealtimeStatus::Subscribed).await {
                                        return Ok(LoopExit::Done);
                                    }
                                }
                                RealtimeMessage::TokenValidated(payload) => {
                                    let signal = ValidationSignal::from(payload);
                                    let _ = self.updates.send(RealtimeUpdate::Validation(signal)).await;
                                    let _ = write.send(WsMessage::Close(None)).await;
                                    return Ok(LoopExit::Done);
                                }
                                RealtimeMessage::Ping { timestamp } => {
                                    let pong = RealtimeMessage::pong(&timestamp);
                                    write.send(WsMessage::Text(pong.to_json()?.into())).await?;
                                }
                                RealtimeMessage::Error { code, message } => {
                                    warn!(code = %code, message = %message, "Realtime error from hub");
                                    if !self.report(RealtimeStatus::Error).await {
                                        return Ok(LoopExit::Done);
                                    }
                                }
                                RealtimeMessage::Pong { .. } | RealtimeMessage::Subscribe(_) => {}
                            }
                        }
                        WsMessage::Ping(data) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        WsMessage::Close(frame) => {
                            info!(?frame, "Realtime channel closed by hub");
                            return Ok(LoopExit::Lost);
                        }
                        _ => {}
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Text(RealtimeMessage::ping().to_json()?.into())).await?;
                }

                _ = self.updates.closed() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(LoopExit::Done);
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
