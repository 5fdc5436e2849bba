//! Payment event subscription over WebSocket.
//!
//! One subscription watches one payment hash. Frames are narrowed into
//! [`PaymentFrame`] values on receipt; the spawned task reports back to the
//! owning controller through [`WatcherEvent`]s on an unbounded channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type SubscriptionId = u64;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid websocket URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("malformed payment frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Outcome of narrowing one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentFrame {
    Paid,
    Ignored,
}

/// Parse a text frame. Non-JSON input is an error; any JSON that is not a
/// paid signal is [`PaymentFrame::Ignored`].
pub fn parse_payment_frame(text: &str) -> Result<PaymentFrame, WatchError> {
    let value: Value = serde_json::from_str(text)?;
    let paid = value.get("paid").and_then(Value::as_bool) == Some(true);
    let success = value.get("status").and_then(Value::as_str) == Some("success");
    if paid || success {
        Ok(PaymentFrame::Paid)
    } else {
        Ok(PaymentFrame::Ignored)
    }
}

#[must_use]
pub fn subscription_url(ws_base: &str, payment_hash: &str) -> String {
    format!(
        "{}/{}",
        ws_base.trim().trim_end_matches('/'),
        payment_hash.trim()
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Paid {
        subscription_id: SubscriptionId,
        payment_hash: String,
    },
    Closed {
        subscription_id: SubscriptionId,
        payment_hash: String,
    },
}

impl WatcherEvent {
    #[must_use]
    pub fn subscription_id(&self) -> SubscriptionId {
        match self {
            Self::Paid {
                subscription_id, ..
            }
            | Self::Closed {
                subscription_id, ..
            } => *subscription_id,
        }
    }
}

/// Inbound text frames of one connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame; `None` once the remote side has closed.
    async fn next_frame(&mut self) -> Option<Result<String, WatchError>>;

    async fn close(&mut self);
}

/// Opens connections to the payment push service.
#[async_trait]
pub trait PaymentFeed: Send + Sync {
    async fn subscribe(&self, url: &str) -> Result<Box<dyn FrameStream>, WatchError>;
}

/// Bounded exponential backoff for re-subscribing after a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }

    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsPaymentFeed;

#[async_trait]
impl PaymentFeed for WsPaymentFeed {
    async fn subscribe(&self, url: &str) -> Result<Box<dyn FrameStream>, WatchError> {
        let parsed = Url::parse(url).map_err(|error| WatchError::InvalidUrl(error.to_string()))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(WatchError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed.scheme()
            )));
        }
        let (stream, _response) = connect_async(parsed.as_str())
            .await
            .map_err(|error| WatchError::WebSocket(error.to_string()))?;
        Ok(Box::new(WsFrameStream { stream }))
    }
}

struct WsFrameStream {
    stream: WsStream,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_frame(&mut self) -> Option<Result<String, WatchError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("ignoring non-utf8 binary payment frame"),
                },
                Ok(Message::Ping(payload)) => {
                    debug!("received ping ({} bytes)", payload.len());
                }
                Ok(Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(error) => return Some(Err(WatchError::WebSocket(error.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(error) = self.stream.send(Message::Close(None)).await {
            debug!("websocket close handshake failed: {}", error);
        }
    }
}

/// Handle to a running subscription task.
pub struct PaymentSubscription {
    id: SubscriptionId,
    payment_hash: String,
    url: String,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PaymentSubscription {
    pub fn spawn(
        id: SubscriptionId,
        ws_base: &str,
        payment_hash: &str,
        feed: Arc<dyn PaymentFeed>,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Self {
        let url = subscription_url(ws_base, payment_hash);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_subscription(
            SubscriptionContext {
                id,
                payment_hash: payment_hash.to_string(),
                url: url.clone(),
                feed,
                policy,
                events,
            },
            close_rx,
        ));
        Self {
            id,
            payment_hash: payment_hash.to_string(),
            url,
            close_tx: Some(close_tx),
            task: Some(task),
        }
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn payment_hash(&self) -> &str {
        &self.payment_hash
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Signal the task to close its connection and wait until it has.
    pub async fn close(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
            && !error.is_cancelled()
        {
            warn!("payment subscription {} task failed: {}", self.id, error);
        }
    }
}

impl Drop for PaymentSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SubscriptionContext {
    id: SubscriptionId,
    payment_hash: String,
    url: String,
    feed: Arc<dyn PaymentFeed>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<WatcherEvent>,
}

impl SubscriptionContext {
    fn emit_paid(&self) {
        let _ = self.events.send(WatcherEvent::Paid {
            subscription_id: self.id,
            payment_hash: self.payment_hash.clone(),
        });
    }

    fn emit_closed(&self) {
        let _ = self.events.send(WatcherEvent::Closed {
            subscription_id: self.id,
            payment_hash: self.payment_hash.clone(),
        });
    }
}

enum StreamOutcome {
    CloseRequested,
    /// The connection ended; `received` is whether any frame arrived on it.
    Ended { received: bool },
}

async fn run_subscription(ctx: SubscriptionContext, mut close_rx: oneshot::Receiver<()>) {
    let mut attempt: u32 = 0;
    let mut paid_seen = false;

    loop {
        let connected = tokio::select! {
            _ = &mut close_rx => {
                ctx.emit_closed();
                return;
            }
            result = ctx.feed.subscribe(&ctx.url) => result,
        };

        match connected {
            Ok(mut stream) => {
                info!("payment subscription {} open for {}", ctx.id, ctx.payment_hash);
                match pump_frames(&ctx, stream.as_mut(), &mut close_rx, &mut paid_seen).await {
                    StreamOutcome::CloseRequested => {
                        stream.close().await;
                        ctx.emit_closed();
                        return;
                    }
                    StreamOutcome::Ended { received } => {
                        // A connection that delivered frames restores the retry budget.
                        if received {
                            attempt = 0;
                        }
                        debug!("payment subscription {} dropped by remote", ctx.id);
                    }
                }
            }
            Err(error) => {
                warn!("websocket error for {}: {}", ctx.payment_hash, error);
            }
        }

        if paid_seen || attempt >= ctx.policy.max_attempts {
            ctx.emit_closed();
            return;
        }

        let delay = ctx.policy.delay_for(attempt);
        attempt += 1;
        debug!(
            "re-subscribing {} in {:?} (attempt {}/{})",
            ctx.payment_hash, delay, attempt, ctx.policy.max_attempts
        );
        tokio::select! {
            _ = &mut close_rx => {
                ctx.emit_closed();
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump_frames(
    ctx: &SubscriptionContext,
    stream: &mut dyn FrameStream,
    close_rx: &mut oneshot::Receiver<()>,
    paid_seen: &mut bool,
) -> StreamOutcome {
    let mut received = false;
    loop {
        tokio::select! {
            _ = &mut *close_rx => return StreamOutcome::CloseRequested,
            frame = stream.next_frame() => match frame {
                Some(Ok(text)) => {
                    received = true;
                    handle_frame(ctx, &text, paid_seen);
                }
                Some(Err(error)) => {
                    warn!("websocket read error for {}: {}", ctx.payment_hash, error);
                    return StreamOutcome::Ended { received };
                }
                None => return StreamOutcome::Ended { received },
            },
        }
    }
}

fn handle_frame(ctx: &SubscriptionContext, text: &str, paid_seen: &mut bool) {
    match parse_payment_frame(text) {
        Ok(PaymentFrame::Paid) if !*paid_seen => {
            *paid_seen = true;
            ctx.emit_paid();
        }
        Ok(PaymentFrame::Paid) => {
            debug!("duplicate paid frame for {}", ctx.payment_hash);
        }
        Ok(PaymentFrame::Ignored) => {
            debug!("ignoring payment frame for {}", ctx.payment_hash);
        }
        Err(error) => {
            warn!(
                "failed to parse payment payload for {}: {} ({})",
                ctx.payment_hash, text, error
            );
        }
    }
}
