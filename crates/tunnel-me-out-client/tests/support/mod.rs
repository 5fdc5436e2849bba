#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tunnel_me_out_client::model::CreateTunnelRequest;
use tunnel_me_out_client::{
    Clipboard, ClipboardError, ConfirmMode, ControllerHost, ControllerSettings, FrameStream,
    Notification, Notifier, PaymentFeed, PingResponse, ReconnectPolicy, Tunnel, TunnelApi,
    TunnelApiError, TunnelController, TunnelEnvelope, WatchError,
};

pub const WS_BASE: &str = "ws://push.test/api/v1/ws";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn tunnel_from(value: Value) -> Tunnel {
    serde_json::from_value(value).expect("tunnel fixture")
}

pub fn pending_tunnel(days: u32, payment_hash: &str) -> Tunnel {
    tunnel_from(json!({
        "status": "pending",
        "days": days,
        "expires_at": "2026-03-01T00:00:00Z",
        "payment_request": format!("lnbc{days}0n1p{payment_hash}"),
        "payment_hash": payment_hash,
        "ssh_command": null,
        "reachable": null
    }))
}

pub fn active_tunnel(days: u32, payment_hash: &str) -> Tunnel {
    tunnel_from(json!({
        "status": "active",
        "days": days,
        "expires_at": "2026-03-05T00:00:00Z",
        "payment_request": format!("lnbc{days}0n1p{payment_hash}"),
        "payment_hash": payment_hash,
        "ssh_command": "ssh -N -R 40123:localhost:5000 tunnel@lnpro.xyz",
        "public_url": "https://abc.lnpro.xyz",
        "reachable": true
    }))
}

pub fn network_error() -> TunnelApiError {
    TunnelApiError::Request {
        message: "connection refused".to_string(),
    }
}

/// Scripted tunnel backend. Unscripted calls fail with a network error,
/// except `get_tunnel`, which reports no tunnel.
#[derive(Default)]
pub struct FakeApi {
    get: Mutex<Option<Result<TunnelEnvelope, TunnelApiError>>>,
    create: Mutex<Option<Result<Tunnel, TunnelApiError>>>,
    confirm: Mutex<Option<Result<Tunnel, TunnelApiError>>>,
    ping: Mutex<Option<Result<PingResponse, TunnelApiError>>>,
    reconnect: Mutex<Option<Result<Tunnel, TunnelApiError>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn set_get(&self, result: Result<Option<Tunnel>, TunnelApiError>) {
        *lock(&self.get) = Some(result.map(|tunnel| TunnelEnvelope { tunnel }));
    }

    pub fn set_create(&self, result: Result<Tunnel, TunnelApiError>) {
        *lock(&self.create) = Some(result);
    }

    pub fn set_confirm(&self, result: Result<Tunnel, TunnelApiError>) {
        *lock(&self.confirm) = Some(result);
    }

    pub fn set_ping(&self, result: Result<bool, TunnelApiError>) {
        *lock(&self.ping) = Some(result.map(|reachable| PingResponse { reachable }));
    }

    pub fn set_reconnect(&self, result: Result<Tunnel, TunnelApiError>) {
        *lock(&self.reconnect) = Some(result);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: impl Into<String>) {
        lock(&self.calls).push(call.into());
    }
}

#[async_trait]
impl TunnelApi for FakeApi {
    async fn get_tunnel(&self) -> Result<TunnelEnvelope, TunnelApiError> {
        self.record("get");
        lock(&self.get)
            .clone()
            .unwrap_or(Ok(TunnelEnvelope { tunnel: None }))
    }

    async fn create_tunnel(
        &self,
        request: &CreateTunnelRequest,
    ) -> Result<Tunnel, TunnelApiError> {
        self.record(format!("create:{}", request.days));
        lock(&self.create).clone().unwrap_or_else(|| Err(network_error()))
    }

    async fn confirm_tunnel(&self, payment_hash: &str) -> Result<Tunnel, TunnelApiError> {
        self.record(format!("confirm:{payment_hash}"));
        lock(&self.confirm).clone().unwrap_or_else(|| Err(network_error()))
    }

    async fn ping_tunnel(&self) -> Result<PingResponse, TunnelApiError> {
        self.record("ping");
        lock(&self.ping).clone().unwrap_or_else(|| Err(network_error()))
    }

    async fn reconnect_tunnel(&self) -> Result<Tunnel, TunnelApiError> {
        self.record("reconnect");
        lock(&self.reconnect)
            .clone()
            .unwrap_or_else(|| Err(network_error()))
    }
}

pub enum FakeFrame {
    Text(String),
    Hangup,
}

/// In-memory payment feed that tracks how many connections are live.
#[derive(Default)]
pub struct FakeFeed {
    live: Arc<AtomicUsize>,
    hangup_on_connect: AtomicBool,
    urls: Mutex<Vec<String>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<FakeFrame>>>,
}

impl FakeFeed {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        lock(&self.urls).len()
    }

    pub fn urls(&self) -> Vec<String> {
        lock(&self.urls).clone()
    }

    /// Accept every later connection and drop it before any frame is sent.
    pub fn hang_up_new_connections(&self) {
        self.hangup_on_connect.store(true, Ordering::SeqCst);
    }

    /// Push a text frame to the most recent connection.
    pub fn send(&self, text: &str) {
        self.push(FakeFrame::Text(text.to_string()));
    }

    /// Drop the most recent connection from the remote side.
    pub fn hangup(&self) {
        self.push(FakeFrame::Hangup);
    }

    fn push(&self, frame: FakeFrame) {
        let senders = lock(&self.senders);
        let sender = senders.last().expect("an open connection");
        let _ = sender.send(frame);
    }
}

#[async_trait]
impl PaymentFeed for FakeFeed {
    async fn subscribe(&self, url: &str) -> Result<Box<dyn FrameStream>, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.hangup_on_connect.load(Ordering::SeqCst) {
            let _ = tx.send(FakeFrame::Hangup);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        lock(&self.urls).push(url.to_string());
        lock(&self.senders).push(tx);
        Ok(Box::new(FakeStream {
            rx,
            live: Arc::clone(&self.live),
            released: false,
        }))
    }
}

struct FakeStream {
    rx: mpsc::UnboundedReceiver<FakeFrame>,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl FakeStream {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl FrameStream for FakeStream {
    async fn next_frame(&mut self) -> Option<Result<String, WatchError>> {
        match self.rx.recv().await {
            Some(FakeFrame::Text(text)) => Some(Ok(text)),
            Some(FakeFrame::Hangup) | None => {
                self.release();
                None
            }
        }
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        lock(&self.notifications).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        lock(&self.notifications).push(notification);
    }
}

#[derive(Default)]
pub struct RecordingClipboard {
    copied: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl RecordingClipboard {
    pub fn copied(&self) -> Vec<String> {
        lock(&self.copied).clone()
    }

    pub fn fail_next(&self) {
        *lock(&self.fail) = true;
    }
}

impl Clipboard for RecordingClipboard {
    fn copy_text(&self, text: &str) -> Result<(), ClipboardError> {
        if std::mem::take(&mut *lock(&self.fail)) {
            return Err(ClipboardError::Unavailable("no display".to_string()));
        }
        lock(&self.copied).push(text.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub api: Arc<FakeApi>,
    pub feed: Arc<FakeFeed>,
    pub notifier: Arc<RecordingNotifier>,
    pub clipboard: Arc<RecordingClipboard>,
    pub controller: TunnelController,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(ConfirmMode::Refetch, ReconnectPolicy::disabled())
    }

    pub fn with_settings(confirm_mode: ConfirmMode, ws_reconnect: ReconnectPolicy) -> Self {
        let api = Arc::new(FakeApi::default());
        let feed = Arc::new(FakeFeed::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let clipboard = Arc::new(RecordingClipboard::default());
        let host = ControllerHost {
            api: api.clone(),
            feed: feed.clone(),
            notifier: notifier.clone(),
            clipboard: clipboard.clone(),
        };
        let controller = TunnelController::new(
            host,
            ControllerSettings {
                ws_base: WS_BASE.to_string(),
                confirm_mode,
                ws_reconnect,
            },
        );
        Self {
            api,
            feed,
            notifier,
            clipboard,
            controller,
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Feed every pending watcher event into the controller until the channel
/// stays quiet.
pub async fn drain_events(controller: &mut TunnelController) {
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), controller.next_event()).await
    {
        controller.handle_event(event).await;
    }
}
