//! Client side of Lightning-paid reverse tunnels.
//!
//! The crate exposes a small surface:
//! - a typed transport for the tunnel HTTP API
//! - a payment watcher that follows one invoice over WebSocket
//! - a controller that owns the view state and funnels every mutation

pub mod api;
pub mod config;
pub mod controller;
pub mod host;
pub mod model;
pub mod payment;

pub use api::{HttpTunnelApi, TunnelApi, TunnelApiConfig, TunnelApiError};
pub use config::{ClientConfig, ConfigError, ConfirmMode};
pub use controller::{ControllerError, ControllerHost, ControllerSettings, TunnelController};
pub use host::{
    Clipboard, ClipboardError, Notification, NotificationKind, Notifier, notify_api_error,
};
pub use model::{
    InvoiceDialog, PingResponse, Reachability, Tunnel, TunnelEnvelope, TunnelStatus,
    TunnelViewState,
};
pub use payment::{
    FrameStream, PaymentFeed, PaymentFrame, PaymentSubscription, ReconnectPolicy, WatchError,
    WatcherEvent, WsPaymentFeed, parse_payment_frame,
};
