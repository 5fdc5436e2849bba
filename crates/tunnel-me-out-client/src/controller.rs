//! Tunnel controller: owns the view state and every operation that mutates it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::TunnelApi;
use crate::config::{ClientConfig, ConfirmMode};
use crate::host::{Clipboard, Notification, Notifier, notify_api_error};
use crate::model::{CreateTunnelRequest, Reachability, Tunnel, TunnelStatus, TunnelViewState};
use crate::payment::{
    PaymentFeed, PaymentSubscription, ReconnectPolicy, SubscriptionId, WatcherEvent,
};

pub const INVOICE_COPIED_MESSAGE: &str = "Payment request copied";
pub const COMMAND_COPIED_MESSAGE: &str = "Command copied";
pub const RECONNECTED_MESSAGE: &str = "Tunnel reconnected";
pub const INVALID_DAYS_MESSAGE: &str = "Days must be greater than zero";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("days must be greater than zero")]
    InvalidDays,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub ws_base: String,
    pub confirm_mode: ConfirmMode,
    pub ws_reconnect: ReconnectPolicy,
}

impl From<&ClientConfig> for ControllerSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            ws_base: config.ws_base.clone(),
            confirm_mode: config.confirm_mode,
            ws_reconnect: config.ws_reconnect,
        }
    }
}

/// Host collaborators injected into a controller.
#[derive(Clone)]
pub struct ControllerHost {
    pub api: Arc<dyn TunnelApi>,
    pub feed: Arc<dyn PaymentFeed>,
    pub notifier: Arc<dyn Notifier>,
    pub clipboard: Arc<dyn Clipboard>,
}

pub struct TunnelController {
    host: ControllerHost,
    settings: ControllerSettings,
    state: TunnelViewState,
    subscription: Option<PaymentSubscription>,
    next_subscription_id: SubscriptionId,
    events_tx: mpsc::UnboundedSender<WatcherEvent>,
    events_rx: mpsc::UnboundedReceiver<WatcherEvent>,
}

impl TunnelController {
    #[must_use]
    pub fn new(host: ControllerHost, settings: ControllerSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            host,
            settings,
            state: TunnelViewState::default(),
            subscription: None,
            next_subscription_id: 1,
            events_tx,
            events_rx,
        }
    }

    #[must_use]
    pub fn state(&self) -> &TunnelViewState {
        &self.state
    }

    #[must_use]
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    #[must_use]
    pub fn has_live_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    /// Payment hash of the live subscription, if any.
    #[must_use]
    pub fn subscribed_hash(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .map(PaymentSubscription::payment_hash)
    }

    pub fn set_days(&mut self, days: u32) -> Result<(), ControllerError> {
        if days == 0 {
            return Err(ControllerError::InvalidDays);
        }
        self.state.days = days;
        Ok(())
    }

    /// Startup load: store the current tunnel and pick the initial mode.
    pub async fn load(&mut self) {
        if !self.refresh().await {
            return;
        }
        let Some(status) = self.state.tunnel.as_ref().map(|tunnel| tunnel.status) else {
            return;
        };
        match status {
            TunnelStatus::Pending => {
                if let Some(tunnel) = self.state.tunnel.as_ref() {
                    self.state.invoice_dialog.open_for(tunnel);
                }
                self.open_ws().await;
            }
            TunnelStatus::Active => self.check_reachability().await,
            TunnelStatus::Expired | TunnelStatus::Unknown => {}
        }
    }

    /// Fetch and store the tunnel without touching the dialog or subscription.
    /// Returns whether the fetch succeeded.
    pub async fn refresh(&mut self) -> bool {
        match self.host.api.get_tunnel().await {
            Ok(envelope) => {
                self.state.tunnel = envelope.tunnel;
                true
            }
            Err(error) => {
                warn!("tunnel load failed: {}", error);
                false
            }
        }
    }

    pub async fn request(&mut self, days: u32) {
        if self.set_days(days).is_err() {
            self.host
                .notifier
                .notify(Notification::negative(INVALID_DAYS_MESSAGE));
            return;
        }

        self.state.loading = true;
        let request = CreateTunnelRequest { days };
        match self.host.api.create_tunnel(&request).await {
            Ok(tunnel) => {
                info!(
                    "tunnel requested for {} day(s), awaiting payment {}",
                    days, tunnel.payment_hash
                );
                self.state.invoice_dialog.open_for(&tunnel);
                self.state.tunnel = Some(tunnel);
                self.state.reachability = Reachability::Unknown;
                self.open_ws().await;
            }
            Err(error) => {
                warn!("tunnel request failed: {}", error);
                notify_api_error(self.host.notifier.as_ref(), &error);
            }
        }
        self.state.loading = false;
    }

    /// Request a tunnel for the currently selected number of days.
    pub async fn request_selected(&mut self) {
        self.request(self.state.days).await;
    }

    /// Subscribe to payment events for the dialog's payment hash, replacing any
    /// existing subscription.
    pub async fn open_ws(&mut self) {
        self.close_ws().await;

        let payment_hash = self.state.invoice_dialog.payment_hash.trim().to_string();
        if payment_hash.is_empty() {
            debug!("no payment hash known; not subscribing");
            return;
        }

        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        let subscription = PaymentSubscription::spawn(
            id,
            &self.settings.ws_base,
            &payment_hash,
            Arc::clone(&self.host.feed),
            self.settings.ws_reconnect,
            self.events_tx.clone(),
        );
        debug!("payment subscription {} -> {}", id, subscription.url());
        self.subscription = Some(subscription);
    }

    /// Close the live subscription, if any, and wait for its connection to end.
    pub async fn close_ws(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            debug!("closing payment subscription {}", subscription.id());
            subscription.close().await;
        }
    }

    /// Wait for the next event from the payment subscription.
    pub async fn next_event(&mut self) -> Option<WatcherEvent> {
        self.events_rx.recv().await
    }

    /// Apply one subscription event. Events from subscriptions that are no
    /// longer current are dropped.
    pub async fn handle_event(&mut self, event: WatcherEvent) {
        let current = self.subscription.as_ref().map(PaymentSubscription::id);
        if current != Some(event.subscription_id()) {
            debug!("dropping stale watcher event {:?}", event);
            return;
        }
        match event {
            WatcherEvent::Paid { payment_hash, .. } => self.handle_paid(&payment_hash).await,
            WatcherEvent::Closed {
                subscription_id, ..
            } => {
                debug!("payment subscription {} closed", subscription_id);
                self.subscription = None;
            }
        }
    }

    async fn handle_paid(&mut self, payment_hash: &str) {
        info!("payment {} settled", payment_hash);
        match self.settings.confirm_mode {
            ConfirmMode::Refetch => {
                self.refresh().await;
            }
            ConfirmMode::ConfirmEndpoint => {
                match self.host.api.confirm_tunnel(payment_hash).await {
                    Ok(tunnel) => self.state.tunnel = Some(tunnel),
                    Err(error) => warn!("tunnel confirm failed for {}: {}", payment_hash, error),
                }
            }
        }
        self.state.invoice_dialog.clear();
        self.close_ws().await;
        self.state.reachability = Reachability::Reachable;
    }

    pub async fn check_reachability(&mut self) {
        self.state.reachability = Reachability::Unknown;
        self.state.reachability = match self.host.api.ping_tunnel().await {
            Ok(ping) => Reachability::from(ping.reachable),
            Err(error) => {
                debug!("tunnel ping failed: {}", error);
                Reachability::Unreachable
            }
        };
    }

    pub async fn reconnect(&mut self) {
        self.state.loading = true;
        match self.host.api.reconnect_tunnel().await {
            Ok(tunnel) => {
                self.state.tunnel = Some(tunnel);
                self.host
                    .notifier
                    .notify(Notification::positive(RECONNECTED_MESSAGE));
                self.state.reachability = Reachability::Reachable;
            }
            Err(error) => {
                warn!("tunnel reconnect failed: {}", error);
                self.state.reachability = Reachability::Unreachable;
                notify_api_error(self.host.notifier.as_ref(), &error);
            }
        }
        self.state.loading = false;
    }

    pub fn copy_invoice(&self) {
        let payment_request = self.state.invoice_dialog.payment_request.as_str();
        if payment_request.is_empty() {
            return;
        }
        self.copy_with_notice(payment_request, INVOICE_COPIED_MESSAGE);
    }

    pub fn copy_ssh_command(&self) {
        let Some(command) = self
            .state
            .tunnel
            .as_ref()
            .and_then(|tunnel| tunnel.ssh_command.as_deref())
            .filter(|command| !command.trim().is_empty())
        else {
            return;
        };
        self.copy_with_notice(command, COMMAND_COPIED_MESSAGE);
    }

    fn copy_with_notice(&self, text: &str, message: &str) {
        match self.host.clipboard.copy_text(text) {
            Ok(()) => self.host.notifier.notify(Notification::positive(message)),
            Err(error) => {
                warn!("clipboard copy failed: {}", error);
                self.host
                    .notifier
                    .notify(Notification::negative(error.to_string()));
            }
        }
    }

    /// Hide the invoice dialog. The subscription stays open so a late payment
    /// is still picked up.
    pub fn dismiss_invoice(&mut self) {
        self.state.invoice_dialog.clear();
    }

    pub async fn teardown(&mut self) {
        self.close_ws().await;
    }

    #[must_use]
    pub fn tunnel(&self) -> Option<&Tunnel> {
        self.state.tunnel.as_ref()
    }
}
