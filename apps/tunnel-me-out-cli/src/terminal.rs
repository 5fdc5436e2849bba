//! Terminal renditions of the host utilities and of the tunnel view state.

use chrono::{DateTime, Utc};
use tunnel_me_out_client::{
    Clipboard, ClipboardError, Notification, NotificationKind, Notifier, TunnelViewState,
};

pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, notification: Notification) {
        let marker = match notification.kind {
            NotificationKind::Positive => "ok",
            NotificationKind::Negative => "error",
            NotificationKind::Warning => "warning",
            NotificationKind::Info => "info",
        };
        eprintln!("[{marker}] {}", notification.message);
    }
}

pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn copy_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut clipboard = arboard::Clipboard::new()
            .map_err(|error| ClipboardError::Unavailable(error.to_string()))?;
        clipboard
            .set_text(text.to_string())
            .map_err(|error| ClipboardError::Write(error.to_string()))
    }
}

pub fn render_status(state: &TunnelViewState, now: DateTime<Utc>) -> Vec<String> {
    let Some(tunnel) = state.tunnel.as_ref() else {
        return vec![state.progress_label()];
    };

    let mut lines = vec![
        format!("status:       {}", tunnel.effective_status(now).as_str()),
        format!("days:         {}", tunnel.days),
        format!("expires:      {}", state.expires_label()),
        format!(
            "remaining:    {:.0}%",
            (state.progress_at(now) * 100.0).round()
        ),
        format!("reachability: {}", state.reachability.as_str()),
    ];
    if let Some(public_url) = tunnel.public_url.as_deref() {
        lines.push(format!("public url:   {public_url}"));
    }
    if state.invoice_dialog.show {
        lines.push(String::new());
        lines.push("pay this invoice to activate the tunnel:".to_string());
        lines.push(state.invoice_dialog.payment_request.clone());
    }
    if let Some(command) = tunnel.ssh_command.as_deref() {
        lines.push(String::new());
        lines.push("connection command:".to_string());
        lines.extend(command.lines().map(str::to_string));
    }
    lines
}
