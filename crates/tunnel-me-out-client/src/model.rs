//! Tunnel records, view state, and the derived expiry values rendered from them.

use chrono::{DateTime, Duration, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
pub const PRUNE_AFTER_DAYS: i64 = 7;
pub const NO_TUNNEL_LABEL: &str = "No tunnel yet";
pub const EXPIRY_NOT_SET_LABEL: &str = "Not set";
pub const DEFAULT_DAYS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Pending,
    Active,
    Expired,
    #[serde(other)]
    Unknown,
}

impl TunnelStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }
}

/// Tunnel snapshot as served by the backend.
///
/// The backend record's standalone `ssh_private_key` field is not decoded.
/// The key still reaches the client inside `ssh_command`, which is the
/// connection script the backend builds around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub status: TunnelStatus,
    pub days: u32,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_request: String,
    #[serde(default)]
    pub payment_hash: String,
    #[serde(default)]
    pub ssh_command: Option<String>,
    #[serde(default)]
    pub reachable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Tunnel {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// True once the tunnel has been expired for longer than the backend keeps it.
    #[must_use]
    pub fn prune_ready(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|expires_at| now - expires_at > Duration::days(PRUNE_AFTER_DAYS))
    }

    /// Status as the user should see it; the backend does not flip active tunnels
    /// to expired on its own.
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>) -> TunnelStatus {
        if self.status == TunnelStatus::Active && self.is_expired(now) {
            TunnelStatus::Expired
        } else {
            self.status
        }
    }

    /// Remaining fraction of the paid lifetime, clamped to `[0, 1]`.
    #[must_use]
    pub fn progress(&self, now: DateTime<Utc>) -> f64 {
        let Some(expires_at) = self.expires_at else {
            return 0.0;
        };
        let total_ms = i64::from(self.days) * MS_PER_DAY;
        if total_ms <= 0 {
            return 0.0;
        }
        let remaining_ms = (expires_at - now).num_milliseconds().max(0);
        (remaining_ms as f64 / total_ms as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceDialog {
    pub show: bool,
    pub payment_request: String,
    pub payment_hash: String,
}

impl InvoiceDialog {
    pub fn open_for(&mut self, tunnel: &Tunnel) {
        self.payment_request = tunnel.payment_request.clone();
        self.payment_hash = tunnel.payment_hash.clone();
        self.show = true;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl Reachability {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Reachable => "reachable",
            Self::Unreachable => "unreachable",
        }
    }
}

impl From<bool> for Reachability {
    fn from(reachable: bool) -> Self {
        if reachable {
            Self::Reachable
        } else {
            Self::Unreachable
        }
    }
}

/// Everything the view layer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelViewState {
    pub days: u32,
    pub loading: bool,
    pub tunnel: Option<Tunnel>,
    pub invoice_dialog: InvoiceDialog,
    pub reachability: Reachability,
}

impl Default for TunnelViewState {
    fn default() -> Self {
        Self {
            days: DEFAULT_DAYS,
            loading: false,
            tunnel: None,
            invoice_dialog: InvoiceDialog::default(),
            reachability: Reachability::Unknown,
        }
    }
}

impl TunnelViewState {
    #[must_use]
    pub fn progress_at(&self, now: DateTime<Utc>) -> f64 {
        self.tunnel
            .as_ref()
            .map_or(0.0, |tunnel| tunnel.progress(now))
    }

    #[must_use]
    pub fn progress(&self) -> f64 {
        self.progress_at(Utc::now())
    }

    #[must_use]
    pub fn progress_label(&self) -> String {
        match self.expires_at() {
            Some(expires_at) => format!("Expires at {}", format_local(expires_at)),
            None => NO_TUNNEL_LABEL.to_string(),
        }
    }

    #[must_use]
    pub fn expires_label(&self) -> String {
        self.expires_at()
            .map_or_else(|| EXPIRY_NOT_SET_LABEL.to_string(), format_local)
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.tunnel.as_ref().and_then(|tunnel| tunnel.expires_at)
    }
}

/// Accepts RFC 3339 timestamps and naive ones, which are read as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    parse_timestamp(raw)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelEnvelope {
    #[serde(default)]
    pub tunnel: Option<Tunnel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PingResponse {
    pub reachable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tunnel_expiring(days: u32, expires_at: Option<DateTime<Utc>>) -> Tunnel {
        Tunnel {
            status: TunnelStatus::Active,
            days,
            expires_at,
            payment_request: "lnbc1".to_string(),
            payment_hash: "hash".to_string(),
            ssh_command: None,
            reachable: None,
            tunnel_id: None,
            subdomain: None,
            public_url: None,
            remote_port: None,
            ssh_user: None,
            ssh_host: None,
            local_host: None,
            local_port: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn progress_is_remaining_fraction_of_lifetime() {
        let now = at(0);
        let tunnel = tunnel_expiring(2, Some(now + Duration::days(1)));
        assert!((tunnel.progress(now) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn progress_stays_within_unit_interval() {
        let now = at(0);
        for hours in [0_i64, 1, 12, 24, 47, 48, 72, 500] {
            let tunnel = tunnel_expiring(2, Some(now + Duration::hours(hours)));
            let progress = tunnel.progress(now);
            assert!((0.0..=1.0).contains(&progress), "hours={hours} progress={progress}");
        }
    }

    #[test]
    fn progress_is_zero_exactly_when_expired() {
        let now = at(12);
        let expired = tunnel_expiring(1, Some(at(12)));
        assert_eq!(expired.progress(now), 0.0);
        let long_gone = tunnel_expiring(1, Some(at(1)));
        assert_eq!(long_gone.progress(now), 0.0);
        let one_second_left = tunnel_expiring(1, Some(now + Duration::seconds(1)));
        assert!(one_second_left.progress(now) > 0.0);
    }

    #[test]
    fn missing_tunnel_or_expiry_uses_sentinels() {
        let mut state = TunnelViewState::default();
        assert_eq!(state.progress(), 0.0);
        assert_eq!(state.progress_label(), NO_TUNNEL_LABEL);
        assert_eq!(state.expires_label(), EXPIRY_NOT_SET_LABEL);

        state.tunnel = Some(tunnel_expiring(1, None));
        assert_eq!(state.progress(), 0.0);
        assert_eq!(state.progress_label(), NO_TUNNEL_LABEL);
    }

    #[test]
    fn zero_day_tunnel_has_no_progress() {
        let now = at(0);
        let tunnel = tunnel_expiring(0, Some(now + Duration::hours(3)));
        assert_eq!(tunnel.progress(now), 0.0);
    }

    #[test]
    fn progress_label_mentions_expiry() {
        let state = TunnelViewState {
            tunnel: Some(tunnel_expiring(1, Some(at(5)))),
            ..TunnelViewState::default()
        };
        assert!(state.progress_label().starts_with("Expires at "));
        assert_ne!(state.expires_label(), EXPIRY_NOT_SET_LABEL);
    }

    #[test]
    fn active_tunnel_past_expiry_reads_as_expired() {
        let tunnel = tunnel_expiring(1, Some(at(3)));
        assert_eq!(tunnel.effective_status(at(2)), TunnelStatus::Active);
        assert_eq!(tunnel.effective_status(at(3)), TunnelStatus::Expired);
        assert!(!tunnel.prune_ready(at(4)));
        assert!(tunnel.prune_ready(at(3) + Duration::days(8)));
    }

    #[test]
    fn tunnel_decodes_backend_record_and_skips_key_field() {
        let tunnel: Tunnel = serde_json::from_value(serde_json::json!({
            "id": "user-1",
            "tunnel_id": "t-1",
            "subdomain": "abc",
            "remote_port": 40123,
            "ssh_user": "tunnel",
            "ssh_host": "lnpro.xyz",
            "ssh_private_key": "-----BEGIN KEY-----",
            "ssh_command": "ssh -N -R 40123:localhost:5000 tunnel@lnpro.xyz",
            "public_url": "https://abc.lnpro.xyz",
            "expires_at": "2026-03-02T00:00:00Z",
            "payment_hash": "ph",
            "payment_request": "lnbc10n1",
            "status": "active",
            "days": 1
        }))
        .expect("decode tunnel");

        assert_eq!(tunnel.status, TunnelStatus::Active);
        assert_eq!(tunnel.remote_port, Some(40123));
        assert_eq!(tunnel.public_url.as_deref(), Some("https://abc.lnpro.xyz"));
        let encoded = serde_json::to_string(&tunnel).expect("encode tunnel");
        assert!(!encoded.contains("BEGIN KEY"));
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let envelope: TunnelEnvelope = serde_json::from_value(serde_json::json!({
            "tunnel": {
                "status": "active",
                "days": 1,
                "expires_at": "2026-03-02T00:00:00.123456",
                "created_at": "2026-03-01 00:00:00",
                "updated_at": null
            }
        }))
        .expect("decode envelope");
        let tunnel = envelope.tunnel.expect("tunnel present");
        let expected = Utc
            .with_ymd_and_hms(2026, 3, 2, 0, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::microseconds(123_456);
        assert_eq!(tunnel.expires_at, Some(expected));
        assert_eq!(tunnel.created_at, Some(at(0)));
        assert_eq!(tunnel.updated_at, None);
    }

    #[test]
    fn offset_timestamps_are_normalised_to_utc() {
        let tunnel: Tunnel = serde_json::from_value(serde_json::json!({
            "status": "pending",
            "days": 1,
            "expires_at": "2026-03-01T05:00:00+02:00"
        }))
        .expect("decode tunnel");
        assert_eq!(tunnel.expires_at, Some(at(3)));
    }

    #[test]
    fn garbage_timestamp_is_a_decode_error() {
        let result = serde_json::from_value::<Tunnel>(serde_json::json!({
            "status": "pending",
            "days": 1,
            "expires_at": "next tuesday"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn unrecognised_status_decodes_as_unknown() {
        let envelope: TunnelEnvelope = serde_json::from_value(serde_json::json!({
            "tunnel": {"status": "suspended", "days": 2}
        }))
        .expect("decode envelope");
        let tunnel = envelope.tunnel.expect("tunnel present");
        assert_eq!(tunnel.status, TunnelStatus::Unknown);
        assert_eq!(tunnel.expires_at, None);

        let empty: TunnelEnvelope =
            serde_json::from_value(serde_json::json!({"tunnel": null})).expect("decode null");
        assert!(empty.tunnel.is_none());
    }
}
