use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

/// Current wall-clock time as epoch milliseconds.
///
/// All rental timestamps are stored in this form; the billing calculator
/// operates on the same representation so that the live estimate and the
/// authoritative settlement agree.
#[must_use]
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Category of a diagnostic log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Bytes written to the machine
    Sent,
    /// Bytes received from the machine
    Received,
    /// State transition or other informational event
    Info,
    /// Failure recorded before surfacing an error
    Error,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Received => write!(f, "received"),
            Self::Info => write!(f, "info"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One entry in a rental's diagnostic audit trail
///
/// The log sequence is the only record support staff have when investigating
/// a billing dispute, so every wire exchange and every consequential state
/// transition is appended here, including on failure paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalLog {
    /// Epoch milliseconds when the event occurred
    pub timestamp: i64,
    /// Entry category
    pub kind: LogKind,
    /// Human-readable diagnostic message
    pub message: String,
}

impl RentalLog {
    /// Create an entry timestamped now
    #[must_use]
    pub fn now(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: epoch_ms(),
            kind,
            message: message.into(),
        }
    }
}

/// The active rental record
///
/// A user has at most one of these at a time. It is created when the unlock
/// protocol succeeds for a rent action and destroyed only by the
/// rental-closing transaction after a confirmed return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalSession {
    /// Identifier of the origin stall
    pub stall_id: String,
    /// Display name of the origin stall
    pub stall_name: String,
    /// Epoch milliseconds at creation; immutable thereafter
    pub start_time: i64,
    /// True only for a user's very first rental
    pub is_free: bool,
    /// Append-only diagnostic trail, unbounded within the session
    pub logs: Vec<RentalLog>,
}

impl RentalSession {
    /// Create a session starting now with an empty log trail
    #[must_use]
    pub fn new(stall_id: impl Into<String>, stall_name: impl Into<String>, is_free: bool) -> Self {
        Self {
            stall_id: stall_id.into(),
            stall_name: stall_name.into(),
            start_time: epoch_ms(),
            is_free,
            logs: Vec::new(),
        }
    }

    /// Milliseconds elapsed since the session started
    #[must_use]
    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.start_time).max(0)
    }
}

/// Immutable snapshot of a closed rental
///
/// Written exactly once by the closing transaction and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalHistory {
    /// Server-generated record id
    pub rental_id: String,
    /// Owner of the rental
    pub user_id: String,
    /// Origin stall id
    pub stall_id: String,
    /// Origin stall name
    pub stall_name: String,
    /// Epoch milliseconds when the rental started
    pub start_time: i64,
    /// Whether the free-first-rental flag applied
    pub is_free: bool,
    /// Epoch milliseconds when the rental was settled
    pub end_time: i64,
    /// Elapsed time in fractional hours
    pub duration_hours: f64,
    /// Settled cost, always within `0..=100`
    pub final_cost: f64,
    /// Destination stall id
    pub returned_to_stall_id: String,
    /// Destination stall name
    pub returned_to_stall_name: String,
    /// Diagnostic trail carried over from the session
    pub logs: Vec<RentalLog>,
}

/// A physical umbrella-vending installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stall {
    /// Physical device identifier, also the record key
    pub dvid: String,
    /// Display name shown to the user
    pub name: String,
    /// BLE advertised name of the machine
    pub bt_name: String,
    /// Umbrellas currently in the stall
    pub available_umbrellas: u32,
    /// Slot capacity of the stall
    pub total_umbrellas: u32,
    /// Rotating integer the vendor API uses to disambiguate repeated
    /// commands to the same physical slot; advanced after every
    /// successful action
    pub next_action_slot: u32,
    /// Visibility flag for the map layer, unrelated to the unlock protocol
    pub is_deployed: bool,
}

impl Stall {
    /// Whether at least one umbrella can be dispensed
    #[must_use]
    pub const fn has_stock(&self) -> bool {
        self.available_umbrellas > 0
    }
}

/// Wallet and rental fields of a user record
///
/// The core reads these to gate eligibility and writes `balance` and
/// `active_rental` through the store; everything else about the user
/// (auth identity, profile) lives outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Refundable deposit on file, in HK$
    pub deposit: f64,
    /// Spendable balance, in HK$; may go negative after settlement
    pub balance: f64,
    /// Payment-intent reference for the deposit, if paid by card
    pub deposit_payment_intent_id: Option<String>,
    /// Set once the free first rental has been consumed
    pub has_had_first_free_rental: bool,
    /// The single active rental, if any
    pub active_rental: Option<RentalSession>,
}

impl UserProfile {
    /// Whether the next rental would be the user's free first one
    #[must_use]
    pub const fn is_first_rental(&self) -> bool {
        !self.has_had_first_free_rental
    }
}

/// A machine discovered during a BLE scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Platform-specific peripheral identifier
    pub device_id: String,
    /// Advertised local name, if the machine broadcast one
    pub name: Option<String>,
    /// Signal strength at discovery time
    pub rssi: i16,
}

/// Extract the stall `dvid` from a scanned QR payload.
///
/// Stall codes are printed either as a plain device id or as a URL whose
/// trailing path segment is the id.
#[must_use]
pub fn dvid_from_qr(payload: &str) -> &str {
    let trimmed = payload.trim();
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Format elapsed milliseconds as `HH:MM:SS` for the live rental timer
#[must_use]
pub fn format_elapsed(elapsed_ms: i64) -> String {
    let total_seconds = elapsed_ms.max(0) / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dvid_from_url_payload() {
        assert_eq!(
            dvid_from_qr("https://ttj.mjyun.com/stall/CMYS234400696"),
            "CMYS234400696"
        );
    }

    #[test]
    fn test_dvid_from_raw_payload() {
        assert_eq!(dvid_from_qr("  CMYS234400696\n"), "CMYS234400696");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "00:00:00");
        assert_eq!(format_elapsed(61_000), "00:01:01");
        assert_eq!(
            format_elapsed(2 * 3_600_000 + 5 * 60_000 + 9_000),
            "02:05:09"
        );
        assert_eq!(format_elapsed(-500), "00:00:00");
    }

    #[test]
    fn test_session_elapsed_never_negative() {
        let session = RentalSession::new("CMYS1", "Central Pier", false);
        assert_eq!(session.elapsed_ms(session.start_time - 1000), 0);
    }

    #[test]
    fn test_log_kind_serde_lowercase() {
        let entry = RentalLog {
            timestamp: 1,
            kind: LogKind::Received,
            message: "Received Signal: \"TOK:123456\"".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"received\""));
    }
}
