use thiserror::Error;

use crate::eligibility::IneligibleReason;

/// Errors that can occur across the rental lifecycle
#[derive(Error, Debug)]
pub enum UdryError {
    /// Bluetooth Low Energy stack errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter present, or the adapter is disabled
    ///
    /// Surfaced distinctly so the caller can prompt the user to turn
    /// Bluetooth on rather than report a protocol failure.
    #[error("Bluetooth is unavailable: {0}")]
    BluetoothUnavailable(String),

    /// The user dismissed device selection; non-fatal, return to idle
    #[error("Device selection was cancelled")]
    SelectionCancelled,

    /// No machine advertising the expected name was found in the scan window
    #[error("No machine named \"{0}\" was found")]
    MachineNotFound(String),

    /// GATT connection could not be established
    #[error("Failed to connect to machine: {0}")]
    ConnectionFailed(String),

    /// The connection dropped mid-protocol; not a successful cancellation
    #[error("The machine connection was lost")]
    Disconnected,

    /// The machine's token payload did not match the 6-digit pattern
    ///
    /// Carries the received string verbatim to aid vendor-side debugging.
    #[error("Invalid token format received: the string did not match the expected pattern. Received: \"{0}\"")]
    MalformedToken(String),

    /// The machine reported this exact action was already processed
    ///
    /// Must not be silently retried; blind retries can worsen vendor-side
    /// state.
    #[error("Machine error: this action has already been processed ({0})")]
    DuplicateAction(String),

    /// The command-signing service refused or failed to sign
    #[error("Failed to get unlock command: {0}")]
    SigningFailed(String),

    /// Transport-level failure talking to the signing service
    #[error("Signing service request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The machine never confirmed the physical return
    ///
    /// The rental is explicitly NOT closed on this path; the user keeps
    /// their active rental and is told to check the insertion and retry.
    #[error(
        "Return confirmation timeout after {timeout_ms}ms. The machine did not confirm the \
         return. Please check if the umbrella is properly inserted and try again. Your rental \
         is still active."
    )]
    ConfirmationTimeout {
        /// How long the engine waited for the final acknowledgment
        timeout_ms: u64,
    },

    /// The surrounding UI tore the attempt down
    #[error("The unlock attempt was cancelled")]
    Cancelled,

    /// The user does not meet the rental preconditions
    #[error("{0}")]
    Ineligible(IneligibleReason),

    /// Referenced stall record does not exist
    #[error("Stall not found: {0}")]
    StallNotFound(String),

    /// Referenced user record does not exist
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// A rental is already active; a user holds at most one
    #[error("An active rental already exists for this user")]
    ActiveRentalExists,

    /// Close requested but the user has no active rental
    #[error("No active rental to close")]
    NoActiveRental,

    /// The close request's session snapshot does not match the stored rental
    #[error("Rental snapshot does not match the active rental")]
    SessionMismatch,

    /// The close request payload is missing or malforms required fields
    #[error("Invalid rental session payload: {0}")]
    InvalidSession(String),

    /// Backing-store failure; the rental is left intact and the caller may retry
    #[error("Storage error: {0}")]
    Store(String),
}

/// Result type for U-Dry operations
pub type Result<T> = std::result::Result<T, UdryError>;

impl UdryError {
    /// Whether this is a user-initiated or user-fixable abort
    ///
    /// These paths return the UI to idle without raising an alarm.
    #[must_use]
    pub const fn is_user_cancel(&self) -> bool {
        matches!(
            self,
            Self::SelectionCancelled | Self::BluetoothUnavailable(_) | Self::Cancelled
        )
    }

    /// Whether this error indicates a connection-layer problem
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectionFailed(_) | Self::Disconnected | Self::MachineNotFound(_)
        )
    }

    /// Whether the operation is safe to retry as-is
    ///
    /// A confirmation timeout or a failed closing transaction leaves the
    /// rental intact, so the user can simply attempt the return again. A
    /// duplicate-action rejection is deliberately NOT retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConfirmationTimeout { .. } | Self::Store(_) | Self::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let cancelled = UdryError::SelectionCancelled;
        assert!(cancelled.is_user_cancel());
        assert!(!cancelled.is_connection_error());
        assert!(!cancelled.is_retryable());

        let dropped = UdryError::Disconnected;
        assert!(dropped.is_connection_error());
        assert!(!dropped.is_user_cancel());

        let timed_out = UdryError::ConfirmationTimeout { timeout_ms: 30_000 };
        assert!(timed_out.is_retryable());
        assert!(!timed_out.is_connection_error());

        let duplicate = UdryError::DuplicateAction("slot 3".to_string());
        assert!(!duplicate.is_retryable());
        assert!(!duplicate.is_user_cancel());
    }

    #[test]
    fn test_malformed_token_names_received_string() {
        let error = UdryError::MalformedToken("12AB56".to_string());
        let text = format!("{error}");
        assert!(text.contains("\"12AB56\""));
        assert!(text.contains("expected pattern"));
    }

    #[test]
    fn test_timeout_message_says_rental_still_active() {
        let error = UdryError::ConfirmationTimeout { timeout_ms: 30_000 };
        assert!(format!("{error}").contains("rental is still active"));
    }
}
