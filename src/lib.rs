#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # U-Dry ☔
//!
//! Core engine for the U-Dry umbrella rental service.
//!
//! U-Dry rents umbrellas from physical street stalls. Each stall carries a
//! BLE-controlled vending machine; renting or returning an umbrella means
//! running a short challenge/response protocol against the machine, with a
//! vendor API signing each unlock command. This crate owns that protocol
//! plus the money-adjacent pieces around it:
//!
//! - [`ble`] — transport to the machines' single-characteristic GATT
//!   service
//! - [`protocol`] — the wire format and the pure unlock state machine
//! - [`signing`] — token-for-command exchange with the vendor API
//! - [`engine`] — the async driver tying transport, protocol, and signing
//!   together
//! - [`eligibility`] — whether a user may start a rental
//! - [`billing`] — the tiered cost formula shared by the live estimate
//!   and settlement
//! - [`store`] — users, stalls, and the transactional rental-closing path
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use udry::{
//!     ble::BleMachineLink,
//!     engine::{Discovery, UnlockEngine},
//!     protocol::UnlockAction,
//!     signing::VendorApiSigner,
//!     types::Stall,
//! };
//!
//! # async fn run(stall: Stall) -> udry::Result<()> {
//! let link = Arc::new(BleMachineLink::new());
//! let signer = Arc::new(VendorApiSigner::new("app-id", "api-key"));
//! let mut engine = UnlockEngine::new(link, signer);
//!
//! let report = engine
//!     .unlock(&stall, UnlockAction::Rent, Discovery::Picker)
//!     .await?;
//! println!("unlocked via {:?}", report.machine.name);
//! # Ok(())
//! # }
//! ```
//!
//! The billing calculator and eligibility gate are plain synchronous
//! functions; the transactional pieces live behind the
//! [`store::RentalStore`] trait so the hosted backend and the in-memory
//! test double share one contract.

/// Transport to the machines' single-characteristic GATT service.
pub mod ble;
/// The tiered cost formula shared by the live estimate and settlement.
pub mod billing;
/// Whether a user may start a rental.
pub mod eligibility;
/// The async driver tying transport, protocol, and signing together.
pub mod engine;
/// Crate-wide error and result types.
pub mod error;
/// The wire format and the pure unlock state machine.
pub mod protocol;
/// Token-for-command exchange with the vendor API.
pub mod signing;
/// Users, stalls, and the transactional rental-closing path.
pub mod store;
/// Shared data types for users, stalls, machines, and rentals.
pub mod types;

pub use error::{Result, UdryError};
pub use types::{MachineInfo, RentalHistory, RentalLog, RentalSession, Stall, UserProfile};

use std::time::Duration;

/// GATT service exposed by every stall machine
pub const UTEK_SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";

/// The single characteristic used for both commands and notifications
pub const UTEK_CHARACTERISTIC_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

/// Upper bound on any machine scan; scans always self-terminate
pub const SCAN_WINDOW: Duration = Duration::from_secs(5);

/// How long the return flow waits for the machine's counted confirmation
/// before telling the user their rental is still active
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
