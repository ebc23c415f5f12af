use crate::error::UdryError;
use bytes::Bytes;
use std::fmt;

/// Frame terminator for all machine traffic
pub const FRAME_TERMINATOR: &str = "\r\n";

/// Authentication request written to the machine after connecting
pub const TOKEN_REQUEST_FRAME: &str = "TOK\r\n";

/// Number of cumulative `CMD:OK` acknowledgments the machine sends for a
/// confirmed return
///
/// The machine retransmits the acknowledgment for reliability over its own
/// radio link; the return flow only succeeds once all four have arrived
/// for the current attempt.
pub const RETURN_CONFIRMATION_ACKS: u8 = 4;

/// Build the unlock command frame around a vendor-signed string
#[must_use]
pub fn command_frame(signed: &str) -> String {
    format!("CMD:{signed}{FRAME_TERMINATOR}")
}

/// Encode a frame as the byte sequence written to the characteristic
///
/// All payloads are plain ASCII sent as character codes; there is no
/// binary framing.
#[must_use]
pub fn frame_bytes(frame: &str) -> Bytes {
    Bytes::copy_from_slice(frame.as_bytes())
}

/// Which physical action the unlock protocol is driving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockAction {
    /// Unlock a slot to dispense an umbrella
    Rent,
    /// Unlock a slot to accept an umbrella back
    Return,
}

impl UnlockAction {
    /// Base offset added to the stall's action slot to form the vendor
    /// `parm`; the offset is how the vendor API distinguishes the two
    /// physical actions
    #[must_use]
    pub const fn base_parm(self) -> u32 {
        match self {
            Self::Rent => 1_000_000,
            Self::Return => 3_000_000,
        }
    }

    /// Vendor `cmd_type` discriminator
    #[must_use]
    pub const fn cmd_type(self) -> &'static str {
        match self {
            Self::Rent => "0",
            Self::Return => "1",
        }
    }

    /// Acknowledgments required before the attempt succeeds
    ///
    /// Rent success is implicit in the command write; only the return flow
    /// waits for the counted `CMD:OK` confirmation.
    #[must_use]
    pub const fn required_acks(self) -> u8 {
        match self {
            Self::Rent => 0,
            Self::Return => RETURN_CONFIRMATION_ACKS,
        }
    }

    /// The 7-digit vendor `parm` string for a given stall slot
    #[must_use]
    pub fn parm(self, next_action_slot: u32) -> String {
        (self.base_parm() + next_action_slot).to_string()
    }
}

impl fmt::Display for UnlockAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rent => write!(f, "rent"),
            Self::Return => write!(f, "return"),
        }
    }
}

/// Client-side protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockPhase {
    /// Nothing in flight
    Idle,
    /// Bluetooth adapter initialization
    Initializing,
    /// Waiting on the platform device picker
    RequestingDevice,
    /// Active scan with a user-facing result list
    Scanning,
    /// GATT connection in progress
    Connecting,
    /// Connected; token request written, waiting for `TOK:`
    GettingToken,
    /// Token in hand; waiting on the command-signing service
    GettingCommand,
    /// Writing the signed command to the machine
    SendingCommand,
    /// Return flow only: waiting for the counted `CMD:OK` confirmation
    AwaitingConfirmation,
    /// Terminal for the attempt; the action physically happened
    Success,
    /// Terminal for the attempt; the session may retry from stall
    /// identification
    Error,
}

impl UnlockPhase {
    /// Whether the attempt has reached a terminal state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl fmt::Display for UnlockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::RequestingDevice => "requesting_device",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::GettingToken => "getting_token",
            Self::GettingCommand => "getting_command",
            Self::SendingCommand => "sending_command",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Success => "success",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// A parsed inbound frame from the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    /// `TOK:` frame carrying a valid 6-digit payload, already truncated to
    /// the 3 digits the signing service expects
    TokenReceived {
        /// First 3 digits of the machine's 6-digit token
        token: String,
    },
    /// A `CMD:OK` acknowledgment
    CommandAck,
    /// `REPET:` duplicate-action rejection with the vendor's reason text
    Duplicate(String),
    /// `TOK:` frame whose payload failed the 6-digit pattern; carries the
    /// received string verbatim
    Malformed(String),
}

/// Parse one inbound notification frame.
///
/// Frames the protocol does not key on (for example plain `CMD:` echoes
/// during a rent) are ignored and return `None`.
#[must_use]
pub fn parse_frame(raw: &str) -> Option<MachineEvent> {
    let frame = raw.trim();

    if let Some(payload) = frame.strip_prefix("TOK:") {
        let token = payload.trim();
        if token.len() == 6 && token.bytes().all(|b| b.is_ascii_digit()) {
            // Only the first 3 digits are exchanged with the signing
            // service. The truncation is a fixed expectation of the vendor
            // API, not a parsing shortcut.
            return Some(MachineEvent::TokenReceived {
                token: token[..3].to_string(),
            });
        }
        return Some(MachineEvent::Malformed(token.to_string()));
    }

    if frame.contains("CMD:OK") {
        return Some(MachineEvent::CommandAck);
    }

    if let Some(reason) = frame.strip_prefix("REPET:") {
        return Some(MachineEvent::Duplicate(reason.trim().to_string()));
    }

    None
}

/// Why the state machine failed the attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// Token payload failed validation
    MalformedToken(String),
    /// Vendor machine rejected the action as already processed
    DuplicateAction(String),
}

impl FailReason {
    /// Convert into the crate error surfaced to the caller
    #[must_use]
    pub fn into_error(self) -> UdryError {
        match self {
            Self::MalformedToken(raw) => UdryError::MalformedToken(raw),
            Self::DuplicateAction(reason) => UdryError::DuplicateAction(reason),
        }
    }
}

/// Side effect the driver must perform after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Exchange the token for a signed unlock command
    RequestSignedCommand {
        /// 3-digit token from the machine
        token: String,
    },
    /// Cancel any pending confirmation timer
    ///
    /// Emitted on every transition out of `AwaitingConfirmation` so the
    /// timer can never fire after its window closed.
    CancelConfirmationTimer,
    /// The attempt succeeded; finalize and tear down
    DeclareSuccess,
    /// The attempt failed
    Fail(FailReason),
}

/// The client-side unlock state machine
///
/// A pure event-driven core: the async driver feeds it parsed
/// [`MachineEvent`]s and performs the returned [`Effect`]s. Keeping the
/// transition logic free of I/O makes the counting and reset rules
/// testable without a BLE stack.
#[derive(Debug, Clone)]
pub struct UnlockMachine {
    action: UnlockAction,
    phase: UnlockPhase,
    acks: u8,
}

impl UnlockMachine {
    /// Create a machine in the idle phase
    #[must_use]
    pub const fn new(action: UnlockAction) -> Self {
        Self {
            action,
            phase: UnlockPhase::Idle,
            acks: 0,
        }
    }

    /// The action this attempt is driving
    #[must_use]
    pub const fn action(&self) -> UnlockAction {
        self.action
    }

    /// Current protocol phase
    #[must_use]
    pub const fn phase(&self) -> UnlockPhase {
        self.phase
    }

    /// `CMD:OK` acknowledgments counted since the last fresh token
    #[must_use]
    pub const fn acks(&self) -> u8 {
        self.acks
    }

    /// Driver-initiated transition (adapter init, connect, command write)
    pub fn advance(&mut self, phase: UnlockPhase) {
        self.phase = phase;
    }

    /// Apply one inbound machine event and return the effects to perform.
    ///
    /// Events arriving after a terminal phase are ignored; the attempt is
    /// already decided.
    pub fn on_event(&mut self, event: MachineEvent) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }

        match event {
            MachineEvent::TokenReceived { token } => {
                // A fresh token starts a fresh attempt on the machine side;
                // acknowledgment counts are per-attempt, never global.
                self.acks = 0;
                self.phase = UnlockPhase::GettingCommand;
                vec![
                    Effect::CancelConfirmationTimer,
                    Effect::RequestSignedCommand { token },
                ]
            }
            MachineEvent::CommandAck => {
                if self.phase == UnlockPhase::AwaitingConfirmation
                    && self.action.required_acks() > 0
                {
                    self.acks = self.acks.saturating_add(1);
                    if self.acks >= self.action.required_acks() {
                        self.phase = UnlockPhase::Success;
                        return vec![Effect::CancelConfirmationTimer, Effect::DeclareSuccess];
                    }
                }
                // Rent flow treats command echoes as informational only.
                Vec::new()
            }
            MachineEvent::Duplicate(reason) => {
                self.phase = UnlockPhase::Error;
                vec![
                    Effect::CancelConfirmationTimer,
                    Effect::Fail(FailReason::DuplicateAction(reason)),
                ]
            }
            MachineEvent::Malformed(raw) => {
                self.phase = UnlockPhase::Error;
                vec![
                    Effect::CancelConfirmationTimer,
                    Effect::Fail(FailReason::MalformedToken(raw)),
                ]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_event(token: &str) -> MachineEvent {
        parse_frame(&format!("TOK:{token}")).unwrap()
    }

    #[test]
    fn test_frame_building() {
        assert_eq!(command_frame("A1B2C3"), "CMD:A1B2C3\r\n");
        assert_eq!(frame_bytes(TOKEN_REQUEST_FRAME).as_ref(), b"TOK\r\n");
    }

    #[test]
    fn test_token_parsing_truncates_to_three_digits() {
        let event = parse_frame("TOK:123456\r\n").unwrap();
        assert_eq!(
            event,
            MachineEvent::TokenReceived {
                token: "123".to_string()
            }
        );
    }

    #[test]
    fn test_short_or_non_numeric_token_is_malformed() {
        assert_eq!(
            parse_frame("TOK:12345"),
            Some(MachineEvent::Malformed("12345".to_string()))
        );
        assert_eq!(
            parse_frame("TOK:12AB56"),
            Some(MachineEvent::Malformed("12AB56".to_string()))
        );
        assert_eq!(
            parse_frame("TOK:1234567"),
            Some(MachineEvent::Malformed("1234567".to_string()))
        );
    }

    #[test]
    fn test_ack_and_duplicate_parsing() {
        assert_eq!(parse_frame("CMD:OK\r\n"), Some(MachineEvent::CommandAck));
        // Machines prefix their retransmits inconsistently; substring
        // matching is deliberate.
        assert_eq!(parse_frame("xCMD:OK"), Some(MachineEvent::CommandAck));
        assert_eq!(
            parse_frame("REPET: slot already actioned"),
            Some(MachineEvent::Duplicate("slot already actioned".to_string()))
        );
    }

    #[test]
    fn test_unrelated_frames_are_ignored() {
        assert_eq!(parse_frame("CMD:SENT"), None);
        assert_eq!(parse_frame(""), None);
        assert_eq!(parse_frame("HELLO"), None);
    }

    #[test]
    fn test_parm_offsets() {
        assert_eq!(UnlockAction::Rent.parm(7), "1000007");
        assert_eq!(UnlockAction::Return.parm(7), "3000007");
        assert_eq!(UnlockAction::Rent.cmd_type(), "0");
        assert_eq!(UnlockAction::Return.cmd_type(), "1");
    }

    #[test]
    fn test_token_triggers_signing_request() {
        let mut machine = UnlockMachine::new(UnlockAction::Rent);
        machine.advance(UnlockPhase::GettingToken);

        let effects = machine.on_event(token_event("123456"));
        assert_eq!(machine.phase(), UnlockPhase::GettingCommand);
        assert!(effects.contains(&Effect::RequestSignedCommand {
            token: "123".to_string()
        }));
    }

    #[test]
    fn test_return_needs_exactly_four_acks() {
        let mut machine = UnlockMachine::new(UnlockAction::Return);
        machine.advance(UnlockPhase::AwaitingConfirmation);

        for expected in 1..=3u8 {
            assert!(machine.on_event(MachineEvent::CommandAck).is_empty());
            assert_eq!(machine.acks(), expected);
            assert_eq!(machine.phase(), UnlockPhase::AwaitingConfirmation);
        }

        let effects = machine.on_event(MachineEvent::CommandAck);
        assert_eq!(machine.phase(), UnlockPhase::Success);
        assert!(effects.contains(&Effect::DeclareSuccess));
        assert!(effects.contains(&Effect::CancelConfirmationTimer));
    }

    #[test]
    fn test_fresh_token_resets_ack_counter() {
        let mut machine = UnlockMachine::new(UnlockAction::Return);
        machine.advance(UnlockPhase::AwaitingConfirmation);

        for _ in 0..3 {
            machine.on_event(MachineEvent::CommandAck);
        }
        assert_eq!(machine.acks(), 3);

        machine.on_event(token_event("654321"));
        assert_eq!(machine.acks(), 0);
        assert_eq!(machine.phase(), UnlockPhase::GettingCommand);
    }

    #[test]
    fn test_rent_ignores_acks() {
        let mut machine = UnlockMachine::new(UnlockAction::Rent);
        machine.advance(UnlockPhase::SendingCommand);

        for _ in 0..10 {
            assert!(machine.on_event(MachineEvent::CommandAck).is_empty());
        }
        assert_eq!(machine.acks(), 0);
        assert_eq!(machine.phase(), UnlockPhase::SendingCommand);
    }

    #[test]
    fn test_duplicate_fails_from_any_phase() {
        for phase in [
            UnlockPhase::GettingToken,
            UnlockPhase::GettingCommand,
            UnlockPhase::SendingCommand,
            UnlockPhase::AwaitingConfirmation,
        ] {
            let mut machine = UnlockMachine::new(UnlockAction::Return);
            machine.advance(phase);

            let effects = machine.on_event(MachineEvent::Duplicate("already processed".into()));
            assert_eq!(machine.phase(), UnlockPhase::Error, "from {phase}");
            assert!(effects.contains(&Effect::Fail(FailReason::DuplicateAction(
                "already processed".to_string()
            ))));
        }
    }

    #[test]
    fn test_malformed_token_fails_with_received_string() {
        let mut machine = UnlockMachine::new(UnlockAction::Rent);
        machine.advance(UnlockPhase::GettingToken);

        let effects = machine.on_event(MachineEvent::Malformed("12AB56".into()));
        assert_eq!(machine.phase(), UnlockPhase::Error);
        assert_eq!(
            effects.last(),
            Some(&Effect::Fail(FailReason::MalformedToken(
                "12AB56".to_string()
            )))
        );
    }

    #[test]
    fn test_events_after_terminal_phase_are_ignored() {
        let mut machine = UnlockMachine::new(UnlockAction::Return);
        machine.advance(UnlockPhase::AwaitingConfirmation);
        for _ in 0..4 {
            machine.on_event(MachineEvent::CommandAck);
        }
        assert_eq!(machine.phase(), UnlockPhase::Success);

        assert!(machine
            .on_event(MachineEvent::Duplicate("late".into()))
            .is_empty());
        assert_eq!(machine.phase(), UnlockPhase::Success);
    }
}
