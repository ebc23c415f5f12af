use crate::{
    ble::MachineLink,
    error::{Result, UdryError},
    protocol::{
        command_frame, parse_frame, Effect, MachineEvent, UnlockAction, UnlockMachine,
        UnlockPhase, TOKEN_REQUEST_FRAME,
    },
    signing::{CommandSigner, SignRequest},
    types::{LogKind, MachineInfo, RentalLog, Stall},
    CONFIRMATION_TIMEOUT, SCAN_WINDOW,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, info, warn};

/// Timing knobs for the unlock engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on any BLE scan; scans always self-terminate
    pub scan_window: Duration,
    /// How long the return flow waits for the counted confirmation
    pub confirmation_timeout: Duration,
    /// Pause between GATT connect and the first write; the machine drops
    /// frames written immediately after connection
    pub settle_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_window: SCAN_WINDOW,
            confirmation_timeout: CONFIRMATION_TIMEOUT,
            settle_delay: Duration::from_millis(300),
        }
    }
}

/// How the target machine is chosen
#[derive(Debug, Clone)]
pub enum Discovery {
    /// Scan and match the stall's advertised name directly, standing in
    /// for platforms with a native device picker
    Picker,
    /// The user already chose this machine from a scan-result list
    Selected(MachineInfo),
}

/// Outcome of a successful unlock attempt
#[derive(Debug, Clone)]
pub struct UnlockReport {
    /// The machine the protocol ran against
    pub machine: MachineInfo,
    /// Diagnostic trail collected during the attempt; for a rent this
    /// seeds the new session's logs, for a return it is appended to the
    /// existing session
    pub logs: Vec<RentalLog>,
}

/// Handle for cancelling an in-flight unlock attempt from the UI layer
///
/// Cancellation tears down the BLE connection and clears any pending
/// confirmation timer; nothing is left to fire after the surrounding
/// screen is gone.
#[derive(Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel the attempt. Safe to call more than once.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Client-side driver for the machine unlock handshake
///
/// Runs the token-exchange / command-send / confirmation-wait sequence for
/// both the rent and return flows. The transport, the signing service, and
/// the clock-sensitive timeouts are all injected, so the full protocol is
/// exercisable in tests without a BLE stack.
pub struct UnlockEngine<L, S> {
    link: Arc<L>,
    signer: Arc<S>,
    config: EngineConfig,
    cancel_tx: watch::Sender<bool>,
    logs: Vec<RentalLog>,
}

impl<L: MachineLink, S: CommandSigner> UnlockEngine<L, S> {
    /// Create an engine with default timing
    #[must_use]
    pub fn new(link: Arc<L>, signer: Arc<S>) -> Self {
        Self::with_config(link, signer, EngineConfig::default())
    }

    /// Create an engine with explicit timing
    #[must_use]
    pub fn with_config(link: Arc<L>, signer: Arc<S>, config: EngineConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            link,
            signer,
            config,
            cancel_tx,
            logs: Vec::new(),
        }
    }

    /// Handle the UI layer can use to abort the attempt on teardown
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Discover machines for manual selection (platforms without a native
    /// device picker).
    ///
    /// # Errors
    ///
    /// Returns adapter initialization or scan errors.
    pub async fn scan_for_machines(&self) -> Result<Vec<MachineInfo>> {
        self.link.initialize().await?;
        self.link.scan(self.config.scan_window).await
    }

    /// Harvest the diagnostic trail of a failed attempt.
    ///
    /// Successful attempts carry their logs in the [`UnlockReport`]; after
    /// an error the caller collects them here so the audit trail survives
    /// failure paths too.
    pub fn drain_logs(&mut self) -> Vec<RentalLog> {
        std::mem::take(&mut self.logs)
    }

    /// Run the full unlock protocol against `stall` for one action.
    ///
    /// Terminal for the attempt only: on error the caller may retry from
    /// the stall-identified step, re-running the protocol from scratch.
    ///
    /// # Errors
    ///
    /// See the [`crate::UdryError`] taxonomy; every error path appends a
    /// diagnostic log entry before surfacing.
    pub async fn unlock(
        &mut self,
        stall: &Stall,
        action: UnlockAction,
        discovery: Discovery,
    ) -> Result<UnlockReport> {
        self.cancel_tx.send_replace(false);
        self.logs.clear();
        self.log(
            LogKind::Info,
            format!("User initiated {action}. Starting Bluetooth connection..."),
        );

        let outcome = self.drive(stall, action, discovery).await;

        // Always release the connection, on success, error, and cancel
        // alike; a leaked GATT connection blocks the next attempt.
        if let Err(e) = self.link.disconnect().await {
            warn!("Teardown disconnect failed: {e}");
        }

        match outcome {
            Ok(machine) => Ok(UnlockReport {
                machine,
                logs: std::mem::take(&mut self.logs),
            }),
            Err(e) => {
                if !e.is_user_cancel() {
                    warn!("Unlock attempt failed: {e}");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        stall: &Stall,
        action: UnlockAction,
        discovery: Discovery,
    ) -> Result<MachineInfo> {
        let link = Arc::clone(&self.link);
        let signer = Arc::clone(&self.signer);
        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut state = UnlockMachine::new(action);

        state.advance(UnlockPhase::Initializing);
        if let Err(e) = link.initialize().await {
            self.log(LogKind::Error, format!("Bluetooth Connection Error: {e}"));
            return Err(e);
        }

        let machine = match discovery {
            Discovery::Selected(machine) => machine,
            Discovery::Picker => {
                state.advance(UnlockPhase::RequestingDevice);
                self.log(
                    LogKind::Info,
                    format!("Searching for machine \"{}\"", stall.bt_name),
                );
                match link.find_machine(&stall.bt_name, self.config.scan_window).await {
                    Ok(machine) => machine,
                    Err(e) => {
                        self.log(LogKind::Error, format!("Bluetooth Connection Error: {e}"));
                        return Err(e);
                    }
                }
            }
        };

        state.advance(UnlockPhase::Connecting);
        let mut frames = match link.connect(&machine).await {
            Ok(frames) => frames,
            Err(e) => {
                self.log(LogKind::Error, format!("Bluetooth Connection Error: {e}"));
                return Err(e);
            }
        };
        sleep(self.config.settle_delay).await;
        self.log(
            LogKind::Info,
            format!(
                "Connected to device: {}",
                machine.name.as_deref().unwrap_or("Unknown")
            ),
        );

        state.advance(UnlockPhase::GettingToken);
        if let Err(e) = link.send_frame(TOKEN_REQUEST_FRAME).await {
            self.log(LogKind::Error, format!("Failed to send token request: {e}"));
            return Err(e);
        }
        self.log(LogKind::Sent, "Sent Signal: \"TOK\\r\\n\"");

        let mut confirmation_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    self.log(LogKind::Info, "Unlock attempt cancelled by caller");
                    return Err(UdryError::Cancelled);
                }
                () = wait_for_deadline(confirmation_deadline) => {
                    let error = UdryError::ConfirmationTimeout {
                        timeout_ms: u64::try_from(
                            self.config.confirmation_timeout.as_millis(),
                        )
                        .unwrap_or(u64::MAX),
                    };
                    self.log(LogKind::Error, error.to_string());
                    return Err(error);
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        // The notification channel closed under us; the
                        // connection dropped mid-protocol. This is not a
                        // successful cancellation.
                        self.log(
                            LogKind::Error,
                            "Bluetooth connection lost during the unlock protocol",
                        );
                        return Err(UdryError::Disconnected);
                    };
                    self.log(
                        LogKind::Received,
                        format!("Received Signal: \"{}\"", frame.trim()),
                    );
                    let Some(event) = parse_frame(&frame) else {
                        debug!(frame = %frame.trim(), "Ignoring unrelated frame");
                        continue;
                    };

                    let was_ack = matches!(event, MachineEvent::CommandAck);
                    let effects = state.on_event(event);
                    if was_ack && action.required_acks() > 0 && state.acks() > 0 {
                        self.log(
                            LogKind::Info,
                            format!("CMD:OK count is now {}", state.acks()),
                        );
                    }

                    for effect in effects {
                        match effect {
                            Effect::CancelConfirmationTimer => {
                                confirmation_deadline = None;
                            }
                            Effect::RequestSignedCommand { token } => {
                                let request = SignRequest {
                                    dvid: stall.dvid.clone(),
                                    token,
                                    parm: action.parm(stall.next_action_slot),
                                    action,
                                };
                                self.log(
                                    LogKind::Info,
                                    format!(
                                        "Requesting signed command (dvid: {}, parm: {})",
                                        request.dvid, request.parm
                                    ),
                                );
                                let signed = match signer.sign(&request).await {
                                    Ok(signed) => signed,
                                    Err(e) => {
                                        self.log(
                                            LogKind::Error,
                                            format!("Failed to get {action} command: {e}"),
                                        );
                                        state.advance(UnlockPhase::Error);
                                        return Err(e);
                                    }
                                };

                                state.advance(UnlockPhase::SendingCommand);
                                let command = command_frame(&signed);
                                if let Err(e) = link.send_frame(&command).await {
                                    self.log(
                                        LogKind::Error,
                                        format!("Failed to send {action} command: {e}"),
                                    );
                                    return Err(e);
                                }
                                self.log(
                                    LogKind::Sent,
                                    format!("Sent Command: \"{}\" ({action})", command.trim()),
                                );

                                if action.required_acks() == 0 {
                                    // Rent success is implicit in the write;
                                    // the machine dispenses without a counted
                                    // acknowledgment wait.
                                    state.advance(UnlockPhase::Success);
                                    self.log(
                                        LogKind::Info,
                                        "Unlock command sent; umbrella dispensing",
                                    );
                                    info!(stall = %stall.dvid, "Rent unlock complete");
                                    return Ok(machine);
                                }

                                state.advance(UnlockPhase::AwaitingConfirmation);
                                confirmation_deadline =
                                    Some(Instant::now() + self.config.confirmation_timeout);
                                self.log(
                                    LogKind::Info,
                                    "Command sent. Awaiting physical return confirmation...",
                                );
                            }
                            Effect::DeclareSuccess => {
                                self.log(
                                    LogKind::Info,
                                    "Final confirmation received. Return is complete.",
                                );
                                info!(stall = %stall.dvid, "Return confirmed by machine");
                                return Ok(machine);
                            }
                            Effect::Fail(reason) => {
                                let error = reason.into_error();
                                self.log(LogKind::Error, error.to_string());
                                return Err(error);
                            }
                        }
                    }
                }
            }
        }
    }

    fn log(&mut self, kind: LogKind, message: impl Into<String>) {
        let entry = RentalLog::now(kind, message);
        debug!(kind = %entry.kind, "{}", entry.message);
        self.logs.push(entry);
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::FrameReceiver;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn stall() -> Stall {
        Stall {
            dvid: "CMYS234400696".to_string(),
            name: "Central Pier".to_string(),
            bt_name: "UTEK-01".to_string(),
            available_umbrellas: 5,
            total_umbrellas: 10,
            next_action_slot: 7,
            is_deployed: true,
        }
    }

    fn machine() -> MachineInfo {
        MachineInfo {
            device_id: "aa:bb".to_string(),
            name: Some("UTEK-01".to_string()),
            rssi: -50,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            scan_window: Duration::from_millis(10),
            confirmation_timeout: Duration::from_millis(100),
            settle_delay: Duration::ZERO,
        }
    }

    struct FakeLink {
        replies_to_token_request: Vec<String>,
        replies_to_command: Vec<String>,
        drop_after_token_request: bool,
        sent: Mutex<Vec<String>>,
        tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    }

    impl FakeLink {
        fn new(token_replies: &[&str], command_replies: &[&str]) -> Self {
            Self {
                replies_to_token_request: token_replies.iter().map(ToString::to_string).collect(),
                replies_to_command: command_replies.iter().map(ToString::to_string).collect(),
                drop_after_token_request: false,
                sent: Mutex::new(Vec::new()),
                tx: Mutex::new(None),
            }
        }

        fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MachineLink for FakeLink {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn scan(&self, _window: Duration) -> Result<Vec<MachineInfo>> {
            Ok(vec![machine()])
        }

        async fn connect(&self, _machine: &MachineInfo) -> Result<FrameReceiver> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.tx.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn send_frame(&self, frame: &str) -> Result<()> {
            self.sent.lock().unwrap().push(frame.to_string());
            let guard = self.tx.lock().unwrap();
            if frame == TOKEN_REQUEST_FRAME {
                if self.drop_after_token_request {
                    drop(guard);
                    self.tx.lock().unwrap().take();
                    return Ok(());
                }
                if let Some(tx) = guard.as_ref() {
                    for reply in &self.replies_to_token_request {
                        let _ = tx.send(reply.clone());
                    }
                }
            } else if frame.starts_with("CMD:") {
                if let Some(tx) = guard.as_ref() {
                    for reply in &self.replies_to_command {
                        let _ = tx.send(reply.clone());
                    }
                }
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.tx.lock().unwrap().take();
            Ok(())
        }
    }

    struct FakeSigner {
        requests: Mutex<Vec<SignRequest>>,
        fail: bool,
    }

    impl FakeSigner {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl CommandSigner for FakeSigner {
        async fn sign(&self, request: &SignRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(UdryError::SigningFailed(
                    "Machine API Error: token expired (Code: 1011)".to_string(),
                ));
            }
            Ok("8F2A11C4".to_string())
        }
    }

    fn engine(link: Arc<FakeLink>, signer: Arc<FakeSigner>) -> UnlockEngine<FakeLink, FakeSigner> {
        UnlockEngine::with_config(link, signer, fast_config())
    }

    #[tokio::test]
    async fn test_rent_succeeds_after_command_write() {
        let link = Arc::new(FakeLink::new(&["TOK:123456\r\n"], &[]));
        let signer = Arc::new(FakeSigner::new());
        let mut engine = engine(Arc::clone(&link), Arc::clone(&signer));

        let report = engine
            .unlock(&stall(), UnlockAction::Rent, Discovery::Selected(machine()))
            .await
            .unwrap();

        assert_eq!(
            link.sent_frames(),
            vec!["TOK\r\n".to_string(), "CMD:8F2A11C4\r\n".to_string()]
        );
        assert!(report
            .logs
            .iter()
            .any(|l| l.kind == LogKind::Sent && l.message.contains("CMD:8F2A11C4")));

        let requests = signer.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].token, "123");
        assert_eq!(requests[0].parm, "1000007");
        assert_eq!(requests[0].action, UnlockAction::Rent);
    }

    #[tokio::test]
    async fn test_return_waits_for_four_acks() {
        let link = Arc::new(FakeLink::new(
            &["TOK:123456\r\n"],
            &["CMD:OK", "CMD:OK", "CMD:OK", "CMD:OK"],
        ));
        let signer = Arc::new(FakeSigner::new());
        let mut engine = engine(Arc::clone(&link), signer);

        let report = engine
            .unlock(
                &stall(),
                UnlockAction::Return,
                Discovery::Selected(machine()),
            )
            .await
            .unwrap();

        assert!(report
            .logs
            .iter()
            .any(|l| l.message.contains("CMD:OK count is now 4")));
        assert!(report
            .logs
            .iter()
            .any(|l| l.message.contains("Return is complete")));
    }

    #[tokio::test]
    async fn test_return_times_out_short_of_four_acks() {
        let link = Arc::new(FakeLink::new(
            &["TOK:123456\r\n"],
            &["CMD:OK", "CMD:OK", "CMD:OK"],
        ));
        let signer = Arc::new(FakeSigner::new());
        let mut engine = engine(link, signer);

        let error = engine
            .unlock(
                &stall(),
                UnlockAction::Return,
                Discovery::Selected(machine()),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, UdryError::ConfirmationTimeout { .. }));
        let logs = engine.drain_logs();
        assert!(logs
            .iter()
            .any(|l| l.kind == LogKind::Error && l.message.contains("still active")));
    }

    #[tokio::test]
    async fn test_repet_rejection_is_fatal_and_distinct() {
        let link = Arc::new(FakeLink::new(&["REPET:already processed"], &[]));
        let signer = Arc::new(FakeSigner::new());
        let mut engine = engine(link, signer);

        let error = engine
            .unlock(&stall(), UnlockAction::Rent, Discovery::Selected(machine()))
            .await
            .unwrap_err();

        assert!(matches!(error, UdryError::DuplicateAction(_)));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_token_surfaces_received_string() {
        let link = Arc::new(FakeLink::new(&["TOK:12AB56"], &[]));
        let signer = Arc::new(FakeSigner::new());
        let mut engine = engine(link, signer);

        let error = engine
            .unlock(&stall(), UnlockAction::Rent, Discovery::Selected(machine()))
            .await
            .unwrap_err();

        assert!(format!("{error}").contains("\"12AB56\""));
        let logs = engine.drain_logs();
        assert!(logs.iter().any(|l| l.kind == LogKind::Error));
    }

    #[tokio::test]
    async fn test_signing_failure_propagates_vendor_message() {
        let link = Arc::new(FakeLink::new(&["TOK:123456"], &[]));
        let signer = Arc::new(FakeSigner::failing());
        let mut engine = engine(link, signer);

        let error = engine
            .unlock(&stall(), UnlockAction::Rent, Discovery::Selected(machine()))
            .await
            .unwrap_err();

        assert!(format!("{error}").contains("token expired"));
    }

    #[tokio::test]
    async fn test_mid_protocol_disconnect_is_not_success() {
        let mut link = FakeLink::new(&[], &[]);
        link.drop_after_token_request = true;
        let link = Arc::new(link);
        let signer = Arc::new(FakeSigner::new());
        let mut engine = engine(link, signer);

        let error = engine
            .unlock(
                &stall(),
                UnlockAction::Return,
                Discovery::Selected(machine()),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, UdryError::Disconnected));
        assert!(error.is_connection_error());
        assert!(!error.is_user_cancel());
    }

    #[tokio::test]
    async fn test_cancel_aborts_and_disconnects() {
        // No replies at all: the engine would wait on the token forever.
        let link = Arc::new(FakeLink::new(&[], &[]));
        let signer = Arc::new(FakeSigner::new());
        let mut engine = engine(Arc::clone(&link), signer);
        let handle = engine.cancel_handle();

        let task = tokio::spawn(async move {
            let target = stall();
            engine
                .unlock(&target, UnlockAction::Return, Discovery::Selected(machine()))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let error = task.await.unwrap().unwrap_err();
        assert!(matches!(error, UdryError::Cancelled));
        assert!(error.is_user_cancel());
        // Teardown released the connection.
        assert!(link.tx.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_picker_discovery_matches_stall_bt_name() {
        let link = Arc::new(FakeLink::new(&["TOK:123456"], &[]));
        let signer = Arc::new(FakeSigner::new());
        let mut engine = engine(link, signer);

        let report = engine
            .unlock(&stall(), UnlockAction::Rent, Discovery::Picker)
            .await
            .unwrap();
        assert_eq!(report.machine.name.as_deref(), Some("UTEK-01"));
    }
}
