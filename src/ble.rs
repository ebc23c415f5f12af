use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral},
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::{collections::HashMap, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, UdryError},
    protocol::frame_bytes,
    types::MachineInfo,
    SCAN_WINDOW, UTEK_CHARACTERISTIC_UUID, UTEK_SERVICE_UUID,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream of inbound text frames from a connected machine
///
/// The channel closes when the underlying notification stream ends, which
/// is how an unexpected disconnect reaches the protocol driver.
pub type FrameReceiver = mpsc::UnboundedReceiver<String>;

/// Transport contract between the unlock engine and a physical machine
///
/// Two discovery modes hang off this: [`MachineLink::find_machine`] plays
/// the role of an OS device picker (single device returned directly by
/// advertised name), while [`MachineLink::scan`] surfaces a bounded result
/// list for manual selection on platforms without picker support.
#[async_trait]
pub trait MachineLink: Send + Sync {
    /// Bring up the Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::BluetoothUnavailable`] when no adapter is
    /// present or Bluetooth is disabled, so the caller can prompt the user
    /// instead of reporting a protocol failure.
    async fn initialize(&self) -> Result<()>;

    /// Scan for stall machines for at most `window`, then stop.
    ///
    /// The scan always self-terminates; it never runs unbounded waiting
    /// for an explicit cancel.
    ///
    /// # Errors
    ///
    /// Returns BLE stack errors from the platform adapter.
    async fn scan(&self, window: Duration) -> Result<Vec<MachineInfo>>;

    /// Connect to a discovered machine and subscribe to its notification
    /// characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::ConnectionFailed`] on GATT failures or when
    /// the machine does not expose the expected service.
    async fn connect(&self, machine: &MachineInfo) -> Result<FrameReceiver>;

    /// Write one ASCII frame to the machine's command characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::Disconnected`] when no machine is connected.
    async fn send_frame(&self, frame: &str) -> Result<()>;

    /// Tear down the active connection, if any.
    ///
    /// # Errors
    ///
    /// Returns BLE stack errors from the platform adapter.
    async fn disconnect(&self) -> Result<()>;

    /// Picker-mode discovery: scan and return the machine advertising
    /// `bt_name` directly.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::MachineNotFound`] when no machine with that
    /// name appears within the scan window.
    async fn find_machine(&self, bt_name: &str, window: Duration) -> Result<MachineInfo> {
        let machines = self.scan(window).await?;
        machines
            .into_iter()
            .find(|machine| machine.name.as_deref() == Some(bt_name))
            .ok_or_else(|| UdryError::MachineNotFound(bt_name.to_string()))
    }
}

struct ActiveMachine {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

/// btleplug-backed transport for the stall machines' single-characteristic
/// GATT service
pub struct BleMachineLink {
    adapter: Mutex<Option<Adapter>>,
    discovered: Mutex<HashMap<String, Peripheral>>,
    active: Mutex<Option<ActiveMachine>>,
}

impl BleMachineLink {
    /// Create an uninitialized link; call
    /// [`initialize`](MachineLink::initialize) before use
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapter: Mutex::new(None),
            discovered: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    fn service_uuid() -> Result<Uuid> {
        Uuid::parse_str(UTEK_SERVICE_UUID)
            .map_err(|e| UdryError::ConnectionFailed(format!("invalid service UUID: {e}")))
    }

    fn characteristic_uuid() -> Result<Uuid> {
        Uuid::parse_str(UTEK_CHARACTERISTIC_UUID)
            .map_err(|e| UdryError::ConnectionFailed(format!("invalid characteristic UUID: {e}")))
    }
}

impl Default for BleMachineLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineLink for BleMachineLink {
    async fn initialize(&self) -> Result<()> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                UdryError::BluetoothUnavailable(
                    "no Bluetooth adapters found; Bluetooth may be disabled".to_string(),
                )
            })?;

        *self.adapter.lock().await = Some(adapter);
        Ok(())
    }

    async fn scan(&self, window: Duration) -> Result<Vec<MachineInfo>> {
        let guard = self.adapter.lock().await;
        let adapter = guard.as_ref().ok_or_else(|| {
            UdryError::BluetoothUnavailable("adapter not initialized".to_string())
        })?;

        let service_uuid = Self::service_uuid()?;
        let window = window.min(SCAN_WINDOW);

        info!("Scanning for stall machines ({}s window)", window.as_secs());
        adapter
            .start_scan(ScanFilter {
                services: vec![service_uuid],
            })
            .await?;
        tokio::time::sleep(window).await;
        adapter.stop_scan().await?;

        let mut machines = Vec::new();
        let mut discovered = self.discovered.lock().await;
        for peripheral in adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let device_id = peripheral.id().to_string();
            let info = MachineInfo {
                device_id: device_id.clone(),
                name: properties.local_name,
                rssi: properties.rssi.unwrap_or(0),
            };
            debug!(device_id = %info.device_id, name = ?info.name, "Discovered machine");
            discovered.insert(device_id, peripheral);
            machines.push(info);
        }

        info!("Scan completed. Found {} machine(s)", machines.len());
        Ok(machines)
    }

    async fn connect(&self, machine: &MachineInfo) -> Result<FrameReceiver> {
        let peripheral = self
            .discovered
            .lock()
            .await
            .get(&machine.device_id)
            .cloned()
            .ok_or_else(|| {
                UdryError::MachineNotFound(machine.name.clone().unwrap_or_default())
            })?;

        timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| UdryError::ConnectionFailed("connection timed out".to_string()))?
            .map_err(|e| UdryError::ConnectionFailed(e.to_string()))?;

        peripheral.discover_services().await?;

        let service_uuid = Self::service_uuid()?;
        let characteristic_uuid = Self::characteristic_uuid()?;
        let characteristic = peripheral
            .services()
            .iter()
            .find(|s| s.uuid == service_uuid)
            .and_then(|s| {
                s.characteristics
                    .iter()
                    .find(|c| c.uuid == characteristic_uuid)
                    .cloned()
            })
            .ok_or_else(|| {
                UdryError::ConnectionFailed(
                    "machine does not expose the stall service characteristic".to_string(),
                )
            })?;

        peripheral.subscribe(&characteristic).await?;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let mut notifications = peripheral.notifications().await?;
        let notify_uuid = characteristic.uuid;
        tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                if data.uuid != notify_uuid {
                    continue;
                }
                let frame = String::from_utf8_lossy(&data.value).into_owned();
                if frame_tx.send(frame).is_err() {
                    break;
                }
            }
            // Sender drops here; the receiver side observes the closed
            // channel as a disconnect.
            debug!("Notification stream ended");
        });

        info!(device_id = %machine.device_id, "Connected to machine");
        *self.active.lock().await = Some(ActiveMachine {
            peripheral,
            characteristic,
        });

        Ok(frame_rx)
    }

    async fn send_frame(&self, frame: &str) -> Result<()> {
        let guard = self.active.lock().await;
        let Some(active) = guard.as_ref() else {
            return Err(UdryError::Disconnected);
        };

        debug!(frame = %frame.trim_end(), "Writing frame");
        active
            .peripheral
            .write(
                &active.characteristic,
                &frame_bytes(frame),
                WriteType::WithoutResponse,
            )
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(active) = self.active.lock().await.take() {
            if let Err(e) = active.peripheral.disconnect().await {
                warn!("Disconnect failed: {e}");
            }
        }
        Ok(())
    }
}
