//! BlueZ GATT peripheral
//!
//! Registers one primary service with a read/notify TX characteristic and
//! a write RX characteristic, then advertises under the configured name.
//! BlueZ does not hand the application a connection object, so connects and
//! disconnects are detected by polling the adapter's device list.
//!
//! # Requirements
//!
//! Enable the `ble` feature in Cargo.toml to use this link.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use async_trait::async_trait;
use bluer::adv::{Advertisement, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, Service,
};
use bluer::{Adapter, Address};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::{NotifyGate, PeerInfo, PeripheralLink};
use crate::config::PeripheralConfig;
use crate::error::{LinkError, Result};

/// Pending notifications between the bridge and the BlueZ notifier
const NOTIFY_QUEUE: usize = 64;

/// Pending peer writes
const WRITE_QUEUE: usize = 64;

/// BlueZ-backed [`PeripheralLink`]
pub struct BluerPeripheral {
    config: PeripheralConfig,
    adapter: Adapter,
    _app: ApplicationHandle,
    notify_tx: mpsc::Sender<(u64, Vec<u8>)>,
    gate: Arc<NotifyGate>,
    last_value: Arc<Mutex<Vec<u8>>>,
    writes: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    peer: Mutex<Option<Address>>,
}

impl BluerPeripheral {
    /// Open the default adapter and register the GATT application
    pub async fn new(config: PeripheralConfig) -> Result<Self> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;

        if !adapter.is_powered().await? {
            info!(adapter = %adapter.name(), "Powering on Bluetooth adapter");
            adapter.set_powered(true).await?;
        }
        adapter.set_alias(config.device_name.clone()).await?;

        let (notify_tx, notify_rx) = mpsc::channel::<(u64, Vec<u8>)>(NOTIFY_QUEUE);
        let gate = NotifyGate::new();
        let notify_rx = Arc::new(tokio::sync::Mutex::new(notify_rx));
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);
        let last_value = Arc::new(Mutex::new(Vec::new()));

        let tx_char = {
            let last_value = last_value.clone();
            let gate = gate.clone();
            Characteristic {
                uuid: config.tx_uuid,
                read: Some(CharacteristicRead {
                    read: true,
                    fun: Box::new(move |_req: CharacteristicReadRequest| {
                        let value = last_value.lock().clone();
                        Box::pin(async move { Ok(value) })
                    }),
                    ..Default::default()
                }),
                notify: Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                        let notify_rx = notify_rx.clone();
                        let gate = gate.clone();
                        Box::pin(async move {
                            let _session = gate.subscribe();
                            debug!("Peer subscribed to notifications");
                            loop {
                                let item = {
                                    let mut rx = notify_rx.lock().await;
                                    tokio::select! {
                                        _ = notifier.stopped() => None,
                                        item = rx.recv() => item,
                                    }
                                };
                                let Some((epoch, data)) = item else { break };
                                if !gate.is_current(epoch) {
                                    debug!(bytes = data.len(), "Dropped notification from previous connection");
                                    continue;
                                }
                                if let Err(e) = notifier.notify(data).await {
                                    debug!(error = %e, "Notification session ended");
                                    break;
                                }
                            }
                        })
                    })),
                    ..Default::default()
                }),
                ..Default::default()
            }
        };

        let rx_char = Characteristic {
            uuid: config.rx_uuid,
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |value: Vec<u8>, _req: CharacteristicWriteRequest| {
                        let write_tx = write_tx.clone();
                        Box::pin(async move {
                            if write_tx.send(value).await.is_err() {
                                debug!("Peer write dropped, link closed");
                            }
                            Ok(())
                        })
                    },
                )),
                ..Default::default()
            }),
            ..Default::default()
        };

        let app = Application {
            services: vec![Service {
                uuid: config.service_uuid,
                primary: true,
                characteristics: vec![tx_char, rx_char],
                ..Default::default()
            }],
            ..Default::default()
        };
        let app_handle = adapter.serve_gatt_application(app).await?;

        info!(
            name = %config.device_name,
            service = %config.service_uuid,
            "GATT service registered"
        );

        Ok(Self {
            config,
            adapter,
            _app: app_handle,
            notify_tx,
            gate,
            last_value,
            writes: tokio::sync::Mutex::new(write_rx),
            peer: Mutex::new(None),
        })
    }

    async fn find_connected(&self) -> Result<Option<PeerInfo>> {
        for address in self.adapter.device_addresses().await? {
            let Ok(device) = self.adapter.device(address) else {
                continue;
            };
            if device.is_connected().await.unwrap_or(false) {
                *self.peer.lock() = Some(address);
                let mut peer = PeerInfo::new(address.to_string());
                if let Ok(Some(name)) = device.name().await {
                    peer = peer.with_name(name);
                }
                return Ok(Some(peer));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PeripheralLink for BluerPeripheral {
    async fn advertise(&self) -> Result<PeerInfo> {
        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: [self.config.service_uuid].into_iter().collect(),
            local_name: Some(self.config.device_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };
        let _handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| LinkError::AdvertiseFailed(e.to_string()))?;

        // Advertising stops when the handle drops
        loop {
            if let Some(peer) = self.find_connected().await? {
                return Ok(peer);
            }
            tokio::time::sleep(self.config.advertise_interval).await;
        }
    }

    async fn is_connected(&self) -> Result<bool> {
        let Some(address) = *self.peer.lock() else {
            return Ok(false);
        };
        let connected = match self.adapter.device(address) {
            Ok(device) => device.is_connected().await,
            Err(e) => Err(e),
        };
        match connected {
            Ok(connected) => Ok(connected),
            // Device object already removed by BlueZ
            Err(e) if matches!(e.kind, bluer::ErrorKind::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn notify(&self, data: &[u8]) -> Result<()> {
        if self.peer.lock().is_none() {
            return Err(LinkError::NotConnected);
        }
        *self.last_value.lock() = data.to_vec();
        if !self.gate.is_open() {
            return Err(LinkError::NotifyFailed("peer not subscribed".into()));
        }
        self.notify_tx
            .try_send((self.gate.stamp(), data.to_vec())).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::NotifyFailed("notification queue full".into()),
            TrySendError::Closed(_) => LinkError::NotifyFailed("notifier closed".into()),
        })
    }

    async fn written(&self, wait: Duration) -> Result<Option<Bytes>> {
        if self.peer.lock().is_none() {
            return Err(LinkError::NotConnected);
        }
        let mut writes = self.writes.lock().await;
        match tokio::time::timeout(wait, writes.recv()).await {
            Ok(Some(value)) => Ok(Some(Bytes::from(value))),
            Ok(None) => Err(LinkError::Radio("write channel closed".into())),
            Err(_) => Ok(None),
        }
    }

    async fn release(&self) -> Result<()> {
        let address = self.peer.lock().take();
        self.gate.advance();
        if let Some(address) = address {
            if let Ok(device) = self.adapter.device(address) {
                if device.is_connected().await.unwrap_or(false) {
                    if let Err(e) = device.disconnect().await {
                        warn!(peer = %address, error = %e, "Failed to drop peer");
                    }
                }
            }
        }

        let mut writes = self.writes.lock().await;
        while writes.try_recv().is_ok() {}
        self.last_value.lock().clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.device_name
    }
}
