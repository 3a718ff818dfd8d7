//! Direct BLE link through BlueZ.
//!
//! The probe exposes the Nordic UART Service: the host writes configuration packages to
//! the RX characteristic and receives frame fragments as notifications on TX. A small
//! task forwards notifications into a bounded channel; `receive` pulls from that channel
//! through a [`NotificationPipe`] on the worker thread, so assembler state is never
//! shared.

use std::collections::BTreeSet;
use std::time::Duration;

use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Service};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DiscoveryFilter, DiscoveryTransport, Session, Uuid,
};
use futures::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::codec::AcquisitionFrame;
use crate::config::ConnectionConfig;
use crate::device::DeviceDescriptor;
use crate::errors::{BluetoothError, DriverError, Result};
use crate::transport::{NotificationPipe, Transport};

pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
/// Host -> probe (write without response).
pub const NUS_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
/// Probe -> host (notify).
pub const NUS_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

const SERVICE_RESOLVE_POLL: Duration = Duration::from_millis(100);

/// An established GATT link.
struct BleLink {
    device: Device,
    rx: Characteristic,
    pipe: NotificationPipe,
    forwarder: JoinHandle<()>,
}

pub struct BleTransport {
    scan_duration: Duration,
    connect_timeout: Duration,
    queue_depth: usize,
    _session: Option<Session>,
    adapter: Option<Adapter>,
    link: Option<BleLink>,
}

impl BleTransport {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            scan_duration: config.scan_duration,
            connect_timeout: config.connect_timeout,
            queue_depth: config.notification_queue_depth.max(1),
            _session: None,
            adapter: None,
            link: None,
        }
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let session = Session::new().await?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| BluetoothError::NoAdapter(e.to_string()))?;
        adapter.set_powered(true).await?;
        debug!("using bluetooth adapter {}", adapter.name());

        self._session = Some(session);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn scan(&self, adapter: &Adapter) -> Result<BTreeSet<Address>> {
        let filter = DiscoveryFilter {
            uuids: [NUS_SERVICE_UUID].into_iter().collect(),
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("could not set discovery filter, scanning unfiltered: {}", e);
        }

        let events = adapter.discover_devices().await?;
        futures::pin_mut!(events);
        let deadline = tokio::time::sleep(self.scan_duration);
        tokio::pin!(deadline);

        let mut seen = BTreeSet::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                evt = events.next() => match evt {
                    Some(AdapterEvent::DeviceAdded(addr)) => {
                        trace!("advertisement from {}", addr);
                        seen.insert(addr);
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        Ok(seen)
    }

    async fn connect_link(&self, device: Device) -> Result<BleLink> {
        if !device.is_connected().await? {
            device.connect().await?;
        }
        while !device.is_services_resolved().await? {
            tokio::time::sleep(SERVICE_RESOLVE_POLL).await;
        }

        let service = find_service(&device, NUS_SERVICE_UUID).await?;
        let tx = find_characteristic(&service, NUS_TX_CHAR_UUID).await?;
        let rx = find_characteristic(&service, NUS_RX_CHAR_UUID).await?;

        let notifications = tx.notify().await?;
        let (sender, pipe) = NotificationPipe::channel(self.queue_depth);
        let forwarder = tokio::spawn(forward_notifications(notifications, sender));

        Ok(BleLink {
            device,
            rx,
            pipe,
            forwarder,
        })
    }
}

impl Transport for BleTransport {
    async fn discover(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let adapter = self.adapter().await?;
        let seen = self.scan(&adapter).await?;

        let mut devices = Vec::new();
        for addr in seen {
            let device = adapter.device(addr)?;
            let advertises_nus = match device.uuids().await {
                Ok(uuids) => uuids.unwrap_or_default().contains(&NUS_SERVICE_UUID),
                Err(e) => {
                    debug!("skipping {}: {}", addr, e);
                    false
                }
            };
            if !advertises_nus {
                continue;
            }
            let name = device.name().await.ok().flatten();
            devices.push(DeviceDescriptor::from_ble(name, addr));
        }
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        debug!("ble discovery: {} probes found", devices.len());
        Ok(devices)
    }

    async fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        let address = descriptor.ble_address().ok_or_else(|| {
            BluetoothError::WrongHandle(descriptor.name().to_string())
        })?;
        let adapter = self.adapter().await?;
        let device = adapter.device(address)?;

        info!("connecting to probe: mac={}", address);
        let result = tokio::time::timeout(self.connect_timeout, self.connect_link(device.clone()))
            .await
            .map_err(|_| DriverError::Timeout("ble connect timed out".into()))
            .and_then(|r| r);

        match result {
            Ok(link) => {
                self.link = Some(link);
                info!("probe connected: mac={}", address);
                Ok(())
            }
            Err(e) => {
                warn!("probe connection failed: mac={}, error={}", address, e);
                if let Err(de) = device.disconnect().await {
                    debug!("disconnect after failed open: {}", de);
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        link.forwarder.abort();
        debug!(
            "link stats: {:?}, {} stale frames skipped",
            link.pipe.assembler_stats(),
            link.pipe.superseded_frames()
        );
        if link.device.is_connected().await.unwrap_or(false) {
            link.device.disconnect().await?;
        }
        info!("probe disconnected: mac={}", link.device.address());
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let link = self.link.as_mut().ok_or_else(|| {
            BluetoothError::NotConnected("no probe connected".into())
        })?;
        if !link.device.is_connected().await.unwrap_or(false) {
            return Err(BluetoothError::NotConnected("probe went away".into()).into());
        }

        // Fragments of frames from the previous configuration are worthless now.
        let stale = link.pipe.discard_pending();

        let request = CharacteristicWriteRequest {
            op_type: WriteOp::Command,
            ..Default::default()
        };
        link.rx.write_ext(payload, &request).await?;
        debug!(
            "config sent: {} bytes ({} queued notifications dropped)",
            payload.len(),
            stale
        );
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<AcquisitionFrame>> {
        let link = self.link.as_mut().ok_or_else(|| {
            BluetoothError::NotConnected("no probe connected".into())
        })?;
        link.pipe.next_frame().await
    }
}

async fn find_service(device: &Device, uuid: Uuid) -> Result<Service> {
    for service in device.services().await? {
        if service.uuid().await? == uuid {
            return Ok(service);
        }
    }
    Err(BluetoothError::ServiceNotFound {
        uuid: uuid.to_string(),
    }
    .into())
}

async fn find_characteristic(service: &Service, uuid: Uuid) -> Result<Characteristic> {
    for characteristic in service.characteristics().await? {
        if characteristic.uuid().await? == uuid {
            return Ok(characteristic);
        }
    }
    Err(BluetoothError::CharacteristicNotFound {
        uuid: uuid.to_string(),
    }
    .into())
}

/// Push notifications into the worker's queue. A full queue drops the packet; the
/// assembler discards the torn frame and resynchronizes on the next start marker.
async fn forward_notifications<S>(notifications: S, packets: mpsc::Sender<Vec<u8>>)
where
    S: Stream<Item = Vec<u8>> + Send + 'static,
{
    futures::pin_mut!(notifications);
    let mut dropped = 0u64;
    while let Some(packet) = notifications.next().await {
        match packets.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    warn!("notification queue full, {} packets dropped so far", dropped);
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!("notification stream ended");
}
