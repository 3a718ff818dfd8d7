//! Blocking facade over the probe transports.
//!
//! A [`Connection`] owns one worker thread running a current-thread tokio runtime. The
//! worker owns the [`Transport`] and handles one request at a time; public methods post
//! a request with a one-shot reply channel and block until the worker answers. Failures
//! never cross this boundary as errors: they are logged and reported as `false`/`None`.
//!
//! # Example
//! ```ignore
//! let link = Connection::new(TransportKind::Dongle)?;
//! let devices = link.list_available();
//! if link.open(&devices[0]) && link.send_config(&package) {
//!     while let Some(frame) = link.receive_frame() {
//!         println!("acq {} on channel {}", frame.acquisition_number, frame.channel_id);
//!     }
//! }
//! link.close();
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::codec::{AcquisitionFrame, ACQ_LENGTH_SAMPLES};
use crate::config::ConnectionConfig;
use crate::device::DeviceDescriptor;
use crate::errors::{DriverError, Result};
#[cfg(feature = "ble")]
use crate::transport::BleTransport;
use crate::transport::{SerialTransport, Transport, TransportKind};

/// Time allowed for closing the link when the worker stops.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Snapshot of the transport call instrumentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    /// Transport calls issued since the connection was created.
    pub total_calls: u64,
    /// Transport calls running right now.
    pub in_flight: usize,
    /// Highest number of transport calls ever running at once.
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct CallGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicU64,
}

struct CallGuard<'a>(&'a CallGauge);

impl CallGauge {
    fn enter(&self) -> CallGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        CallGuard(self)
    }

    fn snapshot(&self) -> CallStats {
        CallStats {
            total_calls: self.total.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak.load(Ordering::SeqCst),
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Request {
    ListAvailable {
        reply: oneshot::Sender<Vec<DeviceDescriptor>>,
    },
    Open {
        device: DeviceDescriptor,
        reply: oneshot::Sender<bool>,
    },
    Close {
        reply: oneshot::Sender<bool>,
    },
    SendConfig {
        payload: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    ReceiveFrame {
        reply: oneshot::Sender<Option<AcquisitionFrame>>,
    },
}

/// Synchronous handle to a probe link.
pub struct Connection {
    requests: mpsc::UnboundedSender<Request>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<TransportState>,
    gauge: Arc<CallGauge>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Connection {
    /// Connection with default settings for the given backend.
    pub fn new(kind: TransportKind) -> Result<Self> {
        Self::with_config(kind, ConnectionConfig::default())
    }

    pub fn with_config(kind: TransportKind, config: ConnectionConfig) -> Result<Self> {
        info!("creating {} connection", kind);
        match kind {
            TransportKind::Dongle => Self::with_transport(SerialTransport::new(&config), config),
            #[cfg(feature = "ble")]
            TransportKind::Direct => Self::with_transport(BleTransport::new(&config), config),
            #[cfg(not(feature = "ble"))]
            TransportKind::Direct => Err(DriverError::Unsupported(
                "direct connection needs the \"ble\" feature".into(),
            )),
        }
    }

    /// Drive an arbitrary transport. The worker thread is started here.
    pub fn with_transport<T: Transport>(transport: T, config: ConnectionConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DriverError::Runtime(format!("tokio runtime init failed: {e}")))?;

        let (requests, request_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(TransportState::Closed);
        let gauge = Arc::new(CallGauge::default());

        let worker = Worker {
            transport,
            state: state_tx,
            current: None,
            gauge: Arc::clone(&gauge),
            receive_timeout: config.receive_timeout,
            shutdown: shutdown_rx,
        };
        let handle = thread::Builder::new()
            .name("wulpus-link".into())
            .spawn(move || runtime.block_on(worker.run(request_rx)))?;

        Ok(Self {
            requests,
            shutdown,
            state,
            gauge,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Discover devices. Never fails; discovery errors give an empty list.
    pub fn list_available(&self) -> Vec<DeviceDescriptor> {
        self.call(|reply| Request::ListAvailable { reply })
            .unwrap_or_default()
    }

    /// Open the link. `true` immediately if already open on the same device; `false`
    /// if open on another one or if connecting fails.
    pub fn open(&self, device: &DeviceDescriptor) -> bool {
        self.call(|reply| Request::Open {
            device: device.clone(),
            reply,
        })
        .unwrap_or(false)
    }

    /// Close the link. `true` if it is closed afterwards, including when it already was.
    pub fn close(&self) -> bool {
        self.call(|reply| Request::Close { reply })
            .unwrap_or_else(|| self.state() == TransportState::Closed)
    }

    /// Write a configuration package. Any partially received frame is discarded.
    pub fn send_config(&self, payload: &[u8]) -> bool {
        self.call(|reply| Request::SendConfig {
            payload: payload.to_vec(),
            reply,
        })
        .unwrap_or(false)
    }

    /// Block until the next complete frame. `None` on malformed frames, errors,
    /// disconnect, the configured receive timeout, or shutdown.
    pub fn receive_frame(&self) -> Option<AcquisitionFrame> {
        self.call(|reply| Request::ReceiveFrame { reply }).flatten()
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Samples per frame, for sizing acquisition buffers.
    pub fn acq_length(&self) -> usize {
        ACQ_LENGTH_SAMPLES
    }

    pub fn call_stats(&self) -> CallStats {
        self.gauge.snapshot()
    }

    /// Stop the worker. Blocked calls return `false`/`None`; the link is closed and the
    /// worker thread joined. Later calls fail without touching the transport.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("connection worker panicked");
            }
        }
    }

    fn call<R>(&self, request: impl FnOnce(oneshot::Sender<R>) -> Request) -> Option<R> {
        let (reply, response) = oneshot::channel();
        if self.requests.send(request(reply)).is_err() {
            debug!("connection worker is not running");
            return None;
        }
        response.blocking_recv().ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<T: Transport> {
    transport: T,
    state: watch::Sender<TransportState>,
    current: Option<DeviceDescriptor>,
    gauge: Arc<CallGauge>,
    receive_timeout: Option<Duration>,
    shutdown: watch::Receiver<bool>,
}

/// Run one transport call under the gauge, abandoning it if shutdown is requested.
async fn guarded<R>(
    gauge: &CallGauge,
    shutdown: &mut watch::Receiver<bool>,
    op: impl Future<Output = Result<R>>,
) -> Result<R> {
    let _call = gauge.enter();
    tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => Err(DriverError::Shutdown),
        res = op => res,
    }
}

impl<T: Transport> Worker<T> {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        debug!("connection worker started");
        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.handle(request).await;
        }
        requests.close();
        self.teardown().await;
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::ListAvailable { reply } => {
                let devices = self.list_available().await;
                let _ = reply.send(devices);
            }
            Request::Open { device, reply } => {
                let opened = self.open(device).await;
                let _ = reply.send(opened);
            }
            Request::Close { reply } => {
                let closed = self.close().await;
                let _ = reply.send(closed);
            }
            Request::SendConfig { payload, reply } => {
                let sent = self.send_config(&payload).await;
                let _ = reply.send(sent);
            }
            Request::ReceiveFrame { reply } => {
                let frame = self.receive_frame().await;
                let _ = reply.send(frame);
            }
        }
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    fn set_state(&self, state: TransportState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("transport state {:?} -> {:?}", previous, state);
        }
    }

    async fn list_available(&mut self) -> Vec<DeviceDescriptor> {
        match guarded(&self.gauge, &mut self.shutdown, self.transport.discover()).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("device discovery failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn open(&mut self, device: DeviceDescriptor) -> bool {
        match self.state() {
            TransportState::Closed => {}
            TransportState::Open if self.current.as_ref() == Some(&device) => return true,
            TransportState::Open => {
                warn!(
                    "refusing to open {}: already open on {}",
                    device.name(),
                    self.current.as_ref().map_or("?", |d| d.name())
                );
                return false;
            }
            other => {
                warn!("refusing to open {} while {:?}", device.name(), other);
                return false;
            }
        }

        self.set_state(TransportState::Connecting);
        match guarded(&self.gauge, &mut self.shutdown, self.transport.open(&device)).await {
            Ok(()) => {
                info!("link open: device={}", device);
                self.current = Some(device);
                self.set_state(TransportState::Open);
                true
            }
            Err(DriverError::Shutdown) => {
                // Left in Connecting so teardown releases whatever the open set up.
                info!("opening {} interrupted by shutdown", device.name());
                false
            }
            Err(e) => {
                warn!("opening {} failed: {}", device.name(), e);
                self.set_state(TransportState::Closed);
                false
            }
        }
    }

    async fn close(&mut self) -> bool {
        if self.state() == TransportState::Closed {
            return true;
        }

        self.set_state(TransportState::Closing);
        match guarded(&self.gauge, &mut self.shutdown, self.transport.close()).await {
            Ok(()) => {
                info!("link closed");
                self.current = None;
                self.set_state(TransportState::Closed);
                true
            }
            Err(e) => {
                warn!("closing link failed: {}", e);
                self.set_state(TransportState::Open);
                false
            }
        }
    }

    async fn send_config(&mut self, payload: &[u8]) -> bool {
        let state = self.state();
        if state != TransportState::Open {
            debug!("send_config ignored while {:?}", state);
            return false;
        }

        match guarded(&self.gauge, &mut self.shutdown, self.transport.send(payload)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("sending config failed: {}", e);
                if e.is_disconnect() {
                    self.link_lost().await;
                }
                false
            }
        }
    }

    async fn receive_frame(&mut self) -> Option<AcquisitionFrame> {
        let state = self.state();
        if state != TransportState::Open {
            debug!("receive_frame ignored while {:?}", state);
            return None;
        }

        let result = match self.receive_timeout {
            Some(limit) => {
                let transport = &mut self.transport;
                let bounded = async move {
                    tokio::time::timeout(limit, transport.receive())
                        .await
                        .unwrap_or_else(|_| {
                            Err(DriverError::Timeout(format!("no frame within {limit:?}")))
                        })
                };
                guarded(&self.gauge, &mut self.shutdown, bounded).await
            }
            None => guarded(&self.gauge, &mut self.shutdown, self.transport.receive()).await,
        };

        match result {
            Ok(frame) => frame,
            Err(DriverError::Shutdown) => None,
            Err(e @ DriverError::Timeout(_)) => {
                debug!("receive: {}", e);
                None
            }
            Err(e) => {
                warn!("receiving frame failed: {}", e);
                if e.is_disconnect() {
                    self.link_lost().await;
                }
                None
            }
        }
    }

    /// The peer went away underneath us; release the transport and require a reopen.
    async fn link_lost(&mut self) {
        warn!("link lost, marking connection closed");
        if let Err(e) = guarded(&self.gauge, &mut self.shutdown, self.transport.close()).await {
            debug!("cleanup after lost link: {}", e);
        }
        self.current = None;
        self.set_state(TransportState::Closed);
    }

    async fn teardown(&mut self) {
        if self.state() != TransportState::Closed {
            let _call = self.gauge.enter();
            match tokio::time::timeout(TEARDOWN_TIMEOUT, self.transport.close()).await {
                Ok(Ok(())) => info!("link closed on shutdown"),
                Ok(Err(e)) => warn!("closing link on shutdown failed: {}", e),
                Err(_) => warn!("closing link on shutdown timed out"),
            }
        }
        self.current = None;
        self.set_state(TransportState::Closed);
        debug!("connection worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_peak_and_total() {
        let gauge = CallGauge::default();
        {
            let _a = gauge.enter();
            let _b = gauge.enter();
            assert_eq!(gauge.snapshot().in_flight, 2);
        }
        let _c = gauge.enter();
        let stats = gauge.snapshot();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.peak_in_flight, 2);
    }

    #[test]
    fn serial_connection_starts_closed_and_stops_cleanly() {
        let link = Connection::new(TransportKind::Dongle).unwrap();
        assert_eq!(link.state(), TransportState::Closed);
        assert_eq!(link.acq_length(), 400);
        assert!(link.close());
        assert!(!link.send_config(&[0x01]));
        assert_eq!(link.receive_frame(), None);
        assert_eq!(link.call_stats().total_calls, 0);

        link.shutdown();
        assert!(link.close());
        assert!(!link.send_config(&[0x01]));
    }
}
