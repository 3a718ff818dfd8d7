use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wulpus_rs::{
    AcquisitionFrame, BluetoothError, Connection, ConnectionConfig, DeviceDescriptor,
    DeviceHandle, DriverError, Result, Transport, TransportState, ACQ_LENGTH_SAMPLES,
};

enum Step {
    Frame(AcquisitionFrame),
    Malformed,
    Disconnect,
    Hang,
}

#[derive(Default)]
struct Script {
    devices: Option<Vec<DeviceDescriptor>>,
    open_fails: bool,
    close_fails: bool,
    open_delay: Option<Duration>,
    link_up: bool,
    steps: VecDeque<Step>,
    sent: Vec<Vec<u8>>,
    calls: Vec<&'static str>,
    live: usize,
    max_live: usize,
}

/// In-memory transport driven by a shared script.
struct Scripted(Arc<Mutex<Script>>);

struct Live(Arc<Mutex<Script>>);

impl Live {
    fn enter(script: &Arc<Mutex<Script>>, call: &'static str) -> Self {
        let mut s = script.lock().unwrap();
        s.calls.push(call);
        s.live += 1;
        s.max_live = s.max_live.max(s.live);
        Live(Arc::clone(script))
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.lock().unwrap().live -= 1;
    }
}

impl Transport for Scripted {
    async fn discover(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let _live = Live::enter(&self.0, "discover");
        let devices = self.0.lock().unwrap().devices.clone();
        devices.ok_or_else(|| DriverError::NotReady("adapter powered off".into()))
    }

    async fn open(&mut self, _device: &DeviceDescriptor) -> Result<()> {
        let _live = Live::enter(&self.0, "open");
        let delay = {
            let mut s = self.0.lock().unwrap();
            s.link_up = true;
            s.open_delay.unwrap_or(Duration::from_millis(2))
        };
        tokio::time::sleep(delay).await;
        let mut s = self.0.lock().unwrap();
        if s.open_fails {
            s.link_up = false;
            return Err(DriverError::Timeout("connect".into()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _live = Live::enter(&self.0, "close");
        let mut s = self.0.lock().unwrap();
        if s.close_fails {
            return Err(DriverError::NotReady("busy".into()));
        }
        s.link_up = false;
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let _live = Live::enter(&self.0, "send");
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.0.lock().unwrap().sent.push(payload.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<AcquisitionFrame>> {
        let _live = Live::enter(&self.0, "receive");
        let step = self.0.lock().unwrap().steps.pop_front();
        match step {
            Some(Step::Frame(frame)) => Ok(Some(frame)),
            Some(Step::Malformed) => Ok(None),
            Some(Step::Disconnect) => {
                Err(BluetoothError::NotConnected("peer gone".into()).into())
            }
            Some(Step::Hang) | None => std::future::pending().await,
        }
    }
}

fn dongle(name: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(
        name,
        DeviceHandle::Serial {
            port: format!("/dev/{name}"),
            vid: 0x1915,
            pid: 0x520f,
            description: Some("WULPUS dongle".into()),
        },
    )
}

fn frame(acq: u16) -> AcquisitionFrame {
    AcquisitionFrame {
        samples: vec![acq as i16; ACQ_LENGTH_SAMPLES],
        acquisition_number: acq,
        channel_id: 3,
    }
}

fn scripted(script: Script, config: ConnectionConfig) -> (Connection, Arc<Mutex<Script>>) {
    let script = Arc::new(Mutex::new(script));
    let link = Connection::with_transport(Scripted(Arc::clone(&script)), config).unwrap();
    (link, script)
}

fn calls(script: &Arc<Mutex<Script>>, name: &str) -> usize {
    script.lock().unwrap().calls.iter().filter(|c| **c == name).count()
}

#[test]
fn discovery_lists_devices_and_swallows_errors() {
    let (link, script) = scripted(
        Script {
            devices: Some(vec![dongle("ttyACM0"), dongle("ttyACM1")]),
            ..Default::default()
        },
        ConnectionConfig::default(),
    );
    let names: Vec<_> = link
        .list_available()
        .iter()
        .map(|d| d.name().to_string())
        .collect();
    assert_eq!(names, ["ttyACM0", "ttyACM1"]);

    script.lock().unwrap().devices = None;
    assert!(link.list_available().is_empty());
    assert_eq!(link.state(), TransportState::Closed);
}

#[test]
fn open_is_idempotent_for_the_same_device() {
    let (link, script) = scripted(Script::default(), ConnectionConfig::default());
    let dev = dongle("ttyACM0");

    assert!(link.open(&dev));
    assert_eq!(link.state(), TransportState::Open);
    assert!(link.open(&dev));
    assert_eq!(calls(&script, "open"), 1);

    assert!(!link.open(&dongle("ttyACM1")));
    assert_eq!(calls(&script, "open"), 1);
    assert_eq!(link.state(), TransportState::Open);
}

#[test]
fn failed_open_leaves_connection_closed() {
    let (link, _script) = scripted(
        Script {
            open_fails: true,
            ..Default::default()
        },
        ConnectionConfig::default(),
    );
    assert!(!link.open(&dongle("ttyACM0")));
    assert_eq!(link.state(), TransportState::Closed);
    assert!(!link.send_config(&[1, 2, 3]));
}

#[test]
fn close_is_idempotent() {
    let (link, script) = scripted(Script::default(), ConnectionConfig::default());
    assert!(link.close());
    assert_eq!(calls(&script, "close"), 0);

    assert!(link.open(&dongle("ttyACM0")));
    assert!(link.close());
    assert!(link.close());
    assert_eq!(calls(&script, "close"), 1);
    assert_eq!(link.state(), TransportState::Closed);
}

#[test]
fn failed_close_keeps_link_open() {
    let (link, script) = scripted(Script::default(), ConnectionConfig::default());
    assert!(link.open(&dongle("ttyACM0")));

    script.lock().unwrap().close_fails = true;
    assert!(!link.close());
    assert_eq!(link.state(), TransportState::Open);

    script.lock().unwrap().close_fails = false;
    assert!(link.close());
    assert_eq!(link.state(), TransportState::Closed);
}

#[test]
fn io_while_closed_does_not_reach_transport() {
    let (link, script) = scripted(Script::default(), ConnectionConfig::default());
    assert!(!link.send_config(&[0xAB]));
    assert_eq!(link.receive_frame(), None);
    assert!(script.lock().unwrap().calls.is_empty());
    assert_eq!(link.call_stats().total_calls, 0);
}

#[test]
fn frames_are_delivered_in_order_and_malformed_ones_skipped() {
    let (link, script) = scripted(
        Script {
            steps: VecDeque::from([
                Step::Frame(frame(1)),
                Step::Malformed,
                Step::Frame(frame(2)),
            ]),
            ..Default::default()
        },
        ConnectionConfig::default(),
    );
    assert!(link.open(&dongle("ttyACM0")));
    assert!(link.send_config(&[0x10, 0x20]));
    assert_eq!(script.lock().unwrap().sent, vec![vec![0x10, 0x20]]);

    assert_eq!(link.receive_frame().map(|f| f.acquisition_number), Some(1));
    assert_eq!(link.receive_frame(), None);
    assert_eq!(link.state(), TransportState::Open);

    let second = link.receive_frame().unwrap();
    assert_eq!(second.acquisition_number, 2);
    assert_eq!(second.samples.len(), link.acq_length());
}

#[test]
fn disconnect_marks_connection_closed() {
    let (link, script) = scripted(
        Script {
            steps: VecDeque::from([Step::Disconnect, Step::Frame(frame(9))]),
            ..Default::default()
        },
        ConnectionConfig::default(),
    );
    assert!(link.open(&dongle("ttyACM0")));
    assert_eq!(link.receive_frame(), None);
    assert_eq!(link.state(), TransportState::Closed);
    assert_eq!(calls(&script, "close"), 1);

    // Nothing reaches the transport until it is reopened.
    assert_eq!(link.receive_frame(), None);
    assert_eq!(calls(&script, "receive"), 1);

    assert!(link.open(&dongle("ttyACM0")));
    assert_eq!(link.receive_frame().map(|f| f.acquisition_number), Some(9));
}

#[test]
fn receive_timeout_returns_none_and_keeps_link_open() {
    let (link, _script) = scripted(
        Script {
            steps: VecDeque::from([Step::Hang, Step::Frame(frame(4))]),
            ..Default::default()
        },
        ConnectionConfig::default().with_receive_timeout(Duration::from_millis(50)),
    );
    assert!(link.open(&dongle("ttyACM0")));
    assert_eq!(link.receive_frame(), None);
    assert_eq!(link.state(), TransportState::Open);
    assert_eq!(link.receive_frame().map(|f| f.acquisition_number), Some(4));
}

#[test]
fn concurrent_callers_are_serialized() {
    let (link, script) = scripted(Script::default(), ConnectionConfig::default());
    let link = Arc::new(link);
    assert!(link.open(&dongle("ttyACM0")));

    let workers: Vec<_> = (0..8u8)
        .map(|i| {
            let link = Arc::clone(&link);
            thread::spawn(move || (0..5).all(|_| link.send_config(&[i])))
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap());
    }

    let stats = link.call_stats();
    assert_eq!(stats.total_calls, 41);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.peak_in_flight, 1);

    let script = script.lock().unwrap();
    assert_eq!(script.max_live, 1);
    assert_eq!(script.sent.len(), 40);
}

#[test]
fn shutdown_unblocks_pending_receive_and_closes_link() {
    let (link, script) = scripted(
        Script {
            steps: VecDeque::from([Step::Hang]),
            ..Default::default()
        },
        ConnectionConfig::default(),
    );
    let link = Arc::new(link);
    assert!(link.open(&dongle("ttyACM0")));

    let reader = {
        let link = Arc::clone(&link);
        thread::spawn(move || link.receive_frame())
    };
    thread::sleep(Duration::from_millis(100));
    link.shutdown();

    assert_eq!(reader.join().unwrap(), None);
    assert_eq!(link.state(), TransportState::Closed);
    assert_eq!(calls(&script, "close"), 1);
    assert_eq!(script.lock().unwrap().live, 0);

    // The worker is gone: everything fails fast.
    assert!(!link.open(&dongle("ttyACM0")));
    assert!(link.list_available().is_empty());
    assert!(link.close());
}

#[test]
fn shutdown_during_open_releases_the_link() {
    let (link, script) = scripted(
        Script {
            open_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        },
        ConnectionConfig::default(),
    );
    let link = Arc::new(link);

    let opener = {
        let link = Arc::clone(&link);
        thread::spawn(move || link.open(&dongle("ttyACM0")))
    };
    thread::sleep(Duration::from_millis(100));
    link.shutdown();

    assert!(!opener.join().unwrap());
    assert_eq!(link.state(), TransportState::Closed);
    let script = script.lock().unwrap();
    assert_eq!(script.calls.iter().filter(|c| **c == "close").count(), 1);
    assert!(!script.link_up);
}
