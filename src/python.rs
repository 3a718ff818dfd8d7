//! Python bindings.
//!
//! Mirrors the acquisition API the GUI expects:
//!
//! ```python
//! from wulpus_rs import Connection
//! conn = Connection("direct")
//! devices = conn.get_available()
//! if conn.open(devices[0]) and conn.send_config(package):
//!     frame = conn.receive_data()
//! ```
//!
//! Every blocking call releases the GIL so the worker thread can log through Python.

use std::time::Duration;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::codec::{AcquisitionFrame, ACQ_LENGTH_SAMPLES};
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::device::DeviceDescriptor;
use crate::logging;
use crate::transport::TransportKind;

/// A discovered dongle or probe.
///
/// Attributes:
///     name: Port name (dongle) or advertised name (direct).
///     description: Human readable description for device pickers.
///     transport: "dongle" or "direct".
#[pyclass(name = "Device", frozen)]
#[derive(Clone)]
struct PyDevice {
    inner: DeviceDescriptor,
}

#[pymethods]
impl PyDevice {
    #[getter]
    fn name(&self) -> String {
        self.inner.name().to_string()
    }

    #[getter]
    fn description(&self) -> String {
        self.inner.description()
    }

    #[getter]
    fn transport(&self) -> &'static str {
        self.inner.transport_name()
    }

    fn __repr__(&self) -> String {
        format!(
            "Device(name={:?}, description={:?}, transport={:?})",
            self.inner.name(),
            self.inner.description(),
            self.inner.transport_name()
        )
    }
}

/// One acquisition.
///
/// Attributes:
///     samples: ACQ_LENGTH_SAMPLES signed 16-bit RF samples.
///     acquisition_number: Sequence number within the measurement run.
///     channel_id: TX/RX configuration that produced the frame.
#[pyclass(name = "AcquisitionFrame", frozen)]
#[derive(Clone)]
struct PyAcquisitionFrame {
    #[pyo3(get)]
    samples: Vec<i16>,
    #[pyo3(get)]
    acquisition_number: u16,
    #[pyo3(get)]
    channel_id: u8,
}

#[pymethods]
impl PyAcquisitionFrame {
    fn __repr__(&self) -> String {
        format!(
            "AcquisitionFrame(acquisition_number={}, channel_id={}, samples=[{} values])",
            self.acquisition_number,
            self.channel_id,
            self.samples.len()
        )
    }

    fn __len__(&self) -> usize {
        self.samples.len()
    }

    /// Convert to dictionary for easy serialization.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("samples", self.samples.clone())?;
        dict.set_item("acquisition_number", self.acquisition_number)?;
        dict.set_item("channel_id", self.channel_id)?;
        Ok(dict)
    }
}

impl From<AcquisitionFrame> for PyAcquisitionFrame {
    fn from(f: AcquisitionFrame) -> Self {
        PyAcquisitionFrame {
            samples: f.samples,
            acquisition_number: f.acquisition_number,
            channel_id: f.channel_id,
        }
    }
}

/// Acquisition link to a WULPUS probe.
///
/// Args:
///     kind: "dongle" (USB serial) or "direct" (BLE).
///     receive_timeout: Optional bound in seconds on a single receive_data() wait.
///
/// Raises:
///     ValueError: If kind is unknown.
///     RuntimeError: If the background worker cannot be started.
#[pyclass(name = "Connection", frozen)]
struct PyConnection {
    inner: Connection,
    kind: TransportKind,
}

#[pymethods]
impl PyConnection {
    #[new]
    #[pyo3(signature = (kind="dongle", receive_timeout=None))]
    fn new(kind: &str, receive_timeout: Option<f64>) -> PyResult<Self> {
        let kind: TransportKind = kind
            .parse()
            .map_err(|e: crate::DriverError| PyValueError::new_err(e.to_string()))?;
        let mut config = ConnectionConfig::default();
        if let Some(secs) = receive_timeout {
            let limit = Duration::try_from_secs_f64(secs)
                .map_err(|e| PyValueError::new_err(format!("receive_timeout: {e}")))?;
            config = config.with_receive_timeout(limit);
        }
        let inner = Connection::with_config(kind, config)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        Ok(PyConnection { inner, kind })
    }

    /// Discover devices. Returns an empty list when nothing is found.
    fn get_available(&self, py: Python<'_>) -> Vec<PyDevice> {
        py.detach(|| self.inner.list_available())
            .into_iter()
            .map(|inner| PyDevice { inner })
            .collect()
    }

    /// Open the link to a device returned by get_available().
    fn open(&self, py: Python<'_>, device: PyRef<'_, PyDevice>) -> bool {
        let device = device.inner.clone();
        py.detach(|| self.inner.open(&device))
    }

    fn close(&self, py: Python<'_>) -> bool {
        py.detach(|| self.inner.close())
    }

    /// Stop the background worker and close the link. Later calls return False/None.
    fn shutdown(&self, py: Python<'_>) {
        py.detach(|| self.inner.shutdown())
    }

    /// Send a configuration package (bytes).
    fn send_config(&self, py: Python<'_>, conf_bytes_pack: &[u8]) -> bool {
        py.detach(|| self.inner.send_config(conf_bytes_pack))
    }

    /// Wait for the next frame. Returns None on error, malformed frame or timeout.
    fn receive_data(&self, py: Python<'_>) -> Option<PyAcquisitionFrame> {
        py.detach(|| self.inner.receive_frame())
            .map(PyAcquisitionFrame::from)
    }

    #[getter]
    fn acq_length(&self) -> usize {
        self.inner.acq_length()
    }

    /// "closed", "connecting", "open" or "closing".
    #[getter]
    fn state(&self) -> String {
        format!("{:?}", self.inner.state()).to_lowercase()
    }

    fn __repr__(&self) -> String {
        format!("Connection(kind={:?}, state={})", self.kind.to_string(), self.state())
    }
}

impl Drop for PyConnection {
    fn drop(&mut self) {
        // The worker may log through Python while closing, so it must not be joined with
        // the GIL held.
        let inner = &self.inner;
        Python::attach(|py| py.detach(|| inner.shutdown()));
    }
}

/// Route Rust logs into Python's `logging` (level defaults to WULPUS_LOG / RUST_LOG).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(level: Option<&str>) -> PyResult<()> {
    logging::init_python_logging(level_arg(level)?);
    Ok(())
}

/// Set the minimum level forwarded to Python ("trace" .. "error", or "off").
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level(level_arg(level)?);
    Ok(())
}

fn level_arg(level: Option<&str>) -> PyResult<log::LevelFilter> {
    match level {
        Some(s) => logging::parse_level(s)
            .ok_or_else(|| PyValueError::new_err(format!("unknown log level {s:?}"))),
        None => Ok(logging::env_level()),
    }
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyConnection>()?;
    m.add_class::<PyDevice>()?;
    m.add_class::<PyAcquisitionFrame>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("ACQ_LENGTH_SAMPLES", ACQ_LENGTH_SAMPLES)?;
    m.add("CONNECTION_TYPES", vec!["dongle", "direct"])?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceHandle;
    use crate::errors::Result;
    use crate::transport::Transport;

    /// Always-open link whose close logs.
    struct Loopback;

    impl Transport for Loopback {
        async fn discover(&mut self) -> Result<Vec<DeviceDescriptor>> {
            Ok(Vec::new())
        }

        async fn open(&mut self, _device: &DeviceDescriptor) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            log::info!("loopback closed");
            Ok(())
        }

        async fn send(&mut self, _payload: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn receive(&mut self) -> Result<Option<AcquisitionFrame>> {
            Ok(None)
        }
    }

    #[test]
    fn module_exports_what_the_package_imports() {
        Python::initialize();
        Python::attach(|py| {
            let m = PyModule::new(py, "_core").unwrap();
            _core(&m).unwrap();
            for name in [
                "ACQ_LENGTH_SAMPLES",
                "CONNECTION_TYPES",
                "AcquisitionFrame",
                "Connection",
                "Device",
                "init_logging",
                "set_log_level",
            ] {
                assert!(m.hasattr(name).unwrap(), "missing {name}");
            }
            let samples: usize = m.getattr("ACQ_LENGTH_SAMPLES").unwrap().extract().unwrap();
            assert_eq!(samples, ACQ_LENGTH_SAMPLES);
        });
    }

    #[test]
    fn dropping_an_open_connection_with_python_logging_returns() {
        Python::initialize();
        logging::init_python_logging(log::LevelFilter::Info);
        let device = DeviceDescriptor::new(
            "ttyACM0",
            DeviceHandle::Serial {
                port: "/dev/ttyACM0".into(),
                vid: 0x1915,
                pid: 0x520f,
                description: None,
            },
        );

        Python::attach(|py| {
            let inner = Connection::with_transport(Loopback, ConnectionConfig::default()).unwrap();
            assert!(py.detach(|| inner.open(&device)));
            let conn = Py::new(
                py,
                PyConnection {
                    inner,
                    kind: TransportKind::Dongle,
                },
            )
            .unwrap();
            assert_eq!(conn.get().state(), "open");

            // Deallocated right here, with the GIL held.
            drop(conn);
        });
    }
}
