//! Log output for the CLI (stderr via `env_logger`) and for the Python extension
//! (records forwarded into Python's `logging`).
//!
//! The level comes from `WULPUS_LOG`, then `RUST_LOG`, then defaults to `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

const LEVEL_ENV: &str = "WULPUS_LOG";

static CLI_LOG_ONCE: Once = Once::new();

/// Level requested through the environment.
pub fn env_level() -> LevelFilter {
    std::env::var(LEVEL_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

/// Parse `"debug"`, `"WARN"`, `"off"`, ...
pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Install the stderr logger. `level` overrides the environment when given.
/// Only the first call has an effect.
pub fn init_cli_logging(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(env_level);
    CLI_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(false)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use python::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;

    static BRIDGE: OnceCell<&'static PythonLogBridge> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(<target with dots>)`.
    struct PythonLogBridge {
        max_level: Mutex<LevelFilter>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PythonLogBridge {
        fn level(&self) -> LevelFilter {
            *self
                .max_level
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        fn logger_for(&self, py: Python<'_>, name: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = self
                .loggers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(logger) = loggers.get(name) {
                return Ok(logger.clone_ref(py));
            }
            let logger = py
                .import("logging")?
                .call_method1("getLogger", (name,))?
                .unbind();
            loggers.insert(name.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn emit(&self, record: &Record) {
            let name = record.target().replace("::", ".");
            let message = record.args().to_string();
            let level = python_level(record.level());

            Python::attach(|py| {
                let sent = self.logger_for(py, &name).and_then(|logger| {
                    logger
                        .bind(py)
                        .call_method1("log", (level, message))
                        .map(|_| ())
                });
                if let Err(e) = sent {
                    e.restore(py);
                }
            });
        }
    }

    impl Log for PythonLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level()
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                self.emit(record);
            }
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Safe to call more than once.
    pub fn init_python_logging(level: LevelFilter) {
        let bridge = BRIDGE.get_or_init(|| {
            let bridge: &'static PythonLogBridge = Box::leak(Box::new(PythonLogBridge {
                max_level: Mutex::new(level),
                loggers: Mutex::new(HashMap::new()),
            }));
            if log::set_logger(bridge).is_err() {
                log::warn!("a logger is already installed; python bridge inactive");
            }
            bridge
        });
        set_level(bridge, level);
    }

    /// Change the level of the Python bridge, installing it if needed.
    pub fn set_python_log_level(level: LevelFilter) {
        match BRIDGE.get() {
            Some(bridge) => set_level(bridge, level),
            None => init_python_logging(level),
        }
    }

    fn set_level(bridge: &PythonLogBridge, level: LevelFilter) {
        *bridge
            .max_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
        // Python-side logger configuration may have changed too.
        bridge
            .loggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("off"), Some(LevelFilter::Off));
        assert_eq!(parse_level("loud"), None);
    }
}
