// src/utils/instrument.rs: Instrument control surface and the simulated device used in watch mode
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use log::{error, info, warn};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStatus {
    Running,
    Stopped,
}


/// Messages to the operator and protocol control.
pub trait InstrumentControl: Send + Sync {
    fn send_user_message(&self, severity: Severity, message: &str);

    /// Stops the running protocol. Returns true only for the call that actually stopped it.
    fn stop_protocol(&self) -> bool;

    fn acquisition_status(&self) -> AcquisitionStatus;
}


/// Logs every message and records the stop. Stands in for the device when reads come from a folder.
#[derive(Debug, Default)]
pub struct SimulatedInstrument {
    stopped: AtomicBool,
    stop_calls: AtomicUsize,
    messages: Mutex<Vec<(Severity, String)>>,
}

impl SimulatedInstrument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of times a stop was requested, including ignored repeats.
    pub fn stop_requests(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl InstrumentControl for SimulatedInstrument {
    fn send_user_message(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!("{}", message),
            Severity::Warn => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((severity, message.to_string()));
    }

    fn stop_protocol(&self) -> bool {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let first = self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            warn!("Protocol stop requested");
        }
        first
    }

    fn acquisition_status(&self) -> AcquisitionStatus {
        if self.stopped.load(Ordering::SeqCst) {
            AcquisitionStatus::Stopped
        } else {
            AcquisitionStatus::Running
        }
    }
}
