
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

pub mod common;
pub mod gps_l1_ca;
pub mod tracking;

/// Synchronization record exchanged between acquisition, tracking and the
/// downstream consumers.  Acquisition fills the acq_* fields; tracking fills
/// the rest once per PRN period.
#[derive(Debug, Clone, Serialize)]
pub struct GnssSynchro {
	pub system: char,
	pub signal: &'static str,
	pub prn: usize,
	pub acq_delay_samples: f64,
	pub acq_doppler_hz: f64,
	pub acq_samplestamp_samples: u64,
	pub prompt_i: f64,
	pub prompt_q: f64,
	pub tracking_timestamp_secs: f64,
	pub carrier_phase_rads: f64,
	pub carrier_doppler_hz: f64,
	pub code_phase_secs: f64,
	pub cn0_db_hz: f64,
	pub flag_valid_tracking: bool,
}

impl GnssSynchro {

	pub fn new(prn:usize) -> Self {
		GnssSynchro{ system: 'G', signal: "1C", prn,
			acq_delay_samples: 0.0, acq_doppler_hz: 0.0, acq_samplestamp_samples: 0,
			prompt_i: 0.0, prompt_q: 0.0, tracking_timestamp_secs: 0.0,
			carrier_phase_rads: 0.0, carrier_doppler_hz: 0.0, code_phase_secs: 0.0,
			cn0_db_hz: 0.0, flag_valid_tracking: false }
	}

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
	StopChannel{ channel:usize },
	AcqSuccess{ channel:usize },
	AcqFail{ channel:usize },
	LossOfLock{ channel:usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodePhaseEntry {
	pub code_phase_samples: f64,
	pub sample_stamp: u64,
}

/// Acquired (PRN -> code phase) pairs shared across channels for diagnostics and
/// cross-channel de-duplication.  Written only from control-message dispatch,
/// never from the correlation loop.
#[derive(Clone)]
pub struct CodePhaseMap {
	inner: Arc<Mutex<HashMap<usize, CodePhaseEntry>>>,
}

impl CodePhaseMap {

	pub fn new() -> Self { Self{ inner: Arc::new(Mutex::new(HashMap::new())) } }

	pub fn insert(&self, prn:usize, entry:CodePhaseEntry) {
		self.inner.lock().unwrap().insert(prn, entry);
	}

	pub fn get(&self, prn:usize) -> Option<CodePhaseEntry> {
		self.inner.lock().unwrap().get(&prn).copied()
	}

	pub fn len(&self) -> usize { self.inner.lock().unwrap().len() }

}
