
use std::path::PathBuf;

use crossbeam_channel::Sender;
use log::{info, warn};
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;
use serde::Serialize;

use crate::DigSigProcErr;
use crate::filters::{self, ScalarFilter, SecondOrderLoopFilter, SinglePoleIIR};
use crate::gnss::{ControlMessage, GnssSynchro};
use crate::gnss::tracking::discriminators::{pll_cloop_two_quadrant_atan, dll_nc_e_minus_l_normalized};
use crate::gnss::tracking::lock_detectors::{carrier_lock_detector, cn0_svn_estimator};
use crate::io::{TrackingDumpRecord, TrackingDumpWriter};

use super::{GPS_L1_FREQ_HZ, GPS_L1_CA_CODE_RATE_HZ, GPS_L1_CA_CODE_LENGTH_CHIPS, GPS_L1_CA_CODE_PERIOD, GPS_TWO_PI};
use super::signal_modulation;

const CN0_ESTIMATION_SAMPLES:usize = 20;
const MINIMUM_VALID_CN0:f64 = 25.0;
const MAXIMUM_LOCK_FAIL_COUNTER:u32 = 50;
const CARRIER_LOCK_THRESHOLD:f64 = 0.85;
const ALL_BW_HZ:f64 = 10.0;

// Initial secondary-to-primary amplitude ratio, from the expected attenuation
// of the second propagation path
const CADLL_INITIAL_AMPLITUDE_RATIO:f64 = 1.284025416687741;
const AMPLITUDE_NORMALIZATION:f64 = 0.99;

#[derive(Debug, Clone)]
pub struct TrkConfig {
	pub fs_in: f64,
	pub vector_length: usize,
	pub pll_bw_hz: f64,
	pub dll_bw_hz: f64,
	pub early_late_space_chips: f64,
	pub cadll_secondary_seed_samples: f64,
	pub dump: Option<PathBuf>,
}

impl Default for TrkConfig {
	fn default() -> Self {
		TrkConfig{ fs_in: 2.048e6, vector_length: 2048, pll_bw_hz: 40.0, dll_bw_hz: 4.0,
			early_late_space_chips: 0.5, cadll_secondary_seed_samples: 27.0, dump: None }
	}
}

#[derive(Debug, Clone, Copy)]
pub struct TrackingStep {
	pub consumed: usize,
	pub record_ready: bool,
}

#[derive(Debug, Serialize)]
pub struct TrackingDebug {
	pub carrier_doppler_hz: f64,
	pub code_freq_chips: f64,
	pub prompt_re: f64,
	pub prompt_im: f64,
	pub cn0_db_hz: f64,
	pub carrier_lock_test: f64,
	pub a1: f64,
	pub a2: f64,
}

/// Carrier PLL with two coupled code DLLs on the same input.  The primary and
/// secondary code loops share one carrier estimate but keep independent code
/// NCO state, so a delayed propagation path can be pulled apart from the
/// direct one.
pub struct Tracking {
	pub channel: usize,
	pub prn: usize,
	fs_in: f64,
	vector_length: usize,
	early_late_spc_chips: f64,
	cadll_secondary_seed_samples: f64,

	carrier_loop_filter: SecondOrderLoopFilter,
	code_loop_filter: SecondOrderLoopFilter,
	code_loop_filter_m: SecondOrderLoopFilter,
	amplitude_loop_filter: SinglePoleIIR,
	amplitude_loop_filter_m: SinglePoleIIR,

	ca_code: Vec<Complex<f32>>,

	early_code: Vec<Complex<f32>>,
	prompt_code: Vec<Complex<f32>>,
	late_code: Vec<Complex<f32>>,
	early_code_m: Vec<Complex<f32>>,
	prompt_code_m: Vec<Complex<f32>>,
	late_code_m: Vec<Complex<f32>>,
	carr_sign: Vec<Complex<f32>>,

	code_freq_chips: f64,
	rem_code_phase_samples: f64,
	rem_code_phase_samples_m: f64,
	rem_carr_phase_rad: f64,
	acc_carrier_phase_rad: f64,
	acc_code_phase_secs: f64,
	acc_code_phase_secs_m: f64,
	carrier_doppler_hz: f64,

	acq_code_phase_samples: f64,
	acq_carrier_doppler_hz: f64,
	acq_sample_stamp: u64,

	sample_counter: u64,
	sample_counter_m: u64,
	current_prn_length_samples: usize,
	current_prn_length_samples_m: usize,

	enable_tracking: bool,
	pull_in: bool,
	pull_in_samples_remaining: usize,
	cadll_init: bool,

	a1: f64,
	a2: f64,

	prompt_buffer: [Complex<f32>; CN0_ESTIMATION_SAMPLES],
	cn0_estimation_counter: usize,
	cn0_db_hz: f64,
	carrier_lock_test: f64,
	carrier_lock_fail_counter: u32,

	last_seg: u64,
	queue: Sender<ControlMessage>,
	dump: Option<TrackingDumpWriter>,
	dump_path: Option<PathBuf>,
}

pub fn new_cadll_tracker(cfg:TrkConfig, channel:usize, queue:Sender<ControlMessage>) -> Tracking {
	let pdi:f64 = GPS_L1_CA_CODE_PERIOD;
	let buffer_len:usize = 2 * cfg.vector_length;
	Tracking{
		channel, prn: 0,
		fs_in: cfg.fs_in,
		vector_length: cfg.vector_length,
		early_late_spc_chips: cfg.early_late_space_chips,
		cadll_secondary_seed_samples: cfg.cadll_secondary_seed_samples,
		carrier_loop_filter: filters::pll_filter(cfg.pll_bw_hz, pdi),
		code_loop_filter: filters::dll_filter(cfg.dll_bw_hz, pdi),
		code_loop_filter_m: filters::dll_filter(cfg.dll_bw_hz, pdi),
		amplitude_loop_filter: filters::amplitude_filter(ALL_BW_HZ, pdi),
		amplitude_loop_filter_m: filters::amplitude_filter(ALL_BW_HZ, pdi),
		ca_code: vec![],
		early_code: Vec::with_capacity(buffer_len),
		prompt_code: Vec::with_capacity(buffer_len),
		late_code: Vec::with_capacity(buffer_len),
		early_code_m: Vec::with_capacity(buffer_len),
		prompt_code_m: Vec::with_capacity(buffer_len),
		late_code_m: Vec::with_capacity(buffer_len),
		carr_sign: Vec::with_capacity(buffer_len),
		code_freq_chips: GPS_L1_CA_CODE_RATE_HZ,
		rem_code_phase_samples: 0.0,
		rem_code_phase_samples_m: 0.0,
		rem_carr_phase_rad: 0.0,
		acc_carrier_phase_rad: 0.0,
		acc_code_phase_secs: 0.0,
		acc_code_phase_secs_m: 0.0,
		carrier_doppler_hz: 0.0,
		acq_code_phase_samples: 0.0,
		acq_carrier_doppler_hz: 0.0,
		acq_sample_stamp: 0,
		sample_counter: 0,
		sample_counter_m: 0,
		current_prn_length_samples: cfg.vector_length,
		current_prn_length_samples_m: cfg.vector_length,
		enable_tracking: false,
		pull_in: false,
		pull_in_samples_remaining: 0,
		cadll_init: true,
		a1: 0.0,
		a2: 0.0,
		prompt_buffer: [Complex::zero(); CN0_ESTIMATION_SAMPLES],
		cn0_estimation_counter: 0,
		cn0_db_hz: 0.0,
		carrier_lock_test: 1.0,
		carrier_lock_fail_counter: 0,
		last_seg: 0,
		queue,
		dump: None,
		dump_path: cfg.dump,
	}
}

/// Resamples one early/prompt/late replica triple from the guard-padded code
/// table at the current code frequency and residual code phase.
fn update_local_code(ca_code:&[Complex<f32>], code_freq_chips:f64, fs_in:f64, rem_code_phase_samples:f64,
					 early_late_spc_chips:f64, prn_length_samples:usize,
					 early:&mut Vec<Complex<f32>>, prompt:&mut Vec<Complex<f32>>, late:&mut Vec<Complex<f32>>) {
	let code_length_chips:f64 = GPS_L1_CA_CODE_LENGTH_CHIPS;
	let code_phase_step_chips:f64 = code_freq_chips / fs_in;
	let rem_code_phase_chips:f64 = rem_code_phase_samples * code_phase_step_chips;
	let mut tcode_chips:f64 = -rem_code_phase_chips;

	let early_late_spc_samples:usize = (early_late_spc_chips / code_phase_step_chips).round() as usize;
	let epl_loop_length_samples:usize = prn_length_samples + early_late_spc_samples * 2;

	early.clear();
	for _ in 0..epl_loop_length_samples {
		let mut associated_chip_index:i64 = 1 + ((tcode_chips - early_late_spc_chips) % code_length_chips).round() as i64;
		if associated_chip_index < 0 { associated_chip_index += code_length_chips as i64; }
		early.push(ca_code[associated_chip_index as usize]);
		tcode_chips += code_phase_step_chips;
	}

	prompt.clear();
	prompt.extend_from_slice(&early[early_late_spc_samples..early_late_spc_samples + prn_length_samples]);
	late.clear();
	late.extend_from_slice(&early[early_late_spc_samples * 2..early_late_spc_samples * 2 + prn_length_samples]);
}

impl Tracking {

	pub fn enabled(&self) -> bool { self.enable_tracking }
	pub fn cadll_promoted(&self) -> bool { !self.cadll_init }
	pub fn carrier_doppler_hz(&self) -> f64 { self.carrier_doppler_hz }
	pub fn code_freq_chips(&self) -> f64 { self.code_freq_chips }
	pub fn rem_code_phase_samples(&self) -> f64 { self.rem_code_phase_samples }
	pub fn rem_code_phase_samples_m(&self) -> f64 { self.rem_code_phase_samples_m }

	/// Code-phase separation between the primary and secondary loops, in
	/// samples of the input stream.
	pub fn secondary_offset_samples(&self) -> f64 {
		self.rem_code_phase_samples
			- (self.rem_code_phase_samples_m + (self.sample_counter_m as f64 - self.sample_counter as f64))
	}
	pub fn cn0_db_hz(&self) -> f64 { self.cn0_db_hz }
	pub fn carrier_lock_test(&self) -> f64 { self.carrier_lock_test }
	pub fn amplitudes(&self) -> (f64, f64) { (self.a1, self.a2) }
	pub fn sample_counter(&self) -> u64 { self.sample_counter }
	pub fn current_prn_length_samples(&self) -> usize { self.current_prn_length_samples }

	/// Samples the caller should make available to the next process() call.
	pub fn wanted(&self) -> usize { 2 * self.vector_length }

	/// Aligns this loop's sample counter with the channel's stream position;
	/// must be called before start_tracking so the acquisition-to-tracking
	/// delay comes out right.
	pub fn set_sample_counter(&mut self, counter:u64) {
		self.sample_counter = counter;
		self.sample_counter_m = counter;
	}

	pub fn debug(&self, synchro:&GnssSynchro) -> TrackingDebug {
		TrackingDebug{
			carrier_doppler_hz: self.carrier_doppler_hz,
			code_freq_chips: self.code_freq_chips,
			prompt_re: synchro.prompt_i,
			prompt_im: synchro.prompt_q,
			cn0_db_hz: self.cn0_db_hz,
			carrier_lock_test: self.carrier_lock_test,
			a1: self.a1,
			a2: self.a2 }
	}

	/// Corrects the acquisition code phase for the samples elapsed between the
	/// acquisition stamp and now, then arms the pull-in alignment.
	pub fn start_tracking(&mut self, synchro:&GnssSynchro) -> Result<(), DigSigProcErr> {
		self.prn = synchro.prn;
		self.acq_code_phase_samples = synchro.acq_delay_samples;
		self.acq_carrier_doppler_hz = synchro.acq_doppler_hz;
		self.acq_sample_stamp = synchro.acq_samplestamp_samples;

		let acq_trk_diff_samples:i64 = self.sample_counter as i64 - self.acq_sample_stamp as i64;
		let acq_trk_diff_seconds:f64 = acq_trk_diff_samples as f64 / self.fs_in;
		info!("channel {}: {} samples between acquisition and tracking", self.channel, acq_trk_diff_samples);

		// New chip and PRN sequence periods based on the acquisition Doppler
		let radial_velocity:f64 = (GPS_L1_FREQ_HZ + self.acq_carrier_doppler_hz) / GPS_L1_FREQ_HZ;
		self.code_freq_chips = radial_velocity * GPS_L1_CA_CODE_RATE_HZ;
		let t_chip_mod_seconds:f64 = 1.0 / self.code_freq_chips;
		let t_prn_mod_seconds:f64 = t_chip_mod_seconds * GPS_L1_CA_CODE_LENGTH_CHIPS;
		let t_prn_mod_samples:f64 = t_prn_mod_seconds * self.fs_in;

		self.current_prn_length_samples = t_prn_mod_samples.round() as usize;
		self.current_prn_length_samples_m = self.current_prn_length_samples;

		let t_prn_true_seconds:f64 = GPS_L1_CA_CODE_LENGTH_CHIPS / GPS_L1_CA_CODE_RATE_HZ;
		let t_prn_true_samples:f64 = t_prn_true_seconds * self.fs_in;
		let t_prn_diff_seconds:f64 = t_prn_true_seconds - t_prn_mod_seconds;
		let n_prn_diff:f64 = acq_trk_diff_seconds / t_prn_true_seconds;

		let mut corrected_acq_phase_samples:f64 = (self.acq_code_phase_samples + t_prn_diff_seconds * n_prn_diff * self.fs_in) % t_prn_true_samples;
		if corrected_acq_phase_samples < 0.0 {
			corrected_acq_phase_samples += t_prn_mod_samples;
		}
		self.acq_code_phase_samples = corrected_acq_phase_samples;
		self.carrier_doppler_hz = self.acq_carrier_doppler_hz;

		self.carrier_loop_filter.initialize();
		self.code_loop_filter.initialize();
		self.code_loop_filter_m.initialize();
		self.amplitude_loop_filter.initialize();
		self.amplitude_loop_filter_m.initialize();

		self.carrier_lock_fail_counter = 0;
		self.rem_code_phase_samples = 0.0;
		self.rem_code_phase_samples_m = 0.0;
		self.rem_carr_phase_rad = 0.0;
		self.acc_carrier_phase_rad = 0.0;
		self.acc_code_phase_secs = 0.0;
		self.acc_code_phase_secs_m = 0.0;
		self.cn0_estimation_counter = 0;
		self.cn0_db_hz = 0.0;
		self.carrier_lock_test = 1.0;
		self.a1 = 0.0;
		self.a2 = 0.0;

		self.ca_code = signal_modulation::ca_code_padded(self.prn)?;

		if let Some(path) = &self.dump_path {
			match TrackingDumpWriter::create(path) {
				Ok(w) => self.dump = Some(w),
				Err(_) => warn!("channel {}: unable to open tracking dump file", self.channel),
			}
		}

		self.pull_in = true;
		self.pull_in_samples_remaining = 0;
		self.cadll_init = true;
		self.enable_tracking = true;

		info!("channel {}: tracking start for satellite G {} at doppler {} Hz, code phase {} samples",
			self.channel, self.prn, self.acq_carrier_doppler_hz, self.acq_code_phase_samples);
		Ok(())
	}

	/// Cooperative stop; posts the terminating control message and disables the
	/// loop at the next PRN boundary.
	pub fn stop_tracking(&mut self) {
		info!("channel {}: stopped tracking", self.channel);
		self.post(ControlMessage::LossOfLock{ channel: self.channel });
		self.enable_tracking = false;
	}

	fn post(&self, msg:ControlMessage) {
		if self.queue.send(msg).is_err() {
			warn!("channel {}: control queue disconnected", self.channel);
		}
	}

	fn update_local_carrier(&mut self, length:usize) {
		let phase_step_rad:f64 = GPS_TWO_PI * self.carrier_doppler_hz / self.fs_in;
		let mut phase_rad:f64 = self.rem_carr_phase_rad;
		self.carr_sign.clear();
		for _ in 0..length {
			self.carr_sign.push(Complex{ re: phase_rad.cos() as f32, im: -(phase_rad.sin() as f32) });
			phase_rad += phase_step_rad;
		}
	}

	/// Runs one PRN period.  The input block must hold at least wanted()
	/// samples; the returned consumed count advances the stream to the next
	/// predicted PRN boundary.
	pub fn process(&mut self, in_block:&[Complex<f32>], synchro:&mut GnssSynchro) -> Result<TrackingStep, DigSigProcErr> {
		if !self.enable_tracking {
			return Ok(TrackingStep{ consumed: 0, record_ready: false });
		}

		// Receiver signal alignment
		if self.pull_in {
			if self.pull_in_samples_remaining == 0 {
				let acq_to_trk_delay_samples:u64 = self.sample_counter - self.acq_sample_stamp;
				let acq_trk_shift_correction_samples:f64 = self.current_prn_length_samples as f64
					- (acq_to_trk_delay_samples as f64 % self.current_prn_length_samples as f64);
				self.pull_in_samples_remaining = (self.acq_code_phase_samples + acq_trk_shift_correction_samples).round() as usize;
			}
			let take:usize = self.pull_in_samples_remaining.min(in_block.len());
			self.pull_in_samples_remaining -= take;
			self.sample_counter += take as u64;
			if self.pull_in_samples_remaining == 0 {
				self.pull_in = false;
				self.sample_counter_m = self.sample_counter;
			}
			return Ok(TrackingStep{ consumed: take, record_ready: false });
		}

		let prn_length:usize = self.current_prn_length_samples;
		if in_block.len() < prn_length {
			return Ok(TrackingStep{ consumed: 0, record_ready: false });
		}

		// Local replicas for this period, using the Doppler estimate of the
		// previous one.  Both replicas span the primary-aligned block, so the
		// secondary's phase is its own remainder plus its stream offset.
		let secondary_code_phase_samples:f64 = self.rem_code_phase_samples_m
			+ (self.sample_counter_m as f64 - self.sample_counter as f64);
		update_local_code(&self.ca_code, self.code_freq_chips, self.fs_in, self.rem_code_phase_samples,
			self.early_late_spc_chips, prn_length, &mut self.early_code, &mut self.prompt_code, &mut self.late_code);
		update_local_code(&self.ca_code, self.code_freq_chips, self.fs_in, secondary_code_phase_samples,
			self.early_late_spc_chips, prn_length, &mut self.early_code_m, &mut self.prompt_code_m, &mut self.late_code_m);
		self.update_local_carrier(prn_length);

		// Carrier wipeoff and the six correlators
		let mut early:Complex<f32> = Complex::zero();
		let mut prompt:Complex<f32> = Complex::zero();
		let mut late:Complex<f32> = Complex::zero();
		let mut early_m:Complex<f32> = Complex::zero();
		let mut prompt_m:Complex<f32> = Complex::zero();
		let mut late_m:Complex<f32> = Complex::zero();
		let mut amplitude_acc:f32 = 0.0;
		for idx in 0..prn_length {
			let wiped:Complex<f32> = in_block[idx] * self.carr_sign[idx];
			early  += wiped * self.early_code[idx];
			prompt += wiped * self.prompt_code[idx];
			late   += wiped * self.late_code[idx];
			if !self.cadll_init {
				early_m  += wiped * self.early_code_m[idx];
				prompt_m += wiped * self.prompt_code_m[idx];
				late_m   += wiped * self.late_code_m[idx];
				amplitude_acc += wiped.norm();
			}
		}

		// Sample consistency check; a NaN in the input poisons the prompt
		if !prompt.re.is_finite() || !prompt.im.is_finite() {
			let samples_available:usize = in_block.len();
			self.sample_counter += samples_available as u64;
			self.sample_counter_m += samples_available as u64;
			warn!("channel {}: NaN samples at sample number {}", self.channel, self.sample_counter);
			synchro.prompt_i = 0.0;
			synchro.prompt_q = 0.0;
			synchro.tracking_timestamp_secs = self.sample_counter as f64 / self.fs_in;
			synchro.carrier_phase_rads = 0.0;
			synchro.code_phase_secs = 0.0;
			synchro.cn0_db_hz = 0.0;
			synchro.flag_valid_tracking = false;
			return Ok(TrackingStep{ consumed: samples_available, record_ready: true });
		}

		// PLL
		let carr_error_hz:f64 = pll_cloop_two_quadrant_atan(prompt) / GPS_TWO_PI;
		let carr_error_filt_hz:f64 = self.carrier_loop_filter.apply(carr_error_hz);
		self.carrier_doppler_hz = self.acq_carrier_doppler_hz + carr_error_filt_hz;
		self.code_freq_chips = GPS_L1_CA_CODE_RATE_HZ + (self.carrier_doppler_hz * GPS_L1_CA_CODE_RATE_HZ) / GPS_L1_FREQ_HZ;
		self.acc_carrier_phase_rad += GPS_TWO_PI * self.carrier_doppler_hz * GPS_L1_CA_CODE_PERIOD;
		self.rem_carr_phase_rad = (self.rem_carr_phase_rad + GPS_TWO_PI * self.carrier_doppler_hz * GPS_L1_CA_CODE_PERIOD) % GPS_TWO_PI;

		// DLL, primary loop
		let code_error_chips:f64 = dll_nc_e_minus_l_normalized(early, late);
		let code_error_filt_chips:f64 = self.code_loop_filter.apply(code_error_chips);
		let code_error_filt_secs:f64 = (GPS_L1_CA_CODE_PERIOD * code_error_filt_chips) / GPS_L1_CA_CODE_RATE_HZ;
		self.acc_code_phase_secs += code_error_filt_secs;

		// DLL, secondary loop
		let mut code_error_filt_secs_m:f64 = 0.0;
		if !self.cadll_init {
			let code_error_chips_m:f64 = dll_nc_e_minus_l_normalized(early_m, late_m);
			let code_error_filt_chips_m:f64 = self.code_loop_filter_m.apply(code_error_chips_m);
			code_error_filt_secs_m = (GPS_L1_CA_CODE_PERIOD * code_error_filt_chips_m) / GPS_L1_CA_CODE_RATE_HZ;
			self.acc_code_phase_secs_m += code_error_filt_secs_m;
		}

		// Carrier and code NCO buffer alignment for the next period
		let t_chip_seconds:f64 = 1.0 / self.code_freq_chips;
		let t_prn_seconds:f64 = t_chip_seconds * GPS_L1_CA_CODE_LENGTH_CHIPS;
		let t_prn_samples:f64 = t_prn_seconds * self.fs_in;
		let k_blk_samples:f64 = t_prn_samples + self.rem_code_phase_samples + code_error_filt_secs * self.fs_in;
		let k_blk_samples_m:f64 = if self.cadll_init {
			self.rem_code_phase_samples_m = self.rem_code_phase_samples;
			k_blk_samples
		} else {
			t_prn_samples + self.rem_code_phase_samples_m + code_error_filt_secs_m * self.fs_in
		};
		self.current_prn_length_samples = k_blk_samples.round() as usize;
		self.current_prn_length_samples_m = k_blk_samples_m.round() as usize;

		// Amplitude loops
		let input_amplitude:f64 = if self.cadll_init { 1.0 } else { amplitude_acc as f64 / prn_length as f64 };
		if self.cadll_init {
			self.a1 = self.amplitude_loop_filter.apply(input_amplitude / AMPLITUDE_NORMALIZATION);
			self.a2 = self.a1 / CADLL_INITIAL_AMPLITUDE_RATIO;
		} else {
			let t:f64 = prompt.re as f64 + prompt_m.re as f64;
			if t.abs() > std::f64::EPSILON {
				let d:f64 = input_amplitude / t;
				self.a1 = self.amplitude_loop_filter.apply(d * prompt.re as f64 / AMPLITUDE_NORMALIZATION);
				self.a2 = self.amplitude_loop_filter_m.apply(d * prompt_m.re as f64 / AMPLITUDE_NORMALIZATION);
			}
		}

		// CN0 estimation and lock detection
		if self.cn0_estimation_counter < CN0_ESTIMATION_SAMPLES {
			self.prompt_buffer[self.cn0_estimation_counter] = prompt;
			self.cn0_estimation_counter += 1;
		} else {
			self.cn0_estimation_counter = 0;
			self.cn0_db_hz = cn0_svn_estimator(&self.prompt_buffer, self.fs_in, GPS_L1_CA_CODE_LENGTH_CHIPS);
			self.carrier_lock_test = carrier_lock_detector(&self.prompt_buffer);
			if self.carrier_lock_test < CARRIER_LOCK_THRESHOLD || self.cn0_db_hz < MINIMUM_VALID_CN0 {
				self.carrier_lock_fail_counter += 1;
			} else if self.carrier_lock_fail_counter > 0 {
				self.carrier_lock_fail_counter -= 1;
			}
			if self.carrier_lock_fail_counter > MAXIMUM_LOCK_FAIL_COUNTER {
				info!("channel {}: loss of lock", self.channel);
				self.post(ControlMessage::LossOfLock{ channel: self.channel });
				self.carrier_lock_fail_counter = 0;
				self.enable_tracking = false;
			}
		}

		// Output record; the timestamp is aligned with the current PRN start
		synchro.prompt_i = prompt.re as f64;
		synchro.prompt_q = prompt.im as f64;
		synchro.tracking_timestamp_secs = (self.sample_counter as f64 + self.rem_code_phase_samples) / self.fs_in;

		// Remnant code phase, kept after the timestamp so the rounding error
		// stays below one sample; each loop rounds against its own length
		self.rem_code_phase_samples = k_blk_samples - self.current_prn_length_samples as f64;
		self.rem_code_phase_samples_m = k_blk_samples_m - self.current_prn_length_samples_m as f64;

		// One-shot promotion to full CADLL operation once the loops have had a
		// second to settle; the secondary is seeded a fixed offset away
		if self.cadll_init && synchro.tracking_timestamp_secs > 1.0 {
			self.cadll_init = false;
			self.acc_code_phase_secs_m = self.acc_code_phase_secs;
			self.rem_code_phase_samples_m = self.rem_code_phase_samples - self.cadll_secondary_seed_samples;
			info!("channel {}: CADLL secondary loop enabled, seeded {} samples from primary",
				self.channel, self.cadll_secondary_seed_samples);
		}

		synchro.code_phase_secs = 0.0;
		synchro.carrier_phase_rads = self.acc_carrier_phase_rad;
		synchro.carrier_doppler_hz = self.carrier_doppler_hz;
		synchro.cn0_db_hz = self.cn0_db_hz;
		synchro.flag_valid_tracking = true;

		if self.dump.is_some() {
			let rec = TrackingDumpRecord{
				abs_early: early.norm(),
				abs_prompt: prompt.norm(),
				abs_late: late.norm(),
				prompt_i: prompt.re,
				prompt_q: prompt.im,
				sample_counter: self.sample_counter,
				acc_carrier_phase_rad: self.acc_carrier_phase_rad as f32,
				carrier_doppler_hz: self.carrier_doppler_hz as f32,
				code_freq_chips: self.code_freq_chips as f32,
				carr_error_hz: carr_error_hz as f32,
				carr_error_filt_hz: carr_error_filt_hz as f32,
				code_error_chips: code_error_chips as f32,
				code_error_filt_chips: code_error_filt_chips as f32,
				cn0_db_hz: self.cn0_db_hz as f32,
				carrier_lock_test: self.carrier_lock_test as f32,
				rem_code_phase_samples: self.rem_code_phase_samples as f32,
				next_prn_start_samples: (self.sample_counter + self.current_prn_length_samples as u64) as f64 };
			if let Some(w) = self.dump.as_mut() {
				if w.write_record(&rec, &in_block[..prn_length]).is_err() {
					warn!("channel {}: tracking dump write failed, dumping disabled", self.channel);
					self.dump = None;
				}
			}
		}

		// Per-second progress line
		if (self.sample_counter as f64 / self.fs_in).floor() as u64 != self.last_seg {
			self.last_seg = (self.sample_counter as f64 / self.fs_in).floor() as u64;
			info!("channel {}: t = {} s, CN0 = {:.1} dB-Hz, lock = {:.3}, sample counter = {}",
				self.channel, self.last_seg, self.cn0_db_hz, self.carrier_lock_test, self.sample_counter);
		}

		let consumed:usize = self.current_prn_length_samples;
		self.sample_counter += consumed as u64;
		self.sample_counter_m += self.current_prn_length_samples_m as u64;

		Ok(TrackingStep{ consumed, record_ready: true })
	}

}

#[cfg(test)]
mod tests {

	use crossbeam_channel::{Receiver, unbounded};
	use rand_distr::{Distribution, Normal};
	use rustfft::num_complex::Complex;

	use crate::gnss::{ControlMessage, GnssSynchro};
	use crate::gnss::gps_l1_ca::{GPS_L1_FREQ_HZ, GPS_L1_CA_CODE_RATE_HZ, GPS_TWO_PI};
	use crate::gnss::gps_l1_ca::signal_modulation;
	use crate::utils::wrap_floor;

	use super::{Tracking, TrkConfig, new_cadll_tracker};

	const FS:f64 = 2.048e6;

	fn test_tracker() -> (Tracking, Receiver<ControlMessage>) {
		let (tx, rx) = unbounded();
		(new_cadll_tracker(TrkConfig::default(), 0, tx), rx)
	}

	fn acq_seed(prn:usize, delay_samples:f64, doppler_hz:f64) -> GnssSynchro {
		let mut synchro = GnssSynchro::new(prn);
		synchro.acq_delay_samples = delay_samples;
		synchro.acq_doppler_hz = doppler_hz;
		synchro.acq_samplestamp_samples = 0;
		synchro
	}

	/// Code plus carrier with Doppler-consistent code rate, starting at the
	/// given delay relative to sample zero.
	fn tracking_signal(prn:usize, n:usize, delay_samples:f64, doppler_hz:f64, amplitude:f32) -> Vec<Complex<f32>> {
		let code = signal_modulation::ca_code(prn, 0).unwrap();
		let code_freq:f64 = GPS_L1_CA_CODE_RATE_HZ * (1.0 + doppler_hz / GPS_L1_FREQ_HZ);
		(0..n).map(|idx| {
			let chip_phase:f64 = (idx as f64 - delay_samples) * code_freq / FS;
			let chip:f32 = code[wrap_floor(chip_phase, 1023)].re * amplitude;
			let carrier_phase:f64 = GPS_TWO_PI * doppler_hz * idx as f64 / FS;
			Complex{ re: chip * carrier_phase.cos() as f32, im: chip * carrier_phase.sin() as f32 }
		}).collect()
	}

	fn drive(trk:&mut Tracking, synchro:&mut GnssSynchro, signal:&[Complex<f32>], pos:&mut usize, periods:usize) {
		let wanted = trk.wanted();
		for _ in 0..periods {
			if !trk.enabled() || *pos + wanted > signal.len() { break; }
			let step = trk.process(&signal[*pos..*pos + wanted], synchro).unwrap();
			*pos += step.consumed;
		}
	}

	#[test]
	fn pull_in_aligns_to_the_next_prn_boundary() {
		let (mut trk, _rx) = test_tracker();
		let mut synchro = acq_seed(1, 317.0, 1500.0);
		trk.set_sample_counter(0);
		trk.start_tracking(&synchro).unwrap();

		let block:Vec<Complex<f32>> = vec![Complex{ re: 0.0, im: 0.0 }; trk.wanted()];
		let step = trk.process(&block, &mut synchro).unwrap();
		// Code phase plus one full period brings the block start onto a PRN edge
		assert_eq!(step.consumed, 317 + 2048);
		assert!(!step.record_ready);
		assert_eq!(trk.sample_counter(), 2365);
	}

	#[test]
	fn loops_converge_on_a_clean_signal() {
		let (mut trk, _rx) = test_tracker();
		let true_doppler:f64 = 1500.2;
		let signal = tracking_signal(1, 700_000, 317.3, true_doppler, 1.0);

		// Seed with the rounded estimates acquisition would deliver
		let mut synchro = acq_seed(1, 317.0, 1500.0);
		trk.set_sample_counter(0);
		trk.start_tracking(&synchro).unwrap();

		let mut pos:usize = 0;
		drive(&mut trk, &mut synchro, &signal, &mut pos, 301);

		assert!(trk.enabled());
		assert!(synchro.flag_valid_tracking);
		assert!(trk.cn0_db_hz() > 40.0, "cn0 was {}", trk.cn0_db_hz());
		assert!(trk.carrier_lock_test() > 0.9, "lock was {}", trk.carrier_lock_test());
		assert!((trk.carrier_doppler_hz() - true_doppler).abs() < 2.0, "doppler was {}", trk.carrier_doppler_hz());
		let expected_code_freq:f64 = GPS_L1_CA_CODE_RATE_HZ * (1.0 + true_doppler / GPS_L1_FREQ_HZ);
		assert!((trk.code_freq_chips() - expected_code_freq).abs() < 0.01);
		assert!(synchro.prompt_i.abs() > 1500.0, "prompt was {}", synchro.prompt_i);
	}

	#[test]
	fn sustained_noise_trips_the_lock_detector_exactly_once() {
		let (mut trk, rx) = test_tracker();
		let signal = tracking_signal(1, 140_000, 317.0, 1500.0, 1.0);
		let mut synchro = acq_seed(1, 317.0, 1500.0);
		trk.set_sample_counter(0);
		trk.start_tracking(&synchro).unwrap();

		let mut pos:usize = 0;
		drive(&mut trk, &mut synchro, &signal, &mut pos, 61);
		assert!(trk.enabled());

		let normal = Normal::new(0.0f32, 1.0).unwrap();
		let mut rng = rand::thread_rng();
		let noise:Vec<Complex<f32>> = (0..6_400_000).map(|_| Complex{ re: normal.sample(&mut rng), im: normal.sample(&mut rng) }).collect();

		let mut noise_pos:usize = 0;
		drive(&mut trk, &mut synchro, &noise, &mut noise_pos, 3000);

		assert!(!trk.enabled(), "tracking survived {} samples of noise", noise_pos);
		let messages:Vec<ControlMessage> = rx.try_iter().collect();
		assert_eq!(messages, vec![ControlMessage::LossOfLock{ channel: 0 }]);

		// Once disabled the loop consumes nothing until restarted
		let step = trk.process(&noise[..trk.wanted()], &mut synchro).unwrap();
		assert_eq!(step.consumed, 0);
	}

	#[test]
	fn secondary_loop_holds_a_second_path_after_promotion() {
		let (mut trk, _rx) = test_tracker();

		// Two-path channel: direct at 400 samples, second path 27 samples
		// earlier at about -2 dB
		let n:usize = 2_800_000;
		let direct = tracking_signal(1, n, 400.0, 0.0, 1.0);
		let second = tracking_signal(1, n, 373.0, 0.0, 0.78);
		let signal:Vec<Complex<f32>> = direct.iter().zip(second.iter()).map(|(a, b)| a + b).collect();

		let mut synchro = acq_seed(1, 400.0, 0.0);
		trk.set_sample_counter(0);
		trk.start_tracking(&synchro).unwrap();

		let mut pos:usize = 0;
		drive(&mut trk, &mut synchro, &signal, &mut pos, 1010);
		assert!(trk.cadll_promoted(), "timestamp only reached {}", synchro.tracking_timestamp_secs);

		drive(&mut trk, &mut synchro, &signal, &mut pos, 300);
		assert!(trk.enabled());

		let separation:f64 = trk.secondary_offset_samples();
		assert!(separation > 25.0 && separation < 29.0, "separation was {}", separation);

		let (a1, a2) = trk.amplitudes();
		assert!(a1 > 0.0 && a2 > 0.0);
		let ratio:f64 = a2 / a1;
		assert!(ratio > 0.55 && ratio < 1.0, "amplitude ratio was {}", ratio);
	}

	#[test]
	fn nan_input_yields_an_invalid_record() {
		let (mut trk, _rx) = test_tracker();
		let mut synchro = acq_seed(1, 0.0, 0.0);
		trk.set_sample_counter(0);
		trk.start_tracking(&synchro).unwrap();

		let zeros:Vec<Complex<f32>> = vec![Complex{ re: 0.0, im: 0.0 }; trk.wanted()];
		trk.process(&zeros, &mut synchro).unwrap();	// pull-in

		let mut bad = zeros.clone();
		bad[512].im = std::f32::NAN;
		let step = trk.process(&bad, &mut synchro).unwrap();
		assert!(step.record_ready);
		assert_eq!(step.consumed, bad.len());
		assert!(!synchro.flag_valid_tracking);
		assert_eq!(synchro.prompt_i, 0.0);
	}

	#[test]
	fn stop_tracking_posts_one_terminating_message() {
		let (mut trk, rx) = test_tracker();
		let mut synchro = acq_seed(1, 100.0, 0.0);
		trk.set_sample_counter(0);
		trk.start_tracking(&synchro).unwrap();

		trk.stop_tracking();
		assert!(!trk.enabled());
		let messages:Vec<ControlMessage> = rx.try_iter().collect();
		assert_eq!(messages, vec![ControlMessage::LossOfLock{ channel: 0 }]);

		let block:Vec<Complex<f32>> = vec![Complex{ re: 0.0, im: 0.0 }; trk.wanted()];
		let step = trk.process(&block, &mut synchro).unwrap();
		assert_eq!(step.consumed, 0);
	}

}
