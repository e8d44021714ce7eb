
use crossbeam_channel::Sender;
use itertools::Itertools;
use log::{info, warn};
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;

use crate::DigSigProcErr;
use crate::fourier_analysis::FftKernel;
use crate::gnss::{ControlMessage, GnssSynchro};
use crate::io;

use super::{AcqConfig, AcquisitionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqState {
	Idle,
	Dwell,
	Positive,
	Negative,
}

/// Parallel code phase search over a precomputed Doppler grid.
///
/// Strategy (Kay Borre book + CFAR threshold):
/// 1. compute the input signal power estimation
/// 2. Doppler serial search loop
/// 3. FFT-based circular convolution (parallel time search)
/// 4. record the maximum peak and associated synchronization parameters
/// 5. compute the test statistic and compare to the threshold
/// 6. declare positive or negative acquisition through the message queue
pub struct Acquisition {
	pub channel: usize,
	pub prn: usize,
	cfg: AcqConfig,
	state: AcqState,
	active: bool,
	fft: FftKernel,
	fft_codes: Vec<Complex<f32>>,
	grid_doppler_wipeoffs: Vec<Vec<Complex<f32>>>,
	magnitude: Vec<f32>,
	wiped: Vec<Complex<f32>>,
	freq_domain: Vec<Complex<f32>>,
	correlation: Vec<Complex<f32>>,
	well_count: usize,
	sample_counter: u64,
	mag: f64,
	mag_2nd_highest: f64,
	input_power: f64,
	test_statistics: f64,
	nan_block_count: usize,
	dump_enabled: bool,
	queue: Sender<ControlMessage>,
}

impl Acquisition {

	pub fn new(cfg:AcqConfig, channel:usize, prn:usize, fft:FftKernel, fft_codes:Vec<Complex<f32>>,
			   grid_doppler_wipeoffs:Vec<Vec<Complex<f32>>>, queue:Sender<ControlMessage>) -> Self {
		let fft_size:usize = cfg.fft_size();
		let dump_enabled:bool = cfg.dump.is_some();
		Acquisition{ channel, prn, cfg, state: AcqState::Idle, active: false,
			fft, fft_codes, grid_doppler_wipeoffs,
			magnitude: vec![0.0; fft_size],
			wiped: vec![Complex::zero(); fft_size],
			freq_domain: vec![Complex::zero(); fft_size],
			correlation: vec![Complex::zero(); fft_size],
			well_count: 0, sample_counter: 0,
			mag: 0.0, mag_2nd_highest: 0.0, input_power: 0.0, test_statistics: 0.0,
			nan_block_count: 0, dump_enabled, queue }
	}

	pub fn state(&self) -> AcqState { self.state }
	pub fn well_count(&self) -> usize { self.well_count }
	pub fn sample_counter(&self) -> u64 { self.sample_counter }
	pub fn test_statistics(&self) -> f64 { self.test_statistics }
	pub fn mag_2nd_highest(&self) -> f64 { self.mag_2nd_highest }
	pub fn nan_block_count(&self) -> usize { self.nan_block_count }
	pub fn fft_size(&self) -> usize { self.cfg.fft_size() }

	pub fn set_active(&mut self, active:bool) { self.active = active; }

	/// Aligns the dwell sample stamps with the channel's stream position after
	/// another stage has been consuming samples.
	pub fn set_sample_counter(&mut self, counter:u64) { self.sample_counter = counter; }

	/// Recomputes the frequency-domain local code; only needed when the channel
	/// is retasked to a different satellite.
	pub fn set_prn(&mut self, prn:usize) -> Result<(), DigSigProcErr> {
		if prn != self.prn {
			self.prn = prn;
			self.fft_codes = super::local_code_freq_domain(&mut self.fft, prn, self.cfg.fs_in, self.cfg.samples_per_code)?;
		}
		Ok(())
	}

	fn post(&self, msg:ControlMessage) {
		if self.queue.send(msg).is_err() {
			warn!("channel {}: control queue disconnected", self.channel);
		}
	}

	/// Runs one dwell over a block of fft_size samples.  Returns the accepted
	/// acquisition result when the search turns positive.
	pub fn process_block(&mut self, in_block:&[Complex<f32>], synchro:&mut GnssSynchro) -> Result<Option<AcquisitionResult>, DigSigProcErr> {
		match self.state {
			AcqState::Positive | AcqState::Negative => {
				self.state = AcqState::Idle;
				self.sample_counter += in_block.len() as u64;
				Ok(None)
			},
			AcqState::Idle => {
				if self.active {
					synchro.acq_delay_samples = 0.0;
					synchro.acq_doppler_hz = 0.0;
					synchro.acq_samplestamp_samples = 0;
					self.well_count = 0;
					self.mag = 0.0;
					self.mag_2nd_highest = 0.0;
					self.input_power = 0.0;
					self.test_statistics = 0.0;
					self.state = AcqState::Dwell;
				}
				self.sample_counter += in_block.len() as u64;
				Ok(None)
			},
			AcqState::Dwell => self.dwell(in_block, synchro),
		}
	}

	fn dwell(&mut self, in_block:&[Complex<f32>], synchro:&mut GnssSynchro) -> Result<Option<AcquisitionResult>, DigSigProcErr> {
		let fft_size:usize = self.cfg.fft_size();
		if in_block.len() != fft_size {
			return Err(DigSigProcErr::FftSizeMismatch{ expected: fft_size, got: in_block.len() });
		}

		if in_block.iter().any(|x| !x.re.is_finite() || !x.im.is_finite()) {
			self.nan_block_count += 1;
			self.sample_counter += fft_size as u64;
			warn!("channel {}: NaN samples at sample number {}, block skipped", self.channel, self.sample_counter);
			return Ok(None);
		}

		self.sample_counter += fft_size as u64;
		self.well_count += 1;

		let fft_normalization_factor:f64 = (fft_size as f64) * (fft_size as f64);
		let energy_normalization:f64 = fft_normalization_factor * fft_normalization_factor;

		// 1- input signal power estimation
		let mut power_acc:f32 = 0.0;
		for x in in_block { power_acc += x.re * x.re + x.im * x.im; }
		self.input_power = (power_acc as f64) / (fft_size as f64);

		self.mag = 0.0;
		self.mag_2nd_highest = 0.0;

		// Threshold kept in un-normalized units so the peak scan avoids division
		let threshold_spoofing:f64 = self.cfg.threshold * self.input_power * energy_normalization;

		let acquire_auxiliary_peaks:bool = self.cfg.num_peaks > 1;
		let mut peaks:Vec<(f64, usize, f64)> = vec![];

		// 2- Doppler frequency search loop
		for doppler_index in 0..self.cfg.num_doppler_bins() {
			let doppler:f64 = self.cfg.doppler_bin_hz(doppler_index);

			for (out, (x, w)) in self.wiped.iter_mut().zip(in_block.iter().zip(self.grid_doppler_wipeoffs[doppler_index].iter())) {
				*out = x * w;
			}

			// 3- FFT-based circular convolution (parallel time search)
			self.fft.forward(&self.wiped, &mut self.freq_domain)?;
			for (out, code) in self.freq_domain.iter_mut().zip(self.fft_codes.iter()) {
				*out = *out * code;
			}
			self.fft.inverse(&self.freq_domain, &mut self.correlation)?;

			let mut indext:usize = 0;
			let mut max_magnitude:f32 = 0.0;
			for (idx, (corr, mag_out)) in self.correlation.iter().zip(self.magnitude.iter_mut()).enumerate() {
				*mag_out = corr.norm_sqr();
				if *mag_out > max_magnitude {
					max_magnitude = *mag_out;
					indext = idx;
				}
			}
			let magt:f64 = (max_magnitude as f64) / energy_normalization;

			if acquire_auxiliary_peaks {
				for (idx, mag_out) in self.magnitude.iter().enumerate() {
					if (*mag_out as f64) > threshold_spoofing {
						peaks.push(((*mag_out as f64) / energy_normalization, idx % self.cfg.samples_per_code, doppler));
					}
				}
			}

			// 4- record the maximum peak and associated synchronization parameters
			if self.mag < magt {
				self.mag_2nd_highest = self.mag;
				self.mag = magt;

				// With the bit transition flag set, the statistic survives across
				// dwells and the candidate only moves when it improves.
				if self.test_statistics < self.mag / self.input_power || !self.cfg.bit_transition_flag {
					synchro.acq_delay_samples = (indext % self.cfg.samples_per_code) as f64;
					synchro.acq_doppler_hz = doppler;
					synchro.acq_samplestamp_samples = self.sample_counter;
					// 5- test statistic
					self.test_statistics = self.mag / self.input_power;
				}
			}

			if self.dump_enabled {
				if let Some(dir) = &self.cfg.dump {
					if let Err(_) = io::dump_acquisition_grid(dir, synchro.system, synchro.signal, self.prn, doppler, &self.magnitude) {
						warn!("channel {}: acquisition dump failed, dumping disabled", self.channel);
						self.dump_enabled = false;
					}
				}
			}
		}

		// Auxiliary-peak resolution: rank the threshold crossings and walk the
		// list keeping only peaks disjoint from every peak already kept.  The
		// channel then acquires the num_peaks-th disjoint peak.
		let mut found_aux_peak:bool = false;
		if acquire_auxiliary_peaks {
			let mut selected:Vec<(f64, usize, f64)> = vec![];
			for candidate in peaks.into_iter().sorted_by(|a, b| b.0.partial_cmp(&a.0).unwrap()) {
				let disjoint:bool = selected.iter().all(|peak| {
					candidate.2 != peak.2 || ((candidate.1 as f64) - (peak.1 as f64)).abs() > self.cfg.peak_separation_samples
				});
				if disjoint {
					selected.push(candidate);
					if selected.len() == self.cfg.num_peaks {
						let (peak_mag, code_phase, doppler) = candidate;
						self.test_statistics = peak_mag / self.input_power;
						synchro.acq_delay_samples = code_phase as f64;
						synchro.acq_doppler_hz = doppler;
						synchro.acq_samplestamp_samples = self.sample_counter;
						found_aux_peak = true;
						break;
					}
				}
			}
		}

		// 6- decision
		let verdict:Option<bool> = if !self.cfg.bit_transition_flag {
			if acquire_auxiliary_peaks && !found_aux_peak { Some(false) }
			else if self.test_statistics > self.cfg.threshold { Some(true) }
			else if self.well_count == self.cfg.max_dwells { Some(false) }
			else { None }
		} else {
			if self.well_count == self.cfg.max_dwells {
				if acquire_auxiliary_peaks && !found_aux_peak { Some(false) }
				else if self.test_statistics > self.cfg.threshold { Some(true) }
				else { Some(false) }
			} else { None }
		};

		match verdict {
			Some(true) => {
				info!("channel {}: positive acquisition of PRN {}, test statistic {:.4}, code phase {}, doppler {}",
					self.channel, self.prn, self.test_statistics, synchro.acq_delay_samples, synchro.acq_doppler_hz);
				self.state = AcqState::Positive;
				self.active = false;
				self.post(ControlMessage::AcqSuccess{ channel: self.channel });
				Ok(Some(AcquisitionResult{
					code_phase_samples: synchro.acq_delay_samples,
					doppler_hz: synchro.acq_doppler_hz,
					samplestamp_samples: synchro.acq_samplestamp_samples,
					test_statistic: self.test_statistics,
					mag: self.mag,
					mag_2nd_highest: self.mag_2nd_highest }))
			},
			Some(false) => {
				info!("channel {}: negative acquisition of PRN {}, test statistic {:.4} after {} dwells",
					self.channel, self.prn, self.test_statistics, self.well_count);
				self.state = AcqState::Negative;
				self.active = false;
				self.post(ControlMessage::AcqFail{ channel: self.channel });
				Ok(None)
			},
			None => Ok(None),
		}
	}

}

#[cfg(test)]
mod tests {

	use crossbeam_channel::{Receiver, unbounded};
	use rand_distr::{Distribution, Normal};
	use rustfft::num_complex::Complex;
	use rustfft::num_traits::Zero;

	use crate::gnss::{ControlMessage, GnssSynchro};
	use crate::gnss::common::acquisition::{AcqConfig, make_acquisition};
	use crate::gnss::gps_l1_ca::signal_modulation;

	use super::{Acquisition, AcqState};

	const FS:f64 = 2.048e6;

	fn test_acquisition(cfg:AcqConfig, prn:usize) -> (Acquisition, Receiver<ControlMessage>) {
		let (tx, rx) = unbounded();
		(make_acquisition(cfg, 0, prn, tx).unwrap(), rx)
	}

	/// Code-periodic signal with the given delay, Doppler and amplitude.
	fn synthetic_signal(prn:usize, n:usize, delay_samples:usize, doppler_hz:f64, amplitude:f32) -> Vec<Complex<f32>> {
		let code:Vec<i8> = signal_modulation::prn_int_sampled(prn, FS).unwrap();
		let spc:usize = code.len();
		let mut carrier:Vec<Complex<f32>> = vec![Complex::zero(); n];
		signal_modulation::complex_exp_gen(&mut carrier, doppler_hz, FS);
		(0..n).map(|idx| {
			let chip:f32 = code[(idx + spc - delay_samples % spc) % spc] as f32;
			carrier[idx] * chip * amplitude
		}).collect()
	}

	fn awgn(n:usize, sigma:f32) -> Vec<Complex<f32>> {
		let normal = Normal::new(0.0f32, sigma).unwrap();
		let mut rng = rand::thread_rng();
		(0..n).map(|_| Complex{ re: normal.sample(&mut rng), im: normal.sample(&mut rng) }).collect()
	}

	#[test]
	fn clean_signal_acquired_in_one_dwell() {
		let cfg = AcqConfig::default();
		let fft_size = cfg.fft_size();
		let (mut acq, rx) = test_acquisition(cfg, 1);
		let mut synchro = GnssSynchro::new(1);

		let signal = synthetic_signal(1, 2 * fft_size, 317, 1500.0, 1.0);

		acq.set_active(true);
		// Activation block is consumed without searching
		assert!(acq.process_block(&signal[..fft_size], &mut synchro).unwrap().is_none());
		assert_eq!(acq.state(), AcqState::Dwell);

		let result = acq.process_block(&signal[fft_size..], &mut synchro).unwrap().expect("expected a positive acquisition");
		assert_eq!(acq.state(), AcqState::Positive);
		assert_eq!(result.code_phase_samples, 317.0);
		assert_eq!(result.doppler_hz, 1500.0);
		assert!(result.test_statistic > 0.5);
		assert_eq!(synchro.acq_delay_samples, 317.0);
		assert_eq!(synchro.acq_doppler_hz, 1500.0);
		assert_eq!(rx.try_recv(), Ok(ControlMessage::AcqSuccess{ channel: 0 }));
	}

	#[test]
	fn noise_only_goes_negative_after_max_dwells() {
		let cfg = AcqConfig::default();
		let fft_size = cfg.fft_size();
		let max_dwells = cfg.max_dwells;
		let (mut acq, rx) = test_acquisition(cfg, 1);
		let mut synchro = GnssSynchro::new(1);

		acq.set_active(true);
		acq.process_block(&awgn(fft_size, 1.0), &mut synchro).unwrap();
		for _ in 0..max_dwells {
			assert!(acq.process_block(&awgn(fft_size, 1.0), &mut synchro).unwrap().is_none());
		}
		assert_eq!(acq.state(), AcqState::Negative);
		assert_eq!(acq.well_count(), max_dwells);
		assert_eq!(rx.try_recv(), Ok(ControlMessage::AcqFail{ channel: 0 }));
	}

	#[test]
	fn nan_block_is_skipped_without_counting_a_dwell() {
		let cfg = AcqConfig::default();
		let fft_size = cfg.fft_size();
		let (mut acq, _rx) = test_acquisition(cfg, 1);
		let mut synchro = GnssSynchro::new(1);

		acq.set_active(true);
		acq.process_block(&vec![Complex::zero(); fft_size], &mut synchro).unwrap();

		let mut bad = awgn(fft_size, 1.0);
		bad[100].re = std::f32::NAN;
		assert!(acq.process_block(&bad, &mut synchro).unwrap().is_none());
		assert_eq!(acq.well_count(), 0);
		assert_eq!(acq.nan_block_count(), 1);
		assert_eq!(acq.state(), AcqState::Dwell);
	}

	#[test]
	fn bit_transition_mode_always_takes_two_dwells() {
		let mut cfg = AcqConfig::default();
		cfg.bit_transition_flag = true;
		cfg.max_dwells = 2;
		let fft_size = cfg.fft_size();
		let (mut acq, rx) = test_acquisition(cfg, 1);
		let mut synchro = GnssSynchro::new(1);

		let signal = synthetic_signal(1, 3 * fft_size, 100, -250.0, 1.0);

		acq.set_active(true);
		acq.process_block(&signal[..fft_size], &mut synchro).unwrap();

		// Strong signal, but no decision after the first dwell
		assert!(acq.process_block(&signal[fft_size..2*fft_size], &mut synchro).unwrap().is_none());
		assert_eq!(acq.state(), AcqState::Dwell);
		assert!(rx.try_recv().is_err());

		let result = acq.process_block(&signal[2*fft_size..], &mut synchro).unwrap().expect("expected a positive acquisition");
		assert_eq!(acq.state(), AcqState::Positive);
		assert_eq!(result.code_phase_samples, 100.0);
		// -250 Hz sits off-grid; the winning bin is within one step
		assert!((result.doppler_hz - (-250.0)).abs() <= 250.0);
		assert_eq!(rx.try_recv(), Ok(ControlMessage::AcqSuccess{ channel: 0 }));
	}

	#[test]
	fn auxiliary_peak_mode_reports_the_second_disjoint_peak() {
		let mut cfg = AcqConfig::default();
		cfg.num_peaks = 2;
		let fft_size = cfg.fft_size();
		let (mut acq, rx) = test_acquisition(cfg, 1);
		let mut synchro = GnssSynchro::new(1);

		let direct = synthetic_signal(1, 2 * fft_size, 10, 0.0, 1.0);
		let echo   = synthetic_signal(1, 2 * fft_size, 500, 0.0, 0.8);
		let composite:Vec<Complex<f32>> = direct.iter().zip(echo.iter()).map(|(a, b)| a + b).collect();

		acq.set_active(true);
		acq.process_block(&composite[..fft_size], &mut synchro).unwrap();
		let result = acq.process_block(&composite[fft_size..], &mut synchro).unwrap().expect("expected a positive acquisition");

		assert!((result.code_phase_samples - 500.0).abs() <= 1.0, "aux peak at {}", result.code_phase_samples);
		assert_eq!(result.doppler_hz, 0.0);
		assert_eq!(rx.try_recv(), Ok(ControlMessage::AcqSuccess{ channel: 0 }));
	}

	#[test]
	fn single_peak_mode_reports_the_strongest_path() {
		let cfg = AcqConfig::default();
		let fft_size = cfg.fft_size();
		let (mut acq, _rx) = test_acquisition(cfg, 1);
		let mut synchro = GnssSynchro::new(1);

		let direct = synthetic_signal(1, 2 * fft_size, 10, 0.0, 1.0);
		let echo   = synthetic_signal(1, 2 * fft_size, 500, 0.0, 0.8);
		let composite:Vec<Complex<f32>> = direct.iter().zip(echo.iter()).map(|(a, b)| a + b).collect();

		acq.set_active(true);
		acq.process_block(&composite[..fft_size], &mut synchro).unwrap();
		let result = acq.process_block(&composite[fft_size..], &mut synchro).unwrap().expect("expected a positive acquisition");
		assert_eq!(result.code_phase_samples, 10.0);
	}

	#[test]
	fn signal_at_zero_db_snr_recovered_within_one_sample() {
		let cfg = AcqConfig::default();
		let fft_size = cfg.fft_size();
		let (mut acq, _rx) = test_acquisition(cfg, 3);
		let mut synchro = GnssSynchro::new(3);

		let clean = synthetic_signal(3, 2 * fft_size, 1000, -2000.0, 1.0);
		let noise = awgn(2 * fft_size, 1.0);
		let noisy:Vec<Complex<f32>> = clean.iter().zip(noise.iter()).map(|(s, n)| s + n).collect();

		acq.set_active(true);
		acq.process_block(&noisy[..fft_size], &mut synchro).unwrap();
		let result = acq.process_block(&noisy[fft_size..], &mut synchro).unwrap().expect("expected a positive acquisition");
		assert!((result.code_phase_samples - 1000.0).abs() <= 1.0);
		assert_eq!(result.doppler_hz, -2000.0);
	}

}
