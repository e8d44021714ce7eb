
use std::path::PathBuf;

use crossbeam_channel::Sender;
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;

use crate::DigSigProcErr;
use crate::fourier_analysis::FftKernel;
use crate::gnss::ControlMessage;
use crate::gnss::gps_l1_ca::signal_modulation;

pub mod pcps;

#[derive(Debug, Clone)]
pub struct AcquisitionResult {
	pub code_phase_samples: f64,
	pub doppler_hz: f64,
	pub samplestamp_samples: u64,
	pub test_statistic: f64,
	pub mag: f64,
	pub mag_2nd_highest: f64,
}

#[derive(Debug, Clone)]
pub struct AcqConfig {
	pub sampled_ms: usize,
	pub max_dwells: usize,
	pub doppler_max_hz: f64,
	pub doppler_step_hz: f64,
	pub if_freq_hz: f64,
	pub fs_in: f64,
	pub samples_per_ms: usize,
	pub samples_per_code: usize,
	pub bit_transition_flag: bool,
	pub num_peaks: usize,
	pub threshold: f64,
	pub peak_separation_samples: f64,
	pub dump: Option<PathBuf>,
}

impl AcqConfig {

	pub fn fft_size(&self) -> usize { self.sampled_ms * self.samples_per_ms }

	pub fn num_doppler_bins(&self) -> usize {
		(2.0 * self.doppler_max_hz / self.doppler_step_hz) as usize + 1
	}

	pub fn doppler_bin_hz(&self, bin:usize) -> f64 {
		-self.doppler_max_hz + self.doppler_step_hz * (bin as f64)
	}

}

impl Default for AcqConfig {
	fn default() -> Self {
		AcqConfig{ sampled_ms: 1, max_dwells: 2, doppler_max_hz: 5000.0, doppler_step_hz: 500.0,
			if_freq_hz: 0.0, fs_in: 2.048e6, samples_per_ms: 2048, samples_per_code: 2048,
			bit_transition_flag: false, num_peaks: 1, threshold: 0.1,
			peak_separation_samples: 2.0 * 2048.0 / 1023.0, dump: None }
	}
}

/// Builds the PCPS engine for one satellite: FFT plans, the conjugated
/// frequency-domain local code and the precomputed Doppler wipeoff grid.
pub fn make_acquisition(cfg:AcqConfig, channel:usize, prn:usize, queue:Sender<ControlMessage>) -> Result<pcps::Acquisition, DigSigProcErr> {
	let fft_size:usize = cfg.fft_size();
	let mut fft = FftKernel::new(fft_size);
	let fft_codes:Vec<Complex<f32>> = local_code_freq_domain(&mut fft, prn, cfg.fs_in, cfg.samples_per_code)?;

	let mut grid_doppler_wipeoffs:Vec<Vec<Complex<f32>>> = Vec::with_capacity(cfg.num_doppler_bins());
	for bin in 0..cfg.num_doppler_bins() {
		let mut wipeoff:Vec<Complex<f32>> = vec![Complex::zero(); fft_size];
		signal_modulation::complex_exp_gen_conj(&mut wipeoff, cfg.if_freq_hz + cfg.doppler_bin_hz(bin), cfg.fs_in);
		grid_doppler_wipeoffs.push(wipeoff);
	}

	Ok(pcps::Acquisition::new(cfg, channel, prn, fft, fft_codes, grid_doppler_wipeoffs, queue))
}

/// Conjugate of the FFT of the local code, zero-padded to the FFT size.
pub fn local_code_freq_domain(fft:&mut FftKernel, prn:usize, fs:f64, samples_per_code:usize) -> Result<Vec<Complex<f32>>, DigSigProcErr> {
	let code_i8:Vec<i8> = signal_modulation::prn_int_sampled(prn, fs)?;
	if code_i8.len() != samples_per_code {
		return Err(DigSigProcErr::FftSizeMismatch{ expected: samples_per_code, got: code_i8.len() });
	}

	let mut code_time_domain:Vec<Complex<f32>> = vec![Complex::zero(); fft.len()];
	for (out, chip) in code_time_domain.iter_mut().zip(code_i8.iter()) {
		out.re = *chip as f32;
	}

	let mut code_freq_domain:Vec<Complex<f32>> = vec![Complex::zero(); fft.len()];
	fft.forward(&code_time_domain, &mut code_freq_domain)?;
	Ok(code_freq_domain.iter().map(|p| p.conj()).collect())
}
