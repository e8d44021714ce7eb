
use std::sync::Arc;

use rustfft::{FFT, FFTplanner};
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;

use crate::DigSigProcErr;

/// Forward and inverse FFT plans over a fixed size, with reusable scratch so the
/// hot correlation loop never allocates.  Neither direction normalizes; callers
/// compensate for the factor of len introduced by the unscaled inverse.
pub struct FftKernel {
	len: usize,
	fft:  Arc<dyn FFT<f32>>,
	ifft: Arc<dyn FFT<f32>>,
	scratch: Vec<Complex<f32>>,
}

impl FftKernel {

	pub fn new(len:usize) -> Self {
		let fft  = FFTplanner::new(false).plan_fft(len);
		let ifft = FFTplanner::new(true).plan_fft(len);
		let scratch:Vec<Complex<f32>> = vec![Complex::zero(); len];
		Self{ len, fft, ifft, scratch }
	}

	pub fn len(&self) -> usize { self.len }

	fn check(&self, n:usize) -> Result<(), DigSigProcErr> {
		if n == self.len { Ok(()) } else { Err(DigSigProcErr::FftSizeMismatch{ expected: self.len, got: n }) }
	}

	pub fn forward(&mut self, time_domain:&[Complex<f32>], freq_domain:&mut [Complex<f32>]) -> Result<(), DigSigProcErr> {
		self.check(time_domain.len())?;
		self.check(freq_domain.len())?;
		self.scratch.copy_from_slice(time_domain);
		self.fft.process(&mut self.scratch, freq_domain);
		Ok(())
	}

	pub fn inverse(&mut self, freq_domain:&[Complex<f32>], time_domain:&mut [Complex<f32>]) -> Result<(), DigSigProcErr> {
		self.check(freq_domain.len())?;
		self.check(time_domain.len())?;
		self.scratch.copy_from_slice(freq_domain);
		self.ifft.process(&mut self.scratch, time_domain);
		Ok(())
	}

}

#[cfg(test)]
mod tests {

	use rand::Rng;
	use rustfft::num_complex::Complex;
	use rustfft::num_traits::Zero;

	use super::FftKernel;
	use crate::DigSigProcErr;

	#[test]
	fn forward_then_inverse_recovers_input() {
		let n:usize = 2048;
		let mut rng = rand::thread_rng();
		let x:Vec<Complex<f32>> = (0..n).map(|_| Complex{ re: rng.gen_range(-1.0..1.0), im: rng.gen_range(-1.0..1.0) }).collect();

		let mut kernel = FftKernel::new(n);
		let mut freq:Vec<Complex<f32>> = vec![Complex::zero(); n];
		let mut time:Vec<Complex<f32>> = vec![Complex::zero(); n];
		kernel.forward(&x, &mut freq).unwrap();
		kernel.inverse(&freq, &mut time).unwrap();

		for (a, b) in x.iter().zip(time.iter()) {
			let b_scaled = *b / (n as f32);
			assert!((a.re - b_scaled.re).abs() < 1.0e-5);
			assert!((a.im - b_scaled.im).abs() < 1.0e-5);
		}
	}

	#[test]
	fn size_mismatch_is_an_error() {
		let mut kernel = FftKernel::new(1024);
		let x:Vec<Complex<f32>> = vec![Complex::zero(); 512];
		let mut y:Vec<Complex<f32>> = vec![Complex::zero(); 1024];
		assert_eq!(kernel.forward(&x, &mut y), Err(DigSigProcErr::FftSizeMismatch{ expected: 1024, got: 512 }));
	}

}
