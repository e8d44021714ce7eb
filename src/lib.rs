
use rustfft::num_complex::Complex;

pub mod filters;
pub mod fourier_analysis;
pub mod io;
pub mod gnss;
pub mod utils;

#[derive(Debug, Clone, Copy)]
pub struct Sample {
	pub val: Complex<f32>,
	pub idx: u64,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum DigSigProcErr {
	LossOfLock,
	FftSizeMismatch{ expected:usize, got:usize },
	InvalidPrn(usize),
	Other(&'static str),
}
