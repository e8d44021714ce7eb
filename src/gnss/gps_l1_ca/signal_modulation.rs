
use rustfft::num_complex::Complex;

use crate::DigSigProcErr;
use crate::utils::wrap_floor;

use super::GPS_L1_CA_CODE_RATE_HZ;

pub const CA_CODE_LENGTH_CHIPS:usize = 1023;

// G2 output phase selection, one tap pair per PRN 1 through 32
const G2_PHASE_TAPS:[(usize, usize); 32] = [
	( 2,  6), ( 3,  7), ( 4,  8), ( 5,  9), ( 1,  9), ( 2, 10), ( 1,  8), ( 2,  9),
	( 3, 10), ( 2,  3), ( 3,  4), ( 5,  6), ( 6,  7), ( 7,  8), ( 8,  9), ( 9, 10),
	( 1,  4), ( 2,  5), ( 3,  6), ( 4,  7), ( 5,  8), ( 6,  9), ( 1,  3), ( 4,  6),
	( 5,  7), ( 6,  8), ( 7,  9), ( 8, 10), ( 1,  6), ( 2,  7), ( 3,  8), ( 4,  9)];

fn ca_code_bits(prn:usize) -> Result<[bool; CA_CODE_LENGTH_CHIPS], DigSigProcErr> {
	if prn < 1 || prn > 32 { return Err(DigSigProcErr::InvalidPrn(prn)); }

	let (t1, t2) = G2_PHASE_TAPS[prn-1];
	let mut g1:[bool; 10] = [true; 10];
	let mut g2:[bool; 10] = [true; 10];
	let mut chips:[bool; CA_CODE_LENGTH_CHIPS] = [false; CA_CODE_LENGTH_CHIPS];

	for chip in chips.iter_mut() {
		*chip = g1[9] ^ g2[t1-1] ^ g2[t2-1];

		let g1_fb:bool = g1[2] ^ g1[9];
		let g2_fb:bool = g2[1] ^ g2[2] ^ g2[5] ^ g2[7] ^ g2[8] ^ g2[9];
		for idx in (1..10).rev() {
			g1[idx] = g1[idx-1];
			g2[idx] = g2[idx-1];
		}
		g1[0] = g1_fb;
		g2[0] = g2_fb;
	}

	Ok(chips)
}

/// One period of the C/A code for this PRN as +/-1 complex chips, starting at
/// the given chip offset.
pub fn ca_code(prn:usize, chip_offset:usize) -> Result<Vec<Complex<f32>>, DigSigProcErr> {
	let bits = ca_code_bits(prn)?;
	Ok((0..CA_CODE_LENGTH_CHIPS).map(|idx| {
		let bit:bool = bits[(idx + chip_offset) % CA_CODE_LENGTH_CHIPS];
		Complex{ re: if bit { 1.0 } else { -1.0 }, im: 0.0 }
	}).collect())
}

/// The code with one guard chip on each side ([0] holds the last chip, [1024]
/// the first) so fractional-sample replica windows never index out of range.
pub fn ca_code_padded(prn:usize) -> Result<Vec<Complex<f32>>, DigSigProcErr> {
	let code = ca_code(prn, 0)?;
	let mut padded:Vec<Complex<f32>> = Vec::with_capacity(CA_CODE_LENGTH_CHIPS + 2);
	padded.push(code[CA_CODE_LENGTH_CHIPS - 1]);
	padded.extend_from_slice(&code);
	padded.push(code[0]);
	Ok(padded)
}

/// One code period resampled at fs, as integer chips for the acquisition
/// local-code FFT.
pub fn prn_int_sampled(prn:usize, fs:f64) -> Result<Vec<i8>, DigSigProcErr> {
	let bits = ca_code_bits(prn)?;
	let samples_per_code:usize = (fs * 1.0e-3).round() as usize;
	Ok((0..samples_per_code).map(|idx| {
		let chip:usize = wrap_floor((idx as f64) * GPS_L1_CA_CODE_RATE_HZ / fs, CA_CODE_LENGTH_CHIPS);
		if bits[chip] { 1i8 } else { -1i8 }
	}).collect())
}

const PHASE_TURNS:f64 = 4294967296.0;	// 2^32, one full turn of the fixed-point accumulator

/// out[i] = exp(j 2 pi freq i / fs).  The phase accumulates in 32-bit fixed
/// point so it wraps exactly and never drifts, whatever the length.
pub fn complex_exp_gen(out:&mut [Complex<f32>], freq:f64, fs:f64) {
	let step:u32 = ((freq / fs) * PHASE_TURNS).round() as i64 as u32;
	let mut acc:u32 = 0;
	for sample in out.iter_mut() {
		let phase_rad:f64 = (acc as f64 / PHASE_TURNS) * 2.0 * std::f64::consts::PI;
		*sample = Complex{ re: phase_rad.cos() as f32, im: phase_rad.sin() as f32 };
		acc = acc.wrapping_add(step);
	}
}

pub fn complex_exp_gen_conj(out:&mut [Complex<f32>], freq:f64, fs:f64) {
	complex_exp_gen(out, freq, fs);
	for sample in out.iter_mut() { sample.im = -sample.im; }
}
