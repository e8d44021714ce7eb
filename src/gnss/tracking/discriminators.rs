
use rustfft::num_complex::Complex;

/// Two-quadrant arctangent Costas discriminator; returns residual carrier phase
/// in radians.  Insensitive to 180-degree data-bit flips.
pub fn pll_cloop_two_quadrant_atan(prompt:Complex<f32>) -> f64 {
	if prompt.re == 0.0 { 0.0 } else { ((prompt.im as f64) / (prompt.re as f64)).atan() }
}

/// Non-coherent normalized early-minus-late power discriminator, in chips.
pub fn dll_nc_e_minus_l_normalized(early:Complex<f32>, late:Complex<f32>) -> f64 {
	let p_early:f64 = early.norm() as f64;
	let p_late:f64  = late.norm() as f64;
	if p_early + p_late == 0.0 { 0.0 } else { (p_early - p_late) / (p_early + p_late) }
}
