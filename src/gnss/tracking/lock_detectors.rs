
use rustfft::num_complex::Complex;

/// Signal-to-noise-variance CN0 estimator over a window of prompt correlator
/// outputs.
pub fn cn0_svn_estimator(prompt_buffer:&[Complex<f32>], fs_in:f64, code_length:f64) -> f64 {
	let n:f64 = prompt_buffer.len() as f64;
	let psig:f64 = {
		let sum:f64 = prompt_buffer.iter().map(|c| (c.re as f64).abs()).sum();
		(sum / n).powi(2)
	};
	let ptot:f64 = {
		let sum:f64 = prompt_buffer.iter().map(|c| (c.re as f64).powi(2) + (c.im as f64).powi(2)).sum();
		sum / n
	};
	let snr:f64 = psig / (ptot - psig);
	10.0 * snr.log10() + 10.0 * (fs_in / 2.0).log10() - 10.0 * code_length.log10()
}

/// Narrowband (I^2 - Q^2)/(I^2 + Q^2) carrier lock metric; close to 1 when the
/// prompt energy sits in phase, near 0 for noise.
pub fn carrier_lock_detector(prompt_buffer:&[Complex<f32>]) -> f64 {
	let tmp_sum_i:f64 = prompt_buffer.iter().map(|c| c.re as f64).sum();
	let tmp_sum_q:f64 = prompt_buffer.iter().map(|c| c.im as f64).sum();
	let nbp:f64 = tmp_sum_i * tmp_sum_i + tmp_sum_q * tmp_sum_q;
	let nbd:f64 = tmp_sum_i * tmp_sum_i - tmp_sum_q * tmp_sum_q;
	nbd / nbp
}

#[cfg(test)]
mod tests {

	use rand::Rng;
	use rustfft::num_complex::Complex;

	use super::*;

	#[test]
	fn clean_prompts_report_strong_cn0_and_lock() {
		let mut rng = rand::thread_rng();
		let prompts:Vec<Complex<f32>> = (0..20).map(|_| Complex{
			re: 2000.0 + rng.gen_range(-20.0..20.0),
			im: rng.gen_range(-20.0..20.0) }).collect();

		let cn0 = cn0_svn_estimator(&prompts, 2.048e6, 1023.0);
		let lock = carrier_lock_detector(&prompts);
		assert!(cn0 > 40.0, "cn0 was {}", cn0);
		assert!(lock > 0.95, "lock was {}", lock);
	}

	#[test]
	fn scrambled_phase_prompts_fail_the_lock_test() {
		// Prompt phases spread around the circle, as seen after carrier unlock
		let prompts:Vec<Complex<f32>> = (0..20).map(|k| {
			let phase:f64 = (k as f64) * 2.399963229728653;
			Complex{ re: (1000.0 * phase.cos()) as f32, im: (1000.0 * phase.sin()) as f32 }
		}).collect();

		assert!(carrier_lock_detector(&prompts) < 0.85);
	}

	#[test]
	fn quadrature_prompts_report_negative_lock() {
		let prompts:Vec<Complex<f32>> = (0..20).map(|_| Complex{ re: 1.0, im: 500.0 }).collect();
		assert!(carrier_lock_detector(&prompts) < 0.0);
	}

}
