
/// Floor of x wrapped into [0, wrap_range); used to index one code period from
/// an unbounded chip phase.
pub fn wrap_floor(x:f64, wrap_range:usize) -> usize {
	let range:f64 = wrap_range as f64;
	let mut x_ans:f64 = x % range;
	if x_ans < 0.0 { x_ans += range; }
	x_ans.floor() as usize
}
