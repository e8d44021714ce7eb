
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustfft::num_complex::Complex;

use crate::{DigSigProcErr, Sample};

pub struct FileSourceLEi16Complex {
	f: File,
	idx: u64,
}

pub fn file_source_i16_complex(filename:&str) -> Result<FileSourceLEi16Complex, DigSigProcErr> {
	let f = File::open(filename).map_err(|_| DigSigProcErr::Other("Unable to open source file"))?;
	Ok(FileSourceLEi16Complex{ f, idx: 0 })
}

impl Iterator for FileSourceLEi16Complex {
	type Item = Sample;

	fn next(&mut self) -> Option<Sample> {
		match (self.f.read_i16::<LittleEndian>(), self.f.read_i16::<LittleEndian>()) {
			(Ok(re_i16), Ok(im_i16)) => {
				let idx = self.idx;
				self.idx += 1;
				Some(Sample{ val: Complex{ re: re_i16 as f32, im: im_i16 as f32 }, idx })
			},
			(_, _) => None,
		}
	}
}

pub struct FileSourceLEf32Complex {
	f: File,
	idx: u64,
}

pub fn file_source_f32_complex(filename:&str) -> Result<FileSourceLEf32Complex, DigSigProcErr> {
	let f = File::open(filename).map_err(|_| DigSigProcErr::Other("Unable to open source file"))?;
	Ok(FileSourceLEf32Complex{ f, idx: 0 })
}

impl Iterator for FileSourceLEf32Complex {
	type Item = Sample;

	fn next(&mut self) -> Option<Sample> {
		match (self.f.read_f32::<LittleEndian>(), self.f.read_f32::<LittleEndian>()) {
			(Ok(re), Ok(im)) => {
				let idx = self.idx;
				self.idx += 1;
				Some(Sample{ val: Complex{ re, im }, idx })
			},
			(_, _) => None,
		}
	}
}

/// One multiplexed tracking dump record; written little-endian, floats unless
/// noted, followed by the raw samples of the PRN period.
pub struct TrackingDumpRecord {
	pub abs_early: f32,
	pub abs_prompt: f32,
	pub abs_late: f32,
	pub prompt_i: f32,
	pub prompt_q: f32,
	pub sample_counter: u64,
	pub acc_carrier_phase_rad: f32,
	pub carrier_doppler_hz: f32,
	pub code_freq_chips: f32,
	pub carr_error_hz: f32,
	pub carr_error_filt_hz: f32,
	pub code_error_chips: f32,
	pub code_error_filt_chips: f32,
	pub cn0_db_hz: f32,
	pub carrier_lock_test: f32,
	pub rem_code_phase_samples: f32,
	pub next_prn_start_samples: f64,
}

pub struct TrackingDumpWriter {
	w: BufWriter<File>,
}

impl TrackingDumpWriter {

	pub fn create<P: AsRef<Path>>(path:P) -> Result<Self, DigSigProcErr> {
		let f = File::create(path).map_err(|_| DigSigProcErr::Other("Unable to create tracking dump file"))?;
		Ok(Self{ w: BufWriter::new(f) })
	}

	pub fn write_record(&mut self, rec:&TrackingDumpRecord, samples:&[Complex<f32>]) -> Result<(), DigSigProcErr> {
		let io_err = |_| DigSigProcErr::Other("Tracking dump write failed");
		self.w.write_f32::<LittleEndian>(rec.abs_early).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.abs_prompt).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.abs_late).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.prompt_i).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.prompt_q).map_err(io_err)?;
		self.w.write_u64::<LittleEndian>(rec.sample_counter).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.acc_carrier_phase_rad).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.carrier_doppler_hz).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.code_freq_chips).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.carr_error_hz).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.carr_error_filt_hz).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.code_error_chips).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.code_error_filt_chips).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.cn0_db_hz).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.carrier_lock_test).map_err(io_err)?;
		self.w.write_f32::<LittleEndian>(rec.rem_code_phase_samples).map_err(io_err)?;
		self.w.write_f64::<LittleEndian>(rec.next_prn_start_samples).map_err(io_err)?;
		for sample in samples {
			self.w.write_f32::<LittleEndian>(sample.re).map_err(io_err)?;
			self.w.write_f32::<LittleEndian>(sample.im).map_err(io_err)?;
		}
		self.w.flush().map_err(io_err)
	}

}

/// Writes one Doppler bin of the acquisition search grid (the raw |IFFT|^2
/// magnitudes) to its own file.
pub fn dump_acquisition_grid(dir:&Path, system:char, signal:&str, prn:usize, doppler_hz:f64, magnitude:&[f32]) -> Result<PathBuf, DigSigProcErr> {
	let filename:PathBuf = dir.join(format!("test_statistics_{}_{}_sat_{}_doppler_{}.dat", system, signal, prn, doppler_hz as i64));
	let f = File::create(&filename).map_err(|_| DigSigProcErr::Other("Unable to create acquisition dump file"))?;
	let mut w = BufWriter::new(f);
	for m in magnitude {
		w.write_f32::<LittleEndian>(*m).map_err(|_| DigSigProcErr::Other("Acquisition dump write failed"))?;
	}
	w.flush().map_err(|_| DigSigProcErr::Other("Acquisition dump write failed"))?;
	Ok(filename)
}
