
use clap::{Arg, App};
use colored::*;
use rustfft::num_complex::Complex;
use serde::Serialize;

use gnss_baseband::Sample;
use gnss_baseband::gnss::{CodePhaseMap, ControlMessage, GnssSynchro};
use gnss_baseband::gnss::common::acquisition::AcqConfig;
use gnss_baseband::gnss::gps_l1_ca::channel::{Channel, ChannelState};
use gnss_baseband::gnss::gps_l1_ca::tracking::{TrackingDebug, TrkConfig};
use gnss_baseband::io;

#[derive(Debug, Serialize)]
struct OutputRecord {
	record: GnssSynchro,
	sample_position: u64,
	debug: TrackingDebug,
}

fn main() -> Result<(), &'static str> {

	let matches = App::new("GPS L1 CA CADLL Receiver Core")
		.version("0.1.0")
		.about("Takes IQ samples centered on 1575.42 MHz, acquires one satellite and tracks it with a multipath-resolving dual-DLL loop")
		.arg(Arg::with_name("filename")
			.short("f").long("filename")
			.help("Input filename")
			.required(true).takes_value(true))
		.arg(Arg::with_name("input_type")
			.short("t").long("type")
			.takes_value(true)
			.possible_value("i16").possible_value("f32")
			.default_value("i16"))
		.arg(Arg::with_name("sample_rate_sps")
			.short("s").long("sample_rate_sps")
			.takes_value(true).required(true))
		.arg(Arg::with_name("prn")
			.short("p").long("prn")
			.takes_value(true).required(true))
		.arg(Arg::with_name("doppler_max_hz")
			.long("doppler_max_hz")
			.takes_value(true).default_value("5000"))
		.arg(Arg::with_name("doppler_step_hz")
			.long("doppler_step_hz")
			.takes_value(true).default_value("500"))
		.arg(Arg::with_name("threshold")
			.long("threshold")
			.takes_value(true).default_value("0.1"))
		.arg(Arg::with_name("num_peaks")
			.long("num_peaks")
			.help("Acquire the n-th disjoint correlation peak instead of the strongest")
			.takes_value(true).default_value("1"))
		.arg(Arg::with_name("max_records")
			.short("m").long("max_records")
			.takes_value(true))
		.get_matches();

	let fname:&str = matches.value_of("filename").unwrap();
	let fs:f64 = matches.value_of("sample_rate_sps").unwrap().parse().map_err(|_| "Unable to parse sample_rate_sps")?;
	let prn:usize = matches.value_of("prn").unwrap().parse().map_err(|_| "Unable to parse prn")?;
	let opt_max_records:Option<usize> = matches.value_of("max_records").map(|s| s.parse().unwrap());

	let samples_per_code:usize = (fs * 1.0e-3).round() as usize;
	let acq_cfg = AcqConfig{
		sampled_ms: 1,
		max_dwells: 2,
		doppler_max_hz: matches.value_of("doppler_max_hz").unwrap().parse().map_err(|_| "Unable to parse doppler_max_hz")?,
		doppler_step_hz: matches.value_of("doppler_step_hz").unwrap().parse().map_err(|_| "Unable to parse doppler_step_hz")?,
		if_freq_hz: 0.0,
		fs_in: fs,
		samples_per_ms: samples_per_code,
		samples_per_code,
		bit_transition_flag: false,
		num_peaks: matches.value_of("num_peaks").unwrap().parse().map_err(|_| "Unable to parse num_peaks")?,
		threshold: matches.value_of("threshold").unwrap().parse().map_err(|_| "Unable to parse threshold")?,
		peak_separation_samples: 2.0 * (samples_per_code as f64) / 1023.0,
		dump: None };
	let trk_cfg = TrkConfig{ fs_in: fs, vector_length: samples_per_code, ..TrkConfig::default() };

	eprintln!("Decoding {} at {} [samples/sec], PRN {}, max_records={:?}", &fname, &fs, &prn, &opt_max_records);

	let samples:Vec<Complex<f32>> = match matches.value_of("input_type").unwrap() {
		"f32" => io::file_source_f32_complex(&fname).map_err(|_| "Unable to open source file")?.map(|s:Sample| s.val).collect(),
		_     => io::file_source_i16_complex(&fname).map_err(|_| "Unable to open source file")?.map(|s:Sample| s.val).collect(),
	};

	let map = CodePhaseMap::new();
	let mut chan = Channel::new(0, prn, acq_cfg, trk_cfg, map, None).map_err(|_| "Unable to build channel")?;

	let mut pos:usize = 0;
	let mut all_records:Vec<OutputRecord> = vec![];

	'stream: while pos + chan.wanted() <= samples.len() {
		let step = chan.process(&samples[pos..pos + chan.wanted()]).map_err(|_| "Channel processing failed")?;
		pos += step.consumed;

		for msg in &step.messages {
			match msg {
				ControlMessage::AcqSuccess{..} => {
					let s = chan.synchro();
					eprintln!("{}", format!("PRN {:02}: acquired at {:9.2} [Hz], {:6.0} [samples]",
						prn, s.acq_doppler_hz, s.acq_delay_samples).green());
				},
				ControlMessage::AcqFail{..}   => eprintln!("{}", format!("PRN {:02}: acquisition failed, retrying", prn).yellow()),
				ControlMessage::LossOfLock{..} => eprintln!("{}", format!("PRN {:02}: loss of lock", prn).red()),
				ControlMessage::StopChannel{..} => break 'stream,
			}
		}

		if let Some(record) = step.record {
			if record.flag_valid_tracking && chan.state() == ChannelState::Tracking {
				all_records.push(OutputRecord{ record, sample_position: chan.sample_position(), debug: chan.tracking_debug() });
				if let Some(max_records) = opt_max_records {
					if all_records.len() >= max_records { break 'stream; }
				}
			}
		}

		// A step may consume nothing while control messages flip the state;
		// only a fully idle step ends the run
		if step.consumed == 0 && step.messages.is_empty() { break 'stream; }
	}

	println!("{}", serde_json::to_string_pretty(&all_records).map_err(|_| "Unable to serialize output")?);

	Ok(())
}
