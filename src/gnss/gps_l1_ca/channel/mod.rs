
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::info;
use rustfft::num_complex::Complex;

use crate::DigSigProcErr;
use crate::gnss::{CodePhaseEntry, CodePhaseMap, ControlMessage, GnssSynchro};
use crate::gnss::common::acquisition::{AcqConfig, make_acquisition, pcps};
use crate::gnss::gps_l1_ca::tracking::{self, TrkConfig};


pub const DEFAULT_PLL_BW_HZ:f64 = 40.0;
pub const DEFAULT_DLL_BW_HZ:f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
	Acquisition,
	Tracking,
}

#[derive(Debug)]
pub struct ChannelStep {
	pub consumed: usize,
	pub record: Option<GnssSynchro>,
	pub messages: Vec<ControlMessage>,
}

/// Per-satellite controller sequencing acquisition, tracking and
/// re-acquisition over one internal message queue.  The controller is the
/// single consumer of that queue; the stages hold cloned senders.
pub struct Channel {
	pub channel_id: usize,
	pub prn: usize,
	state: ChannelState,
	synchro: GnssSynchro,
	acq: pcps::Acquisition,
	trk: tracking::Tracking,
	queue_rx: Receiver<ControlMessage>,
	queue_tx: Sender<ControlMessage>,
	global_queue: Option<Sender<ControlMessage>>,
	code_phase_map: CodePhaseMap,
	sample_position: u64,
}

impl Channel {

	pub fn new(channel_id:usize, prn:usize, acq_cfg:AcqConfig, trk_cfg:TrkConfig,
			   code_phase_map:CodePhaseMap, global_queue:Option<Sender<ControlMessage>>) -> Result<Channel, DigSigProcErr> {
		let (queue_tx, queue_rx) = unbounded();
		let mut acq = make_acquisition(acq_cfg, channel_id, prn, queue_tx.clone())?;
		let trk = tracking::new_cadll_tracker(trk_cfg, channel_id, queue_tx.clone());
		acq.set_active(true);
		Ok(Channel{ channel_id, prn, state: ChannelState::Acquisition, synchro: GnssSynchro::new(prn),
			acq, trk, queue_rx, queue_tx, global_queue, code_phase_map, sample_position: 0 })
	}

	pub fn state(&self) -> ChannelState { self.state }
	pub fn synchro(&self) -> &GnssSynchro { &self.synchro }
	pub fn sample_position(&self) -> u64 { self.sample_position }
	pub fn acq_state(&self) -> pcps::AcqState { self.acq.state() }
	pub fn tracking_enabled(&self) -> bool { self.trk.enabled() }
	pub fn tracking_debug(&self) -> tracking::TrackingDebug { self.trk.debug(&self.synchro) }

	/// Samples the caller should hand to the next process() call.
	pub fn wanted(&self) -> usize {
		match self.state {
			ChannelState::Acquisition => self.acq.fft_size(),
			ChannelState::Tracking => self.trk.wanted(),
		}
	}

	/// Retasks the channel to another satellite; takes effect on the next
	/// acquisition attempt.
	pub fn set_prn(&mut self, prn:usize) -> Result<(), DigSigProcErr> {
		self.acq.set_prn(prn)?;
		self.prn = prn;
		self.synchro = GnssSynchro::new(prn);
		Ok(())
	}

	/// Cooperative shutdown; the terminating messages are dispatched on the
	/// next process() call.
	pub fn stop(&mut self) {
		if self.state == ChannelState::Tracking {
			self.trk.stop_tracking();
		}
		let _ = self.queue_tx.send(ControlMessage::StopChannel{ channel: self.channel_id });
	}

	pub fn process(&mut self, block:&[Complex<f32>]) -> Result<ChannelStep, DigSigProcErr> {
		let mut record:Option<GnssSynchro> = None;
		let consumed:usize = match self.state {
			ChannelState::Acquisition => {
				self.acq.process_block(block, &mut self.synchro)?;
				block.len()
			},
			ChannelState::Tracking => {
				let step = self.trk.process(block, &mut self.synchro)?;
				if step.record_ready { record = Some(self.synchro.clone()); }
				step.consumed
			},
		};
		self.sample_position += consumed as u64;

		let pending:Vec<ControlMessage> = self.queue_rx.try_iter().collect();
		let mut messages:Vec<ControlMessage> = vec![];
		for msg in pending {
			self.dispatch(msg)?;
			if let Some(global) = &self.global_queue {
				let _ = global.send(msg);
			}
			messages.push(msg);
		}

		Ok(ChannelStep{ consumed, record, messages })
	}

	fn dispatch(&mut self, msg:ControlMessage) -> Result<(), DigSigProcErr> {
		match msg {
			ControlMessage::AcqSuccess{ channel:_ } => {
				self.code_phase_map.insert(self.prn, CodePhaseEntry{
					code_phase_samples: self.synchro.acq_delay_samples,
					sample_stamp: self.synchro.acq_samplestamp_samples });
				self.trk.set_sample_counter(self.sample_position);
				self.trk.start_tracking(&self.synchro)?;
				self.state = ChannelState::Tracking;
			},
			ControlMessage::AcqFail{ channel:_ } => {
				// The retry policy lives outside; the channel just re-arms
				self.acq.set_active(true);
			},
			ControlMessage::LossOfLock{ channel:_ } => {
				if self.state == ChannelState::Tracking {
					info!("channel {}: returning to acquisition of PRN {}", self.channel_id, self.prn);
					self.state = ChannelState::Acquisition;
					self.acq.set_sample_counter(self.sample_position);
					self.acq.set_active(true);
				}
			},
			ControlMessage::StopChannel{ channel:_ } => {
				self.acq.set_active(false);
			},
		}
		Ok(())
	}

}
