//! Receiver task: symbols in, tracked calls out.
//!
//! Runs the protocol decoder over symbol batches from the demodulator,
//! posts decoder events into the call tracker, and forwards tuning
//! requests to the source control task. Event handling preserves the
//! order the bit stream produced them.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use crate::calls::CallTracker;
use crate::decoder::Decoder;
use crate::follow::{FollowEvent, VoiceFollower};
use crate::sdr::ControlEvent;
use crate::types::{DecoderEvent, Frequency};
use crate::ui::UiEvent;

pub enum RecvEvent {
    /// Symbol batch from the demodulator.
    Symbols(Vec<f32>),
    /// Move to a different control channel.
    SetControlFreq(Frequency),
}

pub struct RecvTask {
    decoder: Decoder,
    tracker: Arc<CallTracker>,
    events: Receiver<RecvEvent>,
    sdr: Sender<ControlEvent>,
    ui: Sender<UiEvent>,
    /// Voice-channel follower; `None` in the single-radio configuration
    /// where grants are recorded but not chased.
    follower: Option<VoiceFollower>,
    ctlfreq: Frequency,
    batches: u64,
}

impl RecvTask {
    pub fn new(
        decoder: Decoder,
        tracker: Arc<CallTracker>,
        events: Receiver<RecvEvent>,
        sdr: Sender<ControlEvent>,
        ui: Sender<UiEvent>,
        follower: Option<VoiceFollower>,
        ctlfreq: Frequency,
    ) -> Self {
        RecvTask {
            decoder,
            tracker,
            events,
            sdr,
            ui,
            follower,
            ctlfreq,
            batches: 0,
        }
    }

    pub fn run(&mut self) {
        let _ = self.sdr.send(ControlEvent::SetFreq(self.ctlfreq));
        let _ = self.ui.send(UiEvent::SetControlFreq(self.ctlfreq));

        loop {
            match self.events.recv() {
                Ok(RecvEvent::Symbols(symbols)) => self.handle_symbols(&symbols),
                Ok(RecvEvent::SetControlFreq(freq)) => self.set_control_freq(freq),
                Err(_) => {
                    debug!("receiver event channel closed");
                    return;
                }
            }
        }
    }

    fn set_control_freq(&mut self, freq: Frequency) {
        if freq == self.ctlfreq {
            return;
        }

        info!("moving to control channel {}", freq);
        self.ctlfreq = freq;

        // Frequency tables learned on the old channel no longer apply.
        self.decoder.reset();

        let _ = self.sdr.send(ControlEvent::SetFreq(freq));
        let _ = self.ui.send(UiEvent::SetControlFreq(freq));
    }

    fn handle_symbols(&mut self, symbols: &[f32]) {
        // Collect first so event handling happens in stream order
        // without borrowing across the decoder.
        let mut pending = Vec::new();
        self.decoder
            .process_symbols(symbols, &mut |event| pending.push(event));

        for event in pending {
            self.handle_event(event);
        }

        if let Some(follower) = self.follower.as_mut() {
            if let Some(FollowEvent::ReturnIdle) = follower.handle_elapsed(symbols.len()) {
                let _ = self.sdr.send(ControlEvent::SetFreq(self.ctlfreq));
            }
        }

        self.batches += 1;
        if self.batches % 8 == 0 {
            let stats = self.decoder.stats();
            let _ = self.ui.send(UiEvent::SetLockState(self.decoder.locked()));
            let _ = self.ui.send(UiEvent::SetStats(stats));
        }
    }

    fn handle_event(&mut self, event: DecoderEvent) {
        match event {
            DecoderEvent::Grant(grant) => {
                let _ = self.ui.send(UiEvent::SetTalkgroup(grant.talkgroup));

                if let Some(follower) = self.follower.as_mut() {
                    if self.tracker.is_enabled(grant.talkgroup) && !grant.encrypted {
                        if let Some(FollowEvent::Tune(freq)) =
                            follower.handle_grant(grant.talkgroup, grant.frequency)
                        {
                            let _ = self.sdr.send(ControlEvent::SetFreq(freq));
                        }
                    }
                }

                self.tracker.handle_grant(grant);
            }
            DecoderEvent::SystemInfo(info) => {
                let _ = self.ui.send(UiEvent::SetSystemInfo(info));
            }
            DecoderEvent::CallEnd(tg) => {
                if let Some(follower) = self.follower.as_mut() {
                    if let Some(FollowEvent::ReturnIdle) = follower.handle_call_end(tg) {
                        let _ = self.sdr.send(ControlEvent::SetFreq(self.ctlfreq));
                    }
                }

                self.tracker.end_call(tg);
            }
            DecoderEvent::ShortData(text) => {
                info!("short data message: {}", text);
            }
            DecoderEvent::TalkerAlias(tg, alias) => {
                info!("talker alias for {}: {}", tg, alias);
            }
        }
    }
}
