//! Status reporting.
//!
//! Collects state updates from the other tasks and prints one status
//! line every ten seconds: active calls, total calls, lock state, and
//! the current quality metric. Concrete errors go to the log, not here.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::calls::CallTracker;
use crate::consts::STATUS_INTERVAL_MS;
use crate::decoder::DecoderStats;
use crate::types::{Frequency, SystemDetail, SystemInfo, TalkgroupId};

#[derive(Clone, Debug)]
pub enum UiEvent {
    SetQuality(f32),
    SetLockState(bool),
    SetTalkgroup(TalkgroupId),
    SetSystemInfo(SystemInfo),
    SetControlFreq(Frequency),
    SetStats(DecoderStats),
}

#[derive(Default)]
struct StatusState {
    locked: bool,
    quality: f32,
    talkgroup: Option<TalkgroupId>,
    ctlfreq: Frequency,
    system_name: Option<String>,
    stats: DecoderStats,
}

impl StatusState {
    fn handle(&mut self, event: UiEvent) {
        match event {
            UiEvent::SetQuality(q) => self.quality = q,
            UiEvent::SetLockState(locked) => self.locked = locked,
            UiEvent::SetTalkgroup(tg) => self.talkgroup = Some(tg),
            UiEvent::SetSystemInfo(info) => {
                self.system_name = Some(describe_system(&info));
            }
            UiEvent::SetControlFreq(freq) => self.ctlfreq = freq,
            UiEvent::SetStats(stats) => self.stats = stats,
        }
    }
}

pub struct StatusTask {
    events: Receiver<UiEvent>,
    tracker: Arc<CallTracker>,
    state: StatusState,
}

impl StatusTask {
    pub fn new(events: Receiver<UiEvent>, tracker: Arc<CallTracker>) -> Self {
        StatusTask {
            events,
            tracker,
            state: StatusState::default(),
        }
    }

    pub fn run(&mut self) {
        let interval = Duration::from_millis(STATUS_INTERVAL_MS);
        let mut last_status = Instant::now();

        loop {
            match self.events.recv_timeout(Duration::from_millis(500)) {
                Ok(event) => self.state.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("ui event channel closed");
                    return;
                }
            }

            if last_status.elapsed() >= interval {
                self.print_status();
                last_status = Instant::now();
            }
        }
    }

    fn print_status(&self) {
        let snapshot = self.tracker.snapshot();

        println!(
            "status: active={} total={} locked={} quality={:.2}{}",
            snapshot.active_calls,
            snapshot.total_calls,
            if self.state.locked { "yes" } else { "no" },
            self.state.quality,
            match &self.state.system_name {
                Some(name) => format!(" system={}", name),
                None => String::new(),
            },
        );

        debug!(
            "counters: frames={} sync_losses={} crc_errors={} unresolved={} dropped_audio={}",
            self.state.stats.frames_decoded,
            self.state.stats.sync_losses,
            self.state.stats.crc_errors,
            self.state.stats.unresolved_grants,
            snapshot.dropped_audio,
        );
    }
}

fn describe_system(info: &SystemInfo) -> String {
    match &info.detail {
        SystemDetail::P25 { nac, wacn, sysid } => {
            format!("P25 nac={:#05x} wacn={:#x} sysid={:#x}", nac, wacn, sysid)
        }
        SystemDetail::Tetra {
            mcc,
            mnc,
            network_name,
            ..
        } => match network_name {
            Some(name) => format!("TETRA {}/{} \"{}\"", mcc, mnc, name),
            None => format!("TETRA {}/{}", mcc, mnc),
        },
        SystemDetail::Dmr { color_code, .. } => format!("DMR cc={}", color_code),
        SystemDetail::Smartnet {
            base_frequency, ..
        } => format!("SmartNet base={}", base_frequency),
    }
}
