//! Active-call tracking and talkgroup policy.
//!
//! Call state and policy configuration live behind two independent
//! mutexes so a policy update never blocks the grant path for more
//! than a map lookup. Readers get snapshots, never references into the
//! maps. All timeout arithmetic takes an explicit millisecond clock so
//! tests drive time directly.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use fnv::FnvHashMap;

use crate::audio::PlaybackQueue;
use crate::consts::CALL_TIMEOUT_MS;
use crate::types::{AudioFrame, CallGrant, Priority, TalkgroupId};

const DEFAULT_PRIORITY: Priority = 5;

/// A call currently believed to be on the air.
#[derive(Clone, Debug)]
pub struct ActiveCall {
    pub grant: CallGrant,
    pub start_time: u64,
    pub last_activity: u64,
    pub frame_count: u64,
    pub recording: bool,
}

#[derive(Default)]
struct CallState {
    active: FnvHashMap<TalkgroupId, ActiveCall>,
    total_calls: u64,
    dropped_audio: u64,
}

#[derive(Default)]
struct PolicyState {
    enabled: FnvHashMap<TalkgroupId, bool>,
    priorities: FnvHashMap<TalkgroupId, Priority>,
}

/// Point-in-time view for the status line.
#[derive(Copy, Clone, Debug, Default)]
pub struct TrackerSnapshot {
    pub active_calls: usize,
    pub total_calls: u64,
    pub dropped_audio: u64,
}

pub struct CallTracker {
    calls: Mutex<CallState>,
    policy: Mutex<PolicyState>,
    queue: Arc<PlaybackQueue>,
    record_calls: bool,
}

impl CallTracker {
    pub fn new(queue: Arc<PlaybackQueue>, record_calls: bool) -> Self {
        CallTracker {
            calls: Mutex::new(CallState::default()),
            policy: Mutex::new(PolicyState::default()),
            queue,
            record_calls,
        }
    }

    fn now_ms() -> u64 {
        Utc::now().timestamp_millis() as u64
    }

    // --- policy ---------------------------------------------------------

    pub fn enable_talkgroup(&self, tg: TalkgroupId, priority: Priority) {
        let mut policy = self.policy.lock().expect("policy poisoned");
        policy.enabled.insert(tg, true);
        policy.priorities.insert(tg, priority);
        info!("enabled talkgroup {} priority {}", tg, priority);
    }

    /// Disabling affects new grants only; an active call keeps running.
    pub fn disable_talkgroup(&self, tg: TalkgroupId) {
        let mut policy = self.policy.lock().expect("policy poisoned");
        policy.enabled.insert(tg, false);
        info!("disabled talkgroup {}", tg);
    }

    /// An empty enabled set admits every talkgroup.
    pub fn is_enabled(&self, tg: TalkgroupId) -> bool {
        let policy = self.policy.lock().expect("policy poisoned");
        policy
            .enabled
            .get(&tg)
            .copied()
            .unwrap_or_else(|| policy.enabled.is_empty())
    }

    pub fn priority(&self, tg: TalkgroupId) -> Priority {
        let policy = self.policy.lock().expect("policy poisoned");
        policy.priorities.get(&tg).copied().unwrap_or(DEFAULT_PRIORITY)
    }

    // --- grant and audio paths ------------------------------------------

    pub fn handle_grant(&self, grant: CallGrant) {
        self.handle_grant_at(grant, Self::now_ms());
    }

    pub fn handle_grant_at(&self, mut grant: CallGrant, now_ms: u64) {
        if !self.is_enabled(grant.talkgroup) {
            debug!("grant for disabled talkgroup {} ignored", grant.talkgroup);
            return;
        }

        grant.priority = self.priority(grant.talkgroup);
        grant.timestamp = now_ms;

        let mut calls = self.calls.lock().expect("call state poisoned");

        if let Some(call) = calls.active.get_mut(&grant.talkgroup) {
            call.last_activity = now_ms;
            debug!("refreshed call for talkgroup {}", grant.talkgroup);
            return;
        }

        info!(
            "new call: tg={} freq={} src={}",
            grant.talkgroup, grant.frequency, grant.radio_id
        );

        calls.active.insert(
            grant.talkgroup,
            ActiveCall {
                grant,
                start_time: now_ms,
                last_activity: now_ms,
                frame_count: 0,
                recording: self.record_calls,
            },
        );
        calls.total_calls += 1;
    }

    pub fn handle_audio_frame(&self, tg: TalkgroupId, samples: Vec<i16>, rssi: f32) {
        self.handle_audio_frame_at(tg, samples, rssi, Self::now_ms());
    }

    /// Audio only flows into calls that exist; there is no implicit
    /// call creation from a stray voice frame.
    pub fn handle_audio_frame_at(
        &self,
        tg: TalkgroupId,
        samples: Vec<i16>,
        rssi: f32,
        now_ms: u64,
    ) {
        let radio_id = {
            let mut calls = self.calls.lock().expect("call state poisoned");

            match calls.active.get_mut(&tg) {
                Some(call) => {
                    call.last_activity = now_ms;
                    call.frame_count += 1;
                    call.grant.radio_id
                }
                None => {
                    warn!("audio for inactive talkgroup {} dropped", tg);
                    calls.dropped_audio += 1;
                    return;
                }
            }
        };

        self.queue.push(AudioFrame {
            samples,
            talkgroup: tg,
            radio_id,
            timestamp: now_ms,
            rssi,
        });
    }

    pub fn end_call(&self, tg: TalkgroupId) {
        let mut calls = self.calls.lock().expect("call state poisoned");

        if let Some(call) = calls.active.remove(&tg) {
            info!(
                "call ended: tg={} duration={}ms frames={}",
                tg,
                call.last_activity.saturating_sub(call.start_time),
                call.frame_count
            );
        }
    }

    pub fn sweep(&self) {
        self.sweep_at(Self::now_ms());
    }

    /// Evict calls idle longer than the timeout. Runs from the
    /// maintenance thread at least once a second.
    pub fn sweep_at(&self, now_ms: u64) {
        let mut calls = self.calls.lock().expect("call state poisoned");

        calls.active.retain(|&tg, call| {
            let keep = now_ms.saturating_sub(call.last_activity) <= CALL_TIMEOUT_MS;
            if !keep {
                info!("call timeout: tg={}", tg);
            }
            keep
        });
    }

    // --- observers ------------------------------------------------------

    pub fn is_call_active(&self, tg: TalkgroupId) -> bool {
        self.calls
            .lock()
            .expect("call state poisoned")
            .active
            .contains_key(&tg)
    }

    pub fn active_call(&self, tg: TalkgroupId) -> Option<ActiveCall> {
        self.calls
            .lock()
            .expect("call state poisoned")
            .active
            .get(&tg)
            .cloned()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let calls = self.calls.lock().expect("call state poisoned");
        TrackerSnapshot {
            active_calls: calls.active.len(),
            total_calls: calls.total_calls,
            dropped_audio: calls.dropped_audio,
        }
    }
}
