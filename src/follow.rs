//! Voice-channel follower policy.
//!
//! Extension point for a second receiver that chases voice grants. The
//! state machine decides when that receiver tunes to a traffic channel
//! and when it returns to idle: a watchdog expires a silent channel, a
//! voice terminator pauses briefly in case the message continues, and a
//! protocol-level call end releases the channel immediately. Timeouts
//! count elapsed symbols, the only clock the receive path has.

use crate::types::{Frequency, TalkgroupId};

use self::FollowEvent::*;
use self::FollowerState::*;
use self::StateChange::*;

/// Action the voice receiver should take.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FollowEvent {
    /// Tune to the given traffic frequency.
    Tune(Frequency),
    /// Return to idle; the traffic channel is finished.
    ReturnIdle,
}

#[derive(Copy, Clone)]
enum FollowerState {
    /// Not following anything.
    Idle,
    /// On a traffic channel with a watchdog timer.
    Following(Timer, TalkgroupId),
    /// Pausing after a voice terminator in case the message continues.
    Paused(Timer, TalkgroupId),
}

enum StateChange {
    Change(FollowerState),
    Event(FollowEvent),
    NoChange,
}

pub struct VoiceFollower {
    state: FollowerState,
    /// Watchdog timeout while following.
    watchdog_time: usize,
    /// Pause timeout after a voice terminator.
    pause_time: usize,
}

impl VoiceFollower {
    pub fn new(watchdog: usize, pause: usize) -> Self {
        VoiceFollower {
            state: Idle,
            watchdog_time: watchdog,
            pause_time: pause,
        }
    }

    /// Talkgroup currently being followed, if any.
    pub fn following(&self) -> Option<TalkgroupId> {
        match self.state {
            Idle => None,
            Following(_, tg) | Paused(_, tg) => Some(tg),
        }
    }

    /// Record a call grant. An idle follower takes the channel; a busy
    /// follower only refreshes its own talkgroup.
    pub fn handle_grant(&mut self, tg: TalkgroupId, freq: Frequency) -> Option<FollowEvent> {
        match self.state {
            Following(ref mut t, cur) if cur == tg => {
                t.reset();
                return None;
            }
            Paused(_, cur) if cur == tg => {
                // Already on the channel; restart the watchdog only.
                debug!("resuming talkgroup {}", tg);
                self.state = self.state_following(tg);
                return None;
            }
            Idle => {}
            // Busy with another conversation.
            Following(..) | Paused(..) => return None,
        }

        debug!("following talkgroup {} to {}", tg, freq);
        self.state = self.state_following(tg);
        Some(Tune(freq))
    }

    /// Record elapsed symbols.
    pub fn handle_elapsed(&mut self, samples: usize) -> Option<FollowEvent> {
        let next = match self.state {
            Idle => NoChange,
            Following(ref mut t, _) | Paused(ref mut t, _) => {
                if t.expired(samples) {
                    debug!("follower watchdog timeout");
                    Event(ReturnIdle)
                } else {
                    NoChange
                }
            }
        };

        self.handle_change(next)
    }

    /// Record a voice frame for the followed talkgroup.
    pub fn handle_voice_frame(&mut self, tg: TalkgroupId) -> Option<FollowEvent> {
        let next = match self.state {
            Following(ref mut t, cur) if cur == tg => {
                t.reset();
                NoChange
            }
            Paused(_, cur) if cur == tg => {
                debug!("voice message continued for {}", tg);
                Change(self.state_following(tg))
            }
            _ => NoChange,
        };

        self.handle_change(next)
    }

    /// A voice terminator arrived; hold on briefly in case the message
    /// continues.
    pub fn handle_voice_end(&mut self, tg: TalkgroupId) -> Option<FollowEvent> {
        let next = match self.state {
            Following(_, cur) if cur == tg => {
                debug!("pausing for voice continuation on {}", tg);
                Change(Paused(Timer::new(self.pause_time), tg))
            }
            _ => NoChange,
        };

        self.handle_change(next)
    }

    /// A protocol-level call release ends the conversation outright.
    pub fn handle_call_end(&mut self, tg: TalkgroupId) -> Option<FollowEvent> {
        let next = match self.state {
            Following(_, cur) | Paused(_, cur) if cur == tg => Event(ReturnIdle),
            _ => NoChange,
        };

        self.handle_change(next)
    }

    fn handle_change(&mut self, change: StateChange) -> Option<FollowEvent> {
        match change {
            Change(state) => {
                self.state = state;
                None
            }
            Event(e) => {
                if e == ReturnIdle {
                    self.state = Idle;
                }
                Some(e)
            }
            NoChange => None,
        }
    }

    fn state_following(&self, tg: TalkgroupId) -> FollowerState {
        Following(Timer::new(self.watchdog_time), tg)
    }
}

/// Tracks elapsed samples against a timeout.
#[derive(Copy, Clone)]
struct Timer {
    max: usize,
    cur: usize,
}

impl Timer {
    fn new(max: usize) -> Self {
        Timer { max, cur: 0 }
    }

    fn expired(&mut self, samples: usize) -> bool {
        self.cur += samples;
        self.cur >= self.max
    }

    fn reset(&mut self) {
        self.cur = 0;
    }
}
