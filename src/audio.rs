//! Playback queue and audio output.
//!
//! Decoded PCM frames pass through a bounded FIFO into a dedicated
//! worker that writes to the sink. Playback is sequential and lossy
//! under backpressure: beyond the high-water mark the oldest frame is
//! dropped and counted. A sink failure marks playback unhealthy but
//! never kills the worker.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::consts::PLAYBACK_HIGH_WATER;
use crate::error::{Error, Result};
use crate::types::AudioFrame;

/// Bounded single-producer/single-consumer frame queue.
pub struct PlaybackQueue {
    inner: Mutex<QueueState>,
    available: Condvar,
    high_water: usize,
}

struct QueueState {
    frames: VecDeque<AudioFrame>,
    dropped: u64,
    closed: bool,
}

impl PlaybackQueue {
    pub fn new(high_water: usize) -> Self {
        PlaybackQueue {
            inner: Mutex::new(QueueState {
                frames: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
            high_water,
        }
    }

    pub fn with_default_depth() -> Self {
        PlaybackQueue::new(PLAYBACK_HIGH_WATER)
    }

    /// Enqueue a frame, dropping the oldest when full.
    pub fn push(&self, frame: AudioFrame) {
        let mut state = self.inner.lock().expect("playback queue poisoned");

        if state.frames.len() >= self.high_water {
            state.frames.pop_front();
            state.dropped += 1;
            debug!("playback queue full, oldest frame dropped");
        }

        state.frames.push_back(frame);
        self.available.notify_one();
    }

    /// Dequeue the next frame, waiting up to `timeout`. Returns `None`
    /// on timeout or once the queue is closed and drained.
    pub fn pop(&self, timeout: Duration) -> Option<AudioFrame> {
        let mut state = self.inner.lock().expect("playback queue poisoned");

        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            if state.closed {
                return None;
            }

            let (next, wait) = self
                .available
                .wait_timeout(state, timeout)
                .expect("playback queue poisoned");
            state = next;

            if wait.timed_out() {
                return state.frames.pop_front();
            }
        }
    }

    /// Wake the consumer and refuse further blocking.
    pub fn close(&self) {
        let mut state = self.inner.lock().expect("playback queue poisoned");
        state.closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("playback queue poisoned").frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("playback queue poisoned").dropped
    }
}

/// Blocking PCM sink seam. Implementations surface underruns as errors
/// which the worker treats as non-fatal.
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[i16]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Sink over any byte stream: signed 16-bit little-endian mono.
pub struct StreamSink<W: Write + Send> {
    stream: W,
}

impl<W: Write + Send> StreamSink<W> {
    pub fn new(stream: W) -> Self {
        StreamSink { stream }
    }
}

impl<W: Write + Send> AudioSink for StreamSink<W> {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }

        self.stream
            .write_all(&bytes)
            .map_err(|e| Error::Audio(format!("sink write: {}", e)))
    }

    fn flush(&mut self) -> Result<()> {
        self.stream
            .flush()
            .map_err(|e| Error::Audio(format!("sink flush: {}", e)))
    }
}

/// Drains the playback queue at roughly 100 Hz and writes to the sink
/// with a clamped per-frame gain.
pub struct AudioTask {
    queue: Arc<PlaybackQueue>,
    sink: Box<dyn AudioSink>,
    gain: f32,
    running: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    healthy: bool,
}

impl AudioTask {
    pub fn new(
        queue: Arc<PlaybackQueue>,
        sink: Box<dyn AudioSink>,
        gain: f32,
        running: Arc<AtomicBool>,
    ) -> Self {
        AudioTask {
            queue,
            sink,
            gain: gain.max(0.0).min(1.0),
            running,
            playing: Arc::new(AtomicBool::new(false)),
            healthy: true,
        }
    }

    pub fn playing_flag(&self) -> Arc<AtomicBool> {
        self.playing.clone()
    }

    pub fn run(&mut self) {
        debug!("audio playback worker started");

        while self.running.load(Ordering::Relaxed) {
            let frame = match self.queue.pop(Duration::from_millis(10)) {
                Some(frame) => frame,
                None => {
                    self.playing.store(false, Ordering::Relaxed);
                    continue;
                }
            };

            self.playing.store(true, Ordering::Relaxed);
            self.play(&frame);
        }

        let _ = self.sink.flush();
        self.playing.store(false, Ordering::Relaxed);
        debug!("audio playback worker stopped");
    }

    fn play(&mut self, frame: &AudioFrame) {
        let scaled: Vec<i16> = frame
            .samples
            .iter()
            .map(|&s| (f32::from(s) * self.gain) as i16)
            .collect();

        match self.sink.write(&scaled) {
            Ok(()) => {
                if !self.healthy {
                    info!("audio sink recovered");
                    self.healthy = true;
                }
            }
            Err(e) => {
                if self.healthy {
                    error!("audio sink failure ({}), playback unhealthy", e);
                    self.healthy = false;
                }
            }
        }
    }
}
