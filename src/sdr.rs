//! Sample sources and the tuning control task.
//!
//! The hardware driver lives behind the [`SampleSource`] seam: anything
//! that can deliver contiguous complex-baseband buffers can drive the
//! pipeline. The tree ships a replay source reading raw f32 I/Q from a
//! file and a synthetic source for tests; a hardware adapter plugs in
//! the same way. Delivery runs over a bounded channel so backpressure
//! is visible at the seam.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use num::complex::Complex32;

use crate::config::SdrConfig;
use crate::consts::BUF_SAMPLES;
use crate::error::{Error, Result};
use crate::types::Frequency;

/// Adapter contract for anything that can produce I/Q buffers.
pub trait SampleSource: Send {
    /// Apply device settings; called once before `start`.
    fn configure(&mut self, config: &SdrConfig) -> Result<()>;

    /// Tune to the given center frequency. Must be idempotent when the
    /// source is already there.
    fn tune(&mut self, freq: Frequency) -> Result<()>;

    /// Begin delivering buffers to `sink` from an internal producer.
    fn start(&mut self, sink: SyncSender<Vec<Complex32>>) -> Result<()>;

    /// Halt the producer and drain. Must return within roughly one
    /// buffer interval.
    fn stop(&mut self);

    /// Buffers lost to backpressure or device overruns. Not fatal.
    fn dropped_samples(&self) -> u64;
}

/// Enumerate attached SDR hardware. With no hardware backend compiled
/// in this is always empty; replay needs no device.
pub fn enumerate_devices() -> Vec<String> {
    Vec::new()
}

/// Replays raw baseband from a file of interleaved f32 I/Q pairs.
pub struct ReplaySource {
    path: PathBuf,
    freq: Frequency,
    throttle: bool,
    sample_rate: u32,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new<P: Into<PathBuf>>(path: P, throttle: bool) -> Self {
        ReplaySource {
            path: path.into(),
            freq: 0,
            throttle,
            sample_rate: 0,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }
}

impl SampleSource for ReplaySource {
    fn configure(&mut self, config: &SdrConfig) -> Result<()> {
        self.sample_rate = config.sample_rate;
        Ok(())
    }

    fn tune(&mut self, freq: Frequency) -> Result<()> {
        if self.freq != freq {
            debug!("replay source nominally tuned to {}", freq);
            self.freq = freq;
        }
        Ok(())
    }

    fn start(&mut self, sink: SyncSender<Vec<Complex32>>) -> Result<()> {
        let file = File::open(&self.path)
            .map_err(|e| Error::Device(format!("unable to open {}: {}", self.path.display(), e)))?;

        let running = self.running.clone();
        running.store(true, Ordering::Relaxed);

        let throttle = self.throttle;
        let sample_rate = self.sample_rate.max(1);

        self.handle = Some(std::thread::spawn(move || {
            let mut reader = BufReader::new(file);
            let mut bytes = vec![0u8; BUF_SAMPLES * 8];

            while running.load(Ordering::Relaxed) {
                let mut filled = 0;
                while filled < bytes.len() {
                    match reader.read(&mut bytes[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) => {
                            warn!("replay read error: {}", e);
                            return;
                        }
                    }
                }

                if filled < 8 {
                    debug!("replay file exhausted");
                    return;
                }

                let buf: Vec<Complex32> = bytes[..filled - filled % 8]
                    .chunks_exact(8)
                    .map(|c| {
                        let i = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                        let q = f32::from_le_bytes([c[4], c[5], c[6], c[7]]);
                        Complex32::new(i, q)
                    })
                    .collect();

                let len = buf.len();
                if sink.send(buf).is_err() {
                    return;
                }

                if throttle {
                    // Pace near real time so timeouts behave.
                    let ns = len as u64 * 1_000_000_000 / u64::from(sample_rate);
                    std::thread::sleep(std::time::Duration::from_nanos(ns));
                }
            }
        }));

        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Plays a canned sample vector once; used by tests and loopback runs.
pub struct SimSource {
    samples: Vec<Complex32>,
    freq: Frequency,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl SimSource {
    pub fn new(samples: Vec<Complex32>) -> Self {
        SimSource {
            samples,
            freq: 0,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }
}

impl SampleSource for SimSource {
    fn configure(&mut self, _config: &SdrConfig) -> Result<()> {
        Ok(())
    }

    fn tune(&mut self, freq: Frequency) -> Result<()> {
        self.freq = freq;
        Ok(())
    }

    fn start(&mut self, sink: SyncSender<Vec<Complex32>>) -> Result<()> {
        let running = self.running.clone();
        let dropped = self.dropped.clone();
        running.store(true, Ordering::Relaxed);

        let samples = std::mem::take(&mut self.samples);

        self.handle = Some(std::thread::spawn(move || {
            for chunk in samples.chunks(BUF_SAMPLES) {
                if !running.load(Ordering::Relaxed) {
                    return;
                }

                // Backpressure is counted before the blocking retry so
                // stalls are visible; canned data itself is never lost.
                match sink.try_send(chunk.to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(buf)) => {
                        dropped.fetch_add(buf.len() as u64, Ordering::Relaxed);
                        if sink.send(buf).is_err() {
                            return;
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
        }));

        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Tuning requests flowing back to the source.
pub enum ControlEvent {
    SetFreq(Frequency),
    Stop,
}

/// Owns the source handle and serializes tuning against it.
pub struct ControlTask {
    source: Arc<std::sync::Mutex<Box<dyn SampleSource>>>,
    events: Receiver<ControlEvent>,
}

impl ControlTask {
    pub fn new(
        source: Arc<std::sync::Mutex<Box<dyn SampleSource>>>,
        events: Receiver<ControlEvent>,
    ) -> Self {
        ControlTask { source, events }
    }

    pub fn run(&mut self) {
        loop {
            match self.events.recv() {
                Ok(ControlEvent::SetFreq(freq)) => {
                    info!("tuning to {} Hz", freq);
                    if let Err(e) = self.source.lock().expect("source poisoned").tune(freq) {
                        error!("tune failed: {}", e);
                    }
                }
                Ok(ControlEvent::Stop) | Err(_) => {
                    debug!("control task exiting");
                    return;
                }
            }
        }
    }
}
