#[macro_use]
extern crate log;

use std::fs::OpenOptions;
use std::io::{self, BufWriter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{App, Arg};

mod audio;
mod bits;
mod calls;
mod coding;
mod config;
mod consts;
mod decoder;
mod demod;
mod dmr;
mod dqpsk;
mod error;
mod filter;
mod follow;
mod fsk2;
mod fsk4;
mod p25;
mod recv;
mod sdr;
mod smartnet;
mod tetra;
mod types;
mod ui;

use audio::{AudioSink, AudioTask, PlaybackQueue, StreamSink};
use calls::CallTracker;
use config::Config;
use consts::{BUF_COUNT, CALL_SWEEP_MS};
use decoder::Decoder;
use demod::{Demod, DemodTask};
use recv::RecvTask;
use sdr::{ControlTask, ReplaySource, SampleSource};
use ui::StatusTask;

fn main() {
    let args = App::new("trunkrx")
        .about("Trunked radio system receiver")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .help("configuration file")
                .value_name("PATH")
                .default_value("config.json"),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .help("log level: debug, info, warning, error")
                .value_name("LEVEL")
                .default_value("info"),
        )
        .arg(
            Arg::with_name("log-file")
                .short("f")
                .long("log-file")
                .help("log to file instead of stderr")
                .value_name("PATH"),
        )
        .arg(
            Arg::with_name("devices")
                .short("d")
                .long("devices")
                .help("enumerate attached SDR devices and exit"),
        )
        .arg(
            Arg::with_name("replay")
                .short("r")
                .long("replay")
                .help("replay baseband samples (f32le I/Q) from FILE")
                .value_name("FILE"),
        )
        .get_matches();

    if let Err(e) = init_logging(
        args.value_of("log-level").unwrap(),
        args.value_of("log-file"),
    ) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }

    if args.is_present("devices") {
        let devices = sdr::enumerate_devices();
        if devices.is_empty() {
            println!("no SDR devices found");
        }
        for (i, name) in devices.iter().enumerate() {
            println!("  [{}] {}", i, name);
        }
        return;
    }

    if let Err(e) = run(args.value_of("config").unwrap(), args.value_of("replay")) {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str, file: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        other => bail!("invalid log level {:?}", other),
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter);

    if let Some(path) = file {
        let target = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open log file {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(target)));
    }

    builder.init();
    Ok(())
}

fn open_sink(device: &str) -> anyhow::Result<Box<dyn AudioSink>> {
    // The sink is any byte stream taking s16le mono PCM; "default"
    // discards, anything else is a file or fifo path.
    if device == "default" {
        Ok(Box::new(StreamSink::new(io::sink())))
    } else {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(device)
            .with_context(|| format!("unable to open audio output {}", device))?;
        Ok(Box::new(StreamSink::new(BufWriter::new(file))))
    }
}

fn open_source(
    config: &Config,
    replay: Option<&str>,
) -> anyhow::Result<Box<dyn SampleSource>> {
    let mut source: Box<dyn SampleSource> = match replay {
        Some(path) => Box::new(ReplaySource::new(path, false)),
        // No hardware backend is registered in this build; a driver
        // adapter implementing SampleSource slots in here.
        None => bail!(error::Error::Device(
            "no SDR devices detected; connect a device or use --replay".into()
        )),
    };

    source
        .configure(&config.sdr)
        .context("unable to configure sample source")?;

    Ok(source)
}

fn run(config_path: &str, replay: Option<&str>) -> anyhow::Result<()> {
    info!("trunkrx starting up");

    let config = Config::load(config_path)
        .with_context(|| format!("unable to load configuration {}", config_path))?;

    info!(
        "system: {} \"{}\", {} control channels",
        config.system.system_type.name(),
        config.system.name,
        config.system.control_channels.len()
    );

    for (tg, label) in &config.talkgroups.labels {
        debug!("talkgroup {}: {}", tg, label);
    }

    let queue = Arc::new(PlaybackQueue::with_default_depth());
    let tracker = Arc::new(CallTracker::new(queue.clone(), config.audio.record_calls));

    for &tg in &config.talkgroups.enabled {
        let priority = config.talkgroups.priority.get(&tg).copied().unwrap_or(5);
        tracker.enable_talkgroup(tg, priority);
    }

    let mut demod = Demod::for_system(config.system.system_type);
    demod.init(config.sdr.sample_rate);

    let decoder = Decoder::for_config(&config.system);

    let source = Arc::new(Mutex::new(open_source(&config, replay)?));

    let sink = open_sink(&config.audio.output_device)?;

    let ctlfreq = config.system.control_channels[0];

    let (tx_samples, rx_samples) = sync_channel(BUF_COUNT);
    let (tx_recv, rx_recv) = channel();
    let (tx_ctl, rx_ctl) = channel();
    let (tx_ui, rx_ui) = channel();

    let running = Arc::new(AtomicBool::new(true));

    let mut control = ControlTask::new(source.clone(), rx_ctl);
    let mut demod_task = DemodTask::new(demod, rx_samples, tx_ui.clone(), tx_recv.clone());
    let mut recv_task = RecvTask::new(
        decoder,
        tracker.clone(),
        rx_recv,
        tx_ctl,
        tx_ui,
        None,
        ctlfreq,
    );
    let mut audio_task = AudioTask::new(queue.clone(), sink, 1.0, running.clone());
    let mut status = StatusTask::new(rx_ui, tracker.clone());

    // Senders live only inside their tasks so channel closure tears the
    // pipeline down stage by stage.
    drop(tx_recv);

    source
        .lock()
        .expect("source poisoned")
        .start(tx_samples)
        .context("unable to start sample source")?;

    let control_thread = thread::spawn(move || {
        prctl::set_name("controller").ok();
        control.run();
    });

    let demod_thread = thread::spawn(move || {
        prctl::set_name("demod").ok();
        demod_task.run();
    });

    let recv_thread = thread::spawn(move || {
        prctl::set_name("receiver").ok();
        recv_task.run();
    });

    let audio_thread = thread::spawn(move || {
        prctl::set_name("audio").ok();
        audio_task.run();
    });

    let sweep_running = running.clone();
    let sweep_tracker = tracker.clone();
    let sweep_thread = thread::spawn(move || {
        prctl::set_name("sweep").ok();
        while sweep_running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(CALL_SWEEP_MS));
            sweep_tracker.sweep();
        }
    });

    println!("trunkrx running; monitoring control channel {}", ctlfreq);

    // The status task ends once the pipeline drains (replay exhausted)
    // or is killed.
    prctl::set_name("ui").ok();
    status.run();

    info!("shutting down");
    running.store(false, Ordering::Relaxed);
    queue.close();
    source.lock().expect("source poisoned").stop();

    for (name, handle) in [
        ("controller", control_thread),
        ("demod", demod_thread),
        ("receiver", recv_thread),
        ("audio", audio_thread),
        ("sweep", sweep_thread),
    ] {
        if handle.join().is_err() {
            warn!("{} thread panicked", name);
        }
    }

    let dropped = queue.dropped();
    if dropped > 0 {
        info!("{} audio frames dropped under backpressure", dropped);
    }

    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use num::complex::Complex32;
    use std::io::Write as _;

    /// End-to-end over the real thread topology: synthetic SmartNet
    /// baseband through replay source, demodulator, decoder, tracker.
    #[test]
    fn test_replay_pipeline_end_to_end() {
        let dir = std::env::temp_dir();
        let path = dir.join("trunkrx-e2e.iq");

        // Modulate a few OSW frames as binary FSK at 36 kHz.
        let mut bits = vec![0u8, 1, 0, 1, 0, 1, 0, 1];
        for _ in 0..4 {
            bits.extend(crate::smartnet::test::build_osw(101, 0, 10));
        }

        let sps = 10;
        let mut phase = 0.0f32;
        let mut file = std::fs::File::create(&path).unwrap();
        let mut bytes = Vec::new();
        for &bit in &bits {
            let freq = if bit != 0 { 600.0 } else { -600.0 };
            let step = 2.0 * std::f32::consts::PI * freq / 36_000.0;
            for _ in 0..sps {
                phase += step;
                bytes.extend_from_slice(&phase.cos().to_le_bytes());
                bytes.extend_from_slice(&phase.sin().to_le_bytes());
            }
        }
        file.write_all(&bytes).unwrap();
        drop(file);

        let config = Config::parse(
            r#"{
                "sdr": {"sample_rate": 36000},
                "system": {"type": "smartnet", "control_channels": [851000000],
                           "base_frequency": 851000000, "channel_spacing": 25000}
            }"#,
        )
        .unwrap();

        let queue = Arc::new(PlaybackQueue::with_default_depth());
        let tracker = Arc::new(CallTracker::new(queue, false));

        let mut demod = Demod::for_system(config.system.system_type);
        demod.init(config.sdr.sample_rate);
        let decoder = Decoder::for_config(&config.system);

        let (tx_samples, rx_samples) = sync_channel(BUF_COUNT);
        let (tx_recv, rx_recv) = channel();
        let (tx_ctl, rx_ctl) = channel();
        let (tx_ui, _rx_ui) = channel();

        let mut source = ReplaySource::new(&path, false);
        source.configure(&config.sdr).unwrap();
        source.start(tx_samples).unwrap();

        let mut demod_task = DemodTask::new(demod, rx_samples, tx_ui.clone(), tx_recv);
        let mut recv_task = RecvTask::new(
            decoder,
            tracker.clone(),
            rx_recv,
            tx_ctl,
            tx_ui,
            None,
            851_000_000,
        );

        let demod_thread = thread::spawn(move || demod_task.run());
        let recv_thread = thread::spawn(move || recv_task.run());

        // Drain tuning requests so the control channel never backs up.
        let ctl_thread = thread::spawn(move || while rx_ctl.recv().is_ok() {});

        demod_thread.join().unwrap();
        recv_thread.join().unwrap();
        ctl_thread.join().unwrap();
        source.stop();

        assert!(tracker.is_call_active(101));
        let call = tracker.active_call(101).unwrap();
        assert_eq!(call.grant.frequency, 851_250_000);
        assert_eq!(tracker.snapshot().total_calls, 1);

        let _ = std::fs::remove_file(&path);
    }

    /// A complex-sample identity: the pipeline survives buffers with
    /// gaps (dropped samples) without panicking and relocks after.
    #[test]
    fn test_pipeline_survives_sample_gap() {
        let mut demod = Demod::for_system(crate::types::SystemType::Smartnet);
        demod.init(36_000);

        let mut decoder_cfg = Config::parse(
            r#"{"system": {"type": "smartnet", "control_channels": [851000000]}}"#,
        )
        .unwrap();
        decoder_cfg.system.base_frequency = Some(851_000_000);
        decoder_cfg.system.channel_spacing = Some(25_000);
        let mut decoder = Decoder::for_config(&decoder_cfg.system);

        // A long alternating preamble absorbs the filter transient the
        // splice causes before the frame proper begins.
        let mut bits = Vec::new();
        for i in 0..24 {
            bits.push((i % 2) as u8);
        }
        bits.extend(crate::smartnet::test::build_osw(55, 0, 1));

        let sps = 10usize;
        let mut phase = 0.0f32;
        let mut samples = Vec::new();
        for &bit in &bits {
            let freq = if bit != 0 { 600.0 } else { -600.0 };
            let step = 2.0 * std::f32::consts::PI * freq / 36_000.0;
            for _ in 0..sps {
                phase += step;
                samples.push(Complex32::new(phase.cos(), phase.sin()));
            }
        }

        // First half, a hole, then the stream again from scratch.
        let half = samples.len() / 2 / sps * sps;
        let mut symbols = Vec::new();
        demod.process(&samples[..half], &mut |s| symbols.extend_from_slice(s));
        demod.process(&samples[..], &mut |s| symbols.extend_from_slice(s));
        demod.flush(&mut |s| symbols.extend_from_slice(s));

        let mut grants = 0;
        decoder.process_symbols(&symbols, &mut |e| {
            if let crate::types::DecoderEvent::Grant(_) = e {
                grants += 1;
            }
        });

        // The second, intact copy must decode regardless of the gap.
        assert!(grants >= 1);
    }
}
