use chrono::Utc;
use failure::Error;
use futures::StreamExt;
use log::*;
use std::process;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use vantagerx::hop::tracker::loop_period;
use vantagerx::hop::{
    ChannelPlan, HopEvent, HopTracker, PacketOutcome, Region, Step, Sweep, TrackerConfig,
};
use vantagerx::report::{Aggregator, Observation, SinkConfig};
use vantagerx::sdr::framer::PacketCodec;
use vantagerx::sdr::rtl::{Radio, RadioConfig};
use vantagerx::wx::{wind, Bucket};

#[derive(StructOpt)]
#[structopt(
    name = "vantagerx",
    about = "hop-tracking rtl-sdr receiver for Davis Instruments weather stations"
)]
struct Cli {
    /// Transmitters to listen for: tr1=1, tr2=2, tr3=4, tr4=8, tr5=16,
    /// tr6=32, tr7=64, tr8=128
    #[structopt(long = "tr", default_value = "1")]
    tr: u8,

    /// Extra receive-window time in msec
    #[structopt(long = "ex", default_value = "0")]
    ex: u64,

    /// Frequency correction in Hz for all channels
    #[structopt(long = "fc", default_value = "0")]
    fc: i32,

    /// Frequency correction of the rtl dongle in ppm
    #[structopt(long = "ppm", default_value = "0")]
    ppm: i32,

    /// Tuner gain in tenths of a dB, 0 selects AGC
    #[structopt(long = "gain", default_value = "0")]
    gain: i32,

    /// Max missed-packets-in-a-row before a new init
    #[structopt(long = "maxmissed", default_value = "51")]
    maxmissed: u32,

    /// Transmitter frequencies: EU, US or NZ
    #[structopt(long = "tf", default_value = "US")]
    tf: Region,

    /// Log packets from station ids outside the active set
    #[structopt(short = "u")]
    undefined: bool,

    /// Log every received packet
    #[structopt(short = "v")]
    verbose: bool,

    /// Disable automatic frequency correction
    #[structopt(long = "noafc")]
    noafc: bool,

    /// Device index
    #[structopt(short = "d", default_value = "0")]
    device: String,

    /// POST decoded reports to this URL; empty logs them instead
    #[structopt(long = "gs", default_value = "")]
    gs: String,

    /// Value for the x-api-key header on report delivery
    #[structopt(long = "apikey", default_value = "")]
    apikey: String,

    /// Sweep start frequency in Hz (test mode)
    #[structopt(long = "startfreq", default_value = "0")]
    startfreq: u32,

    /// Sweep end frequency in Hz (test mode)
    #[structopt(long = "endfreq", default_value = "0")]
    endfreq: u32,

    /// Sweep step in Hz (test mode)
    #[structopt(long = "stepfreq", default_value = "0")]
    stepfreq: u32,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();
    let args = Cli::from_args();

    let plan = ChannelPlan::new(args.tf);
    plan.log();
    info!(
        "tr={:#010b} fc={} ppm={} gain={} maxmissed={} ex={} undefined={} noafc={}",
        args.tr, args.fc, args.ppm, args.gain, args.maxmissed, args.ex, args.undefined, args.noafc
    );

    let sweep_mode = args.startfreq != 0 && args.endfreq != 0 && args.stepfreq != 0;
    let initial_freq = if sweep_mode {
        args.startfreq
    } else {
        plan.freq(plan.seq_to_hop(0))
    };

    let (radio, mut tuner) = match Radio::open(&RadioConfig {
        device: args.device.clone(),
        center_freq: (initial_freq as i64 + args.fc as i64) as u32,
        ppm: args.ppm,
        gain: args.gain,
    }) {
        Ok(pair) => pair,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    // Retunes run on their own task so PLL settle time never stalls the
    // sample pump; only the last hop before a deadline matters, so a full
    // queue just drops the event.
    let (hop_tx, mut hop_rx) = mpsc::channel::<HopEvent>(8);
    let fc = args.fc;
    let retuner = tokio::spawn(async move {
        while let Some(hop) = hop_rx.recv().await {
            let target = (hop.freq_hz as i64 + hop.freq_correction_hz as i64 + fc as i64) as u32;
            debug!(
                "tuning slot {} -> {} Hz (correction {:+} Hz)",
                hop.channel_idx, target, hop.freq_correction_hz
            );
            if let Err(e) = tuner.set_center_freq(target) {
                error!("{}", e);
            }
        }
        tuner.cancel();
    });

    let aggregator = Aggregator::start(SinkConfig {
        server_url: args.gs.clone(),
        api_key: args.apikey.clone(),
        bucket: Bucket::for_region(args.tf),
        ..SinkConfig::default()
    });

    let framed = FramedRead::with_capacity(radio, PacketCodec::new(), 32 * 1024);

    let exit_code = if sweep_mode {
        let sweep = Sweep::new(args.startfreq, args.endfreq, args.stepfreq);
        run_sweep(framed, hop_tx, sweep, &plan, args.tr).await?
    } else {
        let cfg = TrackerConfig {
            active_mask: args.tr,
            max_missed: args.maxmissed,
            extra: Duration::from_millis(args.ex),
            afc: !args.noafc,
            ..TrackerConfig::default()
        };
        let tracker = HopTracker::new(plan, cfg)?;
        run_tracking(
            framed,
            hop_tx,
            &aggregator,
            tracker,
            args.verbose,
            args.undefined,
        )
        .await?;
        0
    };

    let _ = retuner.await;
    aggregator.shutdown().await;
    info!("shutdown complete");
    if exit_code != 0 {
        process::exit(exit_code);
    }
    Ok(())
}

/// Forward a tracker step to the retuner and convert its deadline for the
/// timer.
fn apply_step(hop_tx: &mpsc::Sender<HopEvent>, step: Step) -> tokio::time::Instant {
    if hop_tx.try_send(step.hop).is_err() {
        warn!("retuner backlogged, dropping hop event");
    }
    tokio::time::Instant::from_std(step.deadline)
}

async fn run_tracking(
    mut framed: FramedRead<Radio, PacketCodec>,
    hop_tx: mpsc::Sender<HopEvent>,
    aggregator: &Aggregator,
    mut tracker: HopTracker,
    verbose: bool,
    log_undefined: bool,
) -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut deadline = apply_step(&hop_tx, tracker.start(Instant::now()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            _ = tokio::time::sleep_until(deadline) => {
                deadline = apply_step(&hop_tx, tracker.timeout(Instant::now()));
            }
            frame = framed.next() => match frame {
                Some(Ok(packet)) => {
                    match tracker.packet(Instant::now(), &packet) {
                        PacketOutcome::Accepted { id, step } => {
                            if verbose {
                                info!(
                                    "{} id={} wind {:.1} mph @ {} deg",
                                    packet,
                                    id,
                                    wind::corrected_wind_speed_mph(
                                        packet.wind_speed_mph(),
                                        packet.data[2]
                                    ),
                                    packet.wind_direction_deg(),
                                );
                            }
                            aggregator.add(Observation {
                                packet,
                                received_at: Utc::now(),
                            });
                            if let Some(step) = step {
                                deadline = apply_step(&hop_tx, step);
                            }
                        }
                        PacketOutcome::Undefined(id) => {
                            if log_undefined {
                                info!("undefined: {} id={}", packet, id);
                            }
                        }
                        PacketOutcome::Duplicate => {}
                    }
                }
                Some(Err(e)) => error!("error reading samples: {}", e),
                None => {
                    error!("sample stream ended");
                    break;
                }
            },
        }
    }
    Ok(())
}

async fn run_sweep(
    mut framed: FramedRead<Radio, PacketCodec>,
    hop_tx: mpsc::Sender<HopEvent>,
    mut sweep: Sweep,
    plan: &ChannelPlan,
    active_mask: u8,
) -> Result<i32, Error> {
    let mut sigterm = signal(SignalKind::terminate())?;

    // park on each frequency long enough for a full rotation of the
    // slowest selected station
    let slowest = (0..8u8)
        .rev()
        .find(|id| active_mask & (1 << id) != 0)
        .unwrap_or(0);
    let dwell = (plan.count() as u32 + 2) * loop_period(slowest);

    let mut deadline = match tune_next(&hop_tx, &mut sweep, dwell) {
        Some(d) => d,
        None => return Ok(2),
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(0),
            _ = sigterm.recv() => return Ok(0),
            _ = tokio::time::sleep_until(deadline) => {
                sweep.log_missed();
                deadline = match tune_next(&hop_tx, &mut sweep, dwell) {
                    Some(d) => d,
                    None => break,
                };
            }
            frame = framed.next() => match frame {
                Some(Ok(packet)) if active_mask & (1 << packet.station_id()) != 0 => {
                    sweep.log_ok(packet.freq_error_hz, &packet.data);
                    deadline = match tune_next(&hop_tx, &mut sweep, dwell) {
                        Some(d) => d,
                        None => break,
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => error!("error reading samples: {}", e),
                None => {
                    error!("sample stream ended");
                    return Ok(0);
                }
            },
        }
    }

    info!("sweep reached endfreq, done");
    Ok(2)
}

fn tune_next(
    hop_tx: &mpsc::Sender<HopEvent>,
    sweep: &mut Sweep,
    dwell: Duration,
) -> Option<tokio::time::Instant> {
    let freq_hz = sweep.next_freq()?;
    let _ = hop_tx.try_send(HopEvent {
        channel_idx: 0,
        freq_hz,
        freq_correction_hz: 0,
    });
    Some(tokio::time::Instant::now() + dwell)
}
