//! Replay a recorded trace into a bus and print the device graph it builds.
//!
//! ```text
//! jacbus-replay <trace file> [speed] [options.yaml]
//! ```
//!
//! Log output follows `RUST_LOG` (default `info`).

use std::time::Duration;

use anyhow::{Context, bail};
use jacbus::{Bus, BusOptions, FramePlayer, PlayerEvent, Trace};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(trace_path) = args.next() else {
        bail!("usage: jacbus-replay <trace file> [speed] [options.yaml]");
    };
    let speed: f64 = match args.next() {
        Some(raw) => raw.parse().with_context(|| format!("invalid speed `{raw}`"))?,
        None => 1.0,
    };
    if speed.is_nan() || speed <= 0.0 {
        bail!("speed must be positive, got {speed}");
    }
    let options = match args.next() {
        Some(path) => BusOptions::from_file(&path).with_context(|| format!("loading {path}"))?,
        None => BusOptions::default(),
    };

    let trace = Trace::from_file(&trace_path)?;
    let bus = Bus::new(options)?;
    let player = FramePlayer::from_trace(&bus, trace, speed);
    let mut events = player.subscribe();
    player.start();

    let hard_stop = Duration::from_secs_f64(player.duration() / speed / 1000.0) + Duration::from_secs(5);
    let deadline = tokio::time::sleep(hard_stop);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PlayerEvent::Progress(p)) => info!(progress = format!("{:.0}%", p * 100.0), "replaying"),
                Ok(PlayerEvent::Stopped) | Err(_) => break,
                Ok(_) => {}
            },
            _ = &mut deadline => {
                warn!("replay did not finish in time, stopping");
                player.stop();
                break;
            }
        }
    }

    for device in bus.devices() {
        let classes = device.service_classes();
        let services: Vec<String> = bus.read_state(|state| {
            classes
                .into_iter()
                .map(|class| match state.catalog().lookup(class) {
                    Some(spec) => spec.name.clone(),
                    None => format!("0x{class:08x}"),
                })
                .collect()
        });
        println!("{} [{}]", device.id(), services.join(", "));
    }
    let stats = bus.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
