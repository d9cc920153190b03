//! DCF Channel Simulation Example
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::time::Duration;

use log::{info, warn};

use structopt::StructOpt;

use bytes::Bytes;
use rand::{SeedableRng, rngs::StdRng};

use wlan_dcf::prelude::*;
use wlan_dcf::sim::Simulation;


#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(long, default_value = "4")]
    /// Number of stations sharing the channel
    pub stations: usize,

    #[structopt(long, default_value = "20")]
    /// Frames queued by each station
    pub frames: usize,

    #[structopt(long, default_value = "500")]
    /// Payload length in bytes
    pub payload: usize,

    #[structopt(long, default_value = "2346")]
    /// Frames of at least this length are sent with RTS/CTS
    pub rts_threshold: usize,

    #[structopt(long, default_value = "6")]
    /// PHY rate in Mbps
    pub rate: u32,

    #[structopt(long)]
    /// Station pairs that cannot hear each other, as `a:b`
    pub hidden: Vec<String>,

    #[structopt(long, default_value = "1s", parse(try_from_str = humantime::parse_duration))]
    /// Simulated time limit
    pub duration: Duration,

    #[structopt(long, default_value = "1")]
    /// Seed for backoff draws
    pub seed: u64,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}

fn parse_pair(s: &str) -> anyhow::Result<(usize, usize)> {
    let mut parts = s.splitn(2, ':');
    let a = parts.next().unwrap_or("").parse()?;
    let b = parts.next().ok_or_else(|| anyhow::anyhow!("expected a:b, got '{}'", s))?.parse()?;
    Ok((a, b))
}

fn main() -> anyhow::Result<()> {
    // Load options
    let opts = Options::from_args();

    // Initialise logging
    let _ = simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default());

    let config = MacConfig {
        rts_threshold: opts.rts_threshold,
        max_queue_size: opts.frames.max(1).min(wlan_dcf::mac::config::TX_QUEUE_CAPACITY),
        ..Default::default()
    };

    // Setup stations
    let mut sim = Simulation::new(opts.rate, 1);
    for i in 0..opts.stations {
        let rng = StdRng::seed_from_u64(opts.seed.wrapping_add(i as u64));
        sim.add_station(MacAddress::from_u64(0x0200_0000_0000 + i as u64), config.clone(), rng)?;
    }

    for h in &opts.hidden {
        let (a, b) = parse_pair(h)?;
        info!("Stations {} and {} are hidden from each other", a, b);
        sim.set_link(a, b, false);
    }

    // Each station sends to its neighbour
    let mut queued = 0;
    for i in 0..opts.stations {
        let dest = MacAddress::from_u64(0x0200_0000_0000 + ((i + 1) % opts.stations) as u64);

        for n in 0..opts.frames {
            let mut payload = vec![0u8; opts.payload.max(2)];
            payload[0] = i as u8;
            payload[1] = n as u8;

            let frame = Frame::data(dest, MacAddress::UNSPECIFIED, Bytes::from(payload));
            match sim.enqueue(i, frame) {
                Ok(_) => queued += 1,
                Err(e) => warn!("Station {} enqueue failed: {}", i, e),
            }
        }
    }

    let end = sim.run(opts.duration.as_micros() as Ts)?;

    info!("Simulation finished at {} us, {} frames queued, {} transmissions", end, queued, sim.transmissions().len());

    let mut delivered = 0;
    for (i, s) in sim.stations().iter().enumerate() {
        let stats = s.mac.stats();
        delivered += s.delivered.len();

        println!("station {} ({}): {:?}", i, s.mac.address(), stats);
    }

    let throughput = match end {
        0 => 0.0,
        _ => (delivered * opts.payload * 8) as f64 / end as f64,
    };
    println!("delivered {} / {} frames, {:.2} Mbps goodput", delivered, queued, throughput);

    Ok(())
}
