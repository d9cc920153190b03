//! Discrete event channel simulation for multi-station DCF scenarios
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::vec;
use std::vec::Vec;

use log::{trace, debug, error};
use rand_core::RngCore;

use crate::Ts;
use crate::error::CoreError;
use crate::frame::{Address, Frame, FrameKind};
use crate::mac::{Config, Mac, MacEvent, UpperMac};
use crate::phy::ofdm_airtime;
use crate::phy::mock::{MockPhy, MockPhyError};
use crate::timer::mock::MockTimer;

pub type SimError = CoreError<MockPhyError>;

/// A frame put on air by a station
#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    pub station: usize,
    pub start: Ts,
    pub end: Ts,
    pub kind: FrameKind,
    pub receiver: Address,
    pub retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    TxEnd{ station: usize },
    RxStart{ station: usize, from: usize, data: Vec<u8> },
    RxEnd{ station: usize, from: usize },
}

#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    at: Ts,
    seq: u64,
    event: Event,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Reception {
    from: usize,
    data: Vec<u8>,
    corrupted: bool,
}

/// Simulated station, a DCF MAC attached to the shared channel
pub struct Station<G> {
    pub mac: UpperMac<MockPhy, MockTimer, G>,
    phy: MockPhy,

    receptions: Vec<Reception>,
    transmitting: bool,

    /// Frames delivered by the MAC
    pub delivered: Vec<Frame>,
    /// Exchange outcomes reported by the MAC
    pub events: Vec<MacEvent>,
}

/// Shared half-duplex channel between stations.
///
/// Overlapping receptions at a station corrupt each other, as does
/// transmitting while receiving. Connectivity is configurable per station
/// pair to model hidden terminals.
pub struct Simulation<G> {
    clock: MockTimer,
    rate_mbps: u32,
    propagation: Ts,

    stations: Vec<Station<G>>,
    links: Vec<Vec<bool>>,

    queue: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,

    transmissions: Vec<TxRecord>,
    overlaps: u32,
}

impl <G: RngCore> Simulation<G> {
    pub fn new(rate_mbps: u32, propagation: Ts) -> Self {
        Self {
            clock: MockTimer::new(),
            rate_mbps,
            propagation,
            stations: Vec::new(),
            links: Vec::new(),
            queue: BinaryHeap::new(),
            seq: 0,
            transmissions: Vec::new(),
            overlaps: 0,
        }
    }

    /// Add a station connected to all existing stations, returning its index
    pub fn add_station(&mut self, address: Address, config: Config, rng: G) -> Result<usize, SimError> {
        let phy = MockPhy::new(self.rate_mbps);
        let mac = UpperMac::new(address, config, phy.clone(), self.clock.clone(), rng)?;

        let index = self.stations.len();
        debug!("Adding station {} ({})", index, address);

        self.stations.push(Station {
            mac,
            phy,
            receptions: Vec::new(),
            transmitting: false,
            delivered: Vec::new(),
            events: Vec::new(),
        });

        for row in self.links.iter_mut() {
            row.push(true);
        }
        let mut row = vec![true; index + 1];
        row[index] = false;
        self.links.push(row);

        Ok(index)
    }

    /// Set whether stations `a` and `b` can hear each other
    pub fn set_link(&mut self, a: usize, b: usize, connected: bool) {
        self.links[a][b] = connected;
        self.links[b][a] = connected;
    }

    pub fn now(&self) -> Ts {
        self.clock.val()
    }

    pub fn station(&self, index: usize) -> &Station<G> {
        &self.stations[index]
    }

    pub fn stations(&self) -> &[Station<G>] {
        &self.stations
    }

    /// Frames transmitted so far
    pub fn transmissions(&self) -> &[TxRecord] {
        &self.transmissions
    }

    /// Number of times a station started a transmission while already on air
    pub fn overlaps(&self) -> u32 {
        self.overlaps
    }

    /// Queue a frame at a station
    pub fn enqueue(&mut self, station: usize, frame: Frame) -> Result<(), SimError> {
        let r = self.stations[station].mac.enqueue(frame);
        self.collect(station);
        r
    }

    /// Advance the clock to `time`, processing channel events and MAC timers
    pub fn advance_to(&mut self, time: Ts) -> Result<(), SimError> {
        while self.step(time)? {}

        if time > self.now() {
            self.clock.set_us(time);
        }
        Ok(())
    }

    /// Run until no events or alarms remain, or `limit` is reached.
    ///
    /// Returns the time of the last processed event.
    pub fn run(&mut self, limit: Ts) -> Result<Ts, SimError> {
        while self.step(limit)? {}
        Ok(self.now())
    }

    fn schedule(&mut self, at: Ts, event: Event) {
        self.seq += 1;
        self.queue.push(Reverse(Scheduled{ at, seq: self.seq, event }));
    }

    /// Process the next event or alarm at or before `end`
    fn step(&mut self, end: Ts) -> Result<bool, SimError> {
        let next_event = self.queue.peek().map(|Reverse(s)| s.at);
        let next_alarm = self.stations.iter()
            .filter_map(|s| s.mac.poll_timeout())
            .min();

        let next = match (next_event, next_alarm) {
            (Some(e), Some(a)) => e.min(a),
            (Some(e), None) => e,
            (None, Some(a)) => a,
            (None, None) => return Ok(false),
        };

        if next > end {
            return Ok(false);
        }

        let now = next.max(self.now());
        self.clock.set_us(now);

        // Channel events at an instant are handled before alarms
        if next_event == Some(next) {
            if let Some(Reverse(s)) = self.queue.pop() {
                self.handle(s.event)?;
            }
            return Ok(true);
        }

        for i in 0..self.stations.len() {
            match self.stations[i].mac.poll_timeout() {
                Some(t) if t <= now => {
                    let r = self.stations[i].mac.tick();
                    self.collect(i);
                    r?;
                },
                _ => (),
            }
        }

        Ok(true)
    }

    fn handle(&mut self, event: Event) -> Result<(), SimError> {
        trace!("Sim event {:?} at {} us", event, self.now());

        let (station, r) = match event {
            Event::TxEnd{ station } => {
                let s = &mut self.stations[station];
                s.transmitting = false;
                (station, s.mac.transmission_finished())
            },
            Event::RxStart{ station, from, data } => {
                let s = &mut self.stations[station];
                let idle = s.receptions.is_empty();
                let corrupted = s.transmitting || !idle;

                for r in s.receptions.iter_mut() {
                    r.corrupted = true;
                }
                s.receptions.push(Reception{ from, data, corrupted });

                let r = match idle {
                    true => s.mac.medium_state_changed(false),
                    false => Ok(()),
                };
                (station, r)
            },
            Event::RxEnd{ station, from } => {
                let s = &mut self.stations[station];
                let rx = match s.receptions.iter().position(|r| r.from == from) {
                    Some(i) => s.receptions.remove(i),
                    None => return Ok(()),
                };

                let mut r = s.mac.frame_received(&rx.data, !rx.corrupted);
                if r.is_ok() && s.receptions.is_empty() {
                    r = s.mac.medium_state_changed(true);
                }
                (station, r)
            },
        };

        self.collect(station);
        r
    }

    /// Put frames started by a station on air and gather MAC outputs
    fn collect(&mut self, index: usize) {
        let now = self.now();
        let sent = self.stations[index].phy.take_raw();

        for data in sent {
            let airtime = ofdm_airtime(data.len(), self.rate_mbps);

            let s = &mut self.stations[index];
            if s.transmitting {
                error!("Station {} started a transmission while on air at {} us", index, now);
                self.overlaps += 1;
            }
            s.transmitting = true;
            for r in s.receptions.iter_mut() {
                r.corrupted = true;
            }

            if let Ok(f) = Frame::decode(&data) {
                debug!("Station {} sends {} to {} at {} us", index, f.kind, f.receiver, now);
                self.transmissions.push(TxRecord {
                    station: index,
                    start: now,
                    end: now + airtime,
                    kind: f.kind,
                    receiver: f.receiver,
                    retry: f.is_retry(),
                });
            }

            self.schedule(now + airtime, Event::TxEnd{ station: index });

            for peer in 0..self.stations.len() {
                if !self.links[index][peer] {
                    continue;
                }
                let start = now + self.propagation;
                self.schedule(start, Event::RxStart{ station: peer, from: index, data: data.clone() });
                self.schedule(start + airtime, Event::RxEnd{ station: peer, from: index });
            }
        }

        let s = &mut self.stations[index];
        while let Ok(Some(f)) = s.mac.receive() {
            s.delivered.push(f);
        }
        while let Some(e) = s.mac.poll_event() {
            s.events.push(e);
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::vec;

    use bytes::Bytes;
    use rand::{SeedableRng, rngs::{StdRng, mock::StepRng}};

    use super::*;

    fn init() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Info, simplelog::Config::default());
    }

    fn addr(i: usize) -> Address {
        Address::from_u64(0x0200_0000_0000 + i as u64)
    }

    fn frame(to: usize, from: usize, n: usize, len: usize) -> Frame {
        let mut p = vec![0u8; len.max(2)];
        p[0] = from as u8;
        p[1] = n as u8;
        Frame::data(addr(to), Address::UNSPECIFIED, Bytes::from(p))
    }

    fn seeded(n: usize, config: Config) -> Simulation<StdRng> {
        let mut sim = Simulation::new(6, 1);
        for i in 0..n {
            sim.add_station(addr(i), config.clone(), StdRng::seed_from_u64(i as u64 + 7)).unwrap();
        }
        sim.advance_to(1000).unwrap();
        sim
    }

    fn succeeded(s: &Station<impl RngCore>) -> usize {
        s.events.iter().filter(|e| matches!(e, MacEvent::TransmitSucceeded{ .. })).count()
    }

    #[test]
    fn single_link_delivers_in_order() {
        init();
        let mut sim = seeded(2, Config::default());

        for n in 0..5 {
            sim.enqueue(0, frame(1, 0, n, 64)).unwrap();
        }
        sim.run(1_000_000).unwrap();

        let rx = &sim.station(1).delivered;
        assert_eq!(rx.len(), 5);
        for (n, f) in rx.iter().enumerate() {
            assert_eq!(f.payload()[1], n as u8);
            assert_eq!(f.seq, n as u16);
            assert_eq!(f.transmitter, addr(0));
        }

        assert_eq!(succeeded(sim.station(0)), 5);
        assert_eq!(sim.station(0).mac.stats().retries, 0);
        assert_eq!(sim.overlaps(), 0);
    }

    #[test]
    fn saturated_contention() {
        init();
        let n = 4;
        let per_station = 10;
        let mut sim = seeded(n, Config::default());

        for i in 0..n {
            for k in 0..per_station {
                sim.enqueue(i, frame((i + 1) % n, i, k, 200)).unwrap();
            }
        }
        sim.run(10_000_000).unwrap();

        let mut seen = BTreeSet::new();
        for s in sim.stations() {
            assert_eq!(succeeded(s), per_station);
            for f in s.delivered.iter() {
                assert!(seen.insert((f.payload()[0], f.payload()[1])), "duplicate delivery");
            }
        }
        assert_eq!(seen.len(), n * per_station);
        assert_eq!(sim.overlaps(), 0);

        // Each station sends one frame at a time
        for i in 0..n {
            let tx: Vec<_> = sim.transmissions().iter().filter(|t| t.station == i).collect();
            for w in tx.windows(2) {
                assert!(w[1].start >= w[0].end);
            }
        }
    }

    #[test]
    fn hidden_terminals_with_rts() {
        init();
        let config = Config { rts_threshold: 0, ..Default::default() };
        let mut sim = seeded(3, config);

        // 0 and 2 can only hear 1
        sim.set_link(0, 2, false);

        for k in 0..5 {
            sim.enqueue(0, frame(1, 0, k, 1000)).unwrap();
            sim.enqueue(2, frame(1, 2, k, 1000)).unwrap();
        }
        sim.run(10_000_000).unwrap();

        assert_eq!(sim.station(1).delivered.len(), 10);
        assert_eq!(succeeded(sim.station(0)), 5);
        assert_eq!(succeeded(sim.station(2)), 5);

        // DATA is always preceded by a CTS from the receiver
        let tx = sim.transmissions();
        for (i, t) in tx.iter().enumerate().filter(|(_, t)| t.kind == FrameKind::Data) {
            assert!(tx[..i].iter().rev().any(|c| c.kind == FrameKind::Cts && c.station == 1 && c.receiver == addr(t.station)));
        }
    }

    #[test]
    fn collision_leads_to_eifs_and_failure() {
        init();
        let config = Config { short_retry_limit: 2, ..Default::default() };
        let mut sim = Simulation::new(6, 1);
        for i in 0..3 {
            sim.add_station(addr(i), config.clone(), StepRng::new(0, 0)).unwrap();
        }
        sim.advance_to(1000).unwrap();

        // Zero backoff, both transmit at the same instant every attempt
        sim.enqueue(0, frame(2, 0, 0, 100)).unwrap();
        sim.enqueue(1, frame(2, 1, 0, 100)).unwrap();
        sim.run(1_000_000).unwrap();

        let r = sim.station(2);
        assert!(r.delivered.is_empty());
        assert_eq!(r.mac.stats().corrupted, 6);
        assert!(r.mac.medium().eifs_pending());

        for i in 0..2 {
            assert_eq!(sim.station(i).events, vec![MacEvent::TransmitFailed{ receiver: addr(2), seq: 0, retries: 2 }]);
        }

        // The overheard (corrupted) DATA sets the NAV over its ACK slot,
        // retries then wait EIFS from NAV expiry
        let nav = 16 + 44;
        let data: Vec<_> = sim.transmissions().iter().filter(|t| t.station == 0).collect();
        assert_eq!(data.len(), 3);
        for w in data.windows(2) {
            assert_eq!(w[1].start, w[0].end + 1 + nav + 94);
            assert!(w[1].retry);
        }
    }
}
