//! DCF upper MAC, queueing, exchange selection and responses
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{trace, debug, info, warn, error};

use heapless::{LinearMap, Vec, spsc::Queue};
use rand_core::RngCore;

use crate::Ts;
use crate::error::CoreError;
use crate::frame::{Address, Frame, FrameKind, CTS_LEN, MAX_FRAME_LEN, MAX_PAYLOAD_LEN, SEQ_MODULO};
use crate::phy::Phy;
use crate::timer::{Alarm, Timer};

use super::Mac;
use super::config::{Config, MAX_ACCESS_CATEGORIES, TX_QUEUE_CAPACITY};
use super::contention::ContentionTx;
use super::exchange::{cts_duration, ExchangeContext, ExchangeStatus, FrameExchange};
use super::immediate::{ImmediateTx, Requester};
use super::medium::{MediumTracker, ReceptionState, TransmissionState};

/// Received frames buffered for the upper layer
pub const RX_QUEUE_CAPACITY: usize = 16;

/// Exchange outcomes buffered for the upper layer
pub const EVENT_QUEUE_CAPACITY: usize = 16;

/// Transmitters tracked for duplicate detection
pub const DUPLICATE_CACHE_SIZE: usize = 16;

/// Outcome of a queued transmission
#[derive(Debug, Clone, PartialEq)]
pub enum MacEvent {
    TransmitSucceeded {
        receiver: Address,
        seq: u16,
        retries: u8,
    },
    TransmitFailed {
        receiver: Address,
        seq: u16,
        retries: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacStats {
    /// Exchanges completed successfully
    pub sent: u32,
    /// Exchanges completed without any retransmission
    pub sent_without_retry: u32,
    /// Retransmissions across all exchanges
    pub retries: u32,
    /// Exchanges abandoned at the retry limit
    pub given_up: u32,
    /// Data frames delivered to the upper layer
    pub received: u32,
    /// Retransmitted data frames dropped as duplicates
    pub duplicates: u32,
    /// Receptions with bit errors or undecodable headers
    pub corrupted: u32,
    /// Frames rejected by a full transmit queue
    pub queue_drops: u32,
    /// Frames dropped by a full receive buffer
    pub rx_drops: u32,
    /// Exchange outcomes dropped by a full event queue
    pub event_drops: u32,
}

impl MacStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Transmitter currently on air
#[derive(Debug, Clone, Copy, PartialEq)]
enum TxSource {
    Contention(usize),
    Immediate,
}

/// Alarm owners, in tie-break priority order
#[derive(Debug, Clone, Copy, PartialEq)]
enum AlarmSource {
    Nav,
    Immediate,
    Reply,
    Contention(usize),
}

macro_rules! exchange_ctx {
    ($s:ident, $now:expr, $ac:expr) => {
        ExchangeContext {
            now: $now,
            config: &$s.config,
            medium: &$s.medium,
            contention: &mut $s.contention[$ac],
            immediate: &mut $s.immediate,
            rng: &mut $s.rng,
        }
    };
}

/// DCF MAC generic over a PHY (P), Timer (T) and random source (G).
///
/// The MAC is driven by the PHY event methods (`medium_state_changed`,
/// `frame_received`, `transmission_finished`) and by calling `tick` at or
/// after the instant returned by `poll_timeout`.
pub struct UpperMac<P, T, G> {
    address: Address,
    config: Config,

    phy: P,
    timer: T,
    rng: G,

    medium: MediumTracker,
    contention: Vec<ContentionTx, MAX_ACCESS_CATEGORIES>,
    immediate: ImmediateTx,
    exchange: Option<FrameExchange>,
    on_air: Option<TxSource>,

    seq: u16,
    last_seen: LinearMap<Address, (u16, Ts), DUPLICATE_CACHE_SIZE>,

    stats: MacStats,

    tx_buff: Queue<Frame, { TX_QUEUE_CAPACITY + 1 }>,
    rx_buff: Queue<Frame, { RX_QUEUE_CAPACITY + 1 }>,
    events: Queue<MacEvent, { EVENT_QUEUE_CAPACITY + 1 }>,

    /// Buffer for encode operations
    buff: [u8; MAX_FRAME_LEN],
}

impl <P, T, G> UpperMac<P, T, G>
where
    P: Phy,
    T: Timer,
    G: RngCore,
{
    /// Create a new MAC with the provided address and configuration
    pub fn new(address: Address, config: Config, phy: P, timer: T, rng: G) -> Result<Self, CoreError<P::Error>> {
        config.validate().map_err(CoreError::InvalidConfig)?;

        let now = timer.ticks_us();

        let mut contention = Vec::new();
        for ac in 0..config.access_categories {
            let _ = contention.push(ContentionTx::new(ac));
        }

        debug!("Setup DCF MAC with address {} at {} us ({} access categories)", address, now, config.access_categories);

        Ok(Self {
            address,
            config,
            phy,
            timer,
            rng,

            medium: MediumTracker::new(now),
            contention,
            immediate: ImmediateTx::new(),
            exchange: None,
            on_air: None,

            seq: 0,
            last_seen: LinearMap::new(),

            stats: MacStats::new(),

            tx_buff: Queue::new(),
            rx_buff: Queue::new(),
            events: Queue::new(),

            buff: [0u8; MAX_FRAME_LEN],
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn medium(&self) -> &MediumTracker {
        &self.medium
    }

    pub fn contention(&self, ac: usize) -> Option<&ContentionTx> {
        self.contention.get(ac)
    }

    pub fn exchange(&self) -> Option<&FrameExchange> {
        self.exchange.as_ref()
    }

    pub fn stats(&self) -> MacStats {
        self.stats.clone()
    }

    /// Number of frames awaiting transmission
    pub fn queue_len(&self) -> usize {
        self.tx_buff.len()
    }

    /// Fetch the next exchange outcome
    pub fn poll_event(&mut self) -> Option<MacEvent> {
        self.events.dequeue()
    }

    /// Earliest pending alarm, `tick` should be called at this instant
    pub fn poll_timeout(&self) -> Option<Ts> {
        self.alarms()
            .filter_map(|(a, _)| a.deadline())
            .min()
    }

    /// Queue a frame for transmission.
    ///
    /// The transmitter address and sequence number are assigned when the
    /// frame reaches the head of the queue.
    pub fn enqueue(&mut self, frame: Frame) -> Result<(), CoreError<P::Error>> {
        let now = self.now();

        if frame.payload().len() > MAX_PAYLOAD_LEN {
            warn!("Rejecting {} byte payload to {} at {} us, limit is {} bytes", frame.payload().len(), frame.receiver, now, MAX_PAYLOAD_LEN);
            return Err(CoreError::PayloadTooLong(frame));
        }

        if self.tx_buff.len() >= self.config.max_queue_size {
            warn!("TX queue full at {} us, dropping frame to {}", now, frame.receiver);
            self.stats.queue_drops = self.stats.queue_drops.saturating_add(1);
            return Err(CoreError::BufferFull(frame));
        }

        trace!("Enqueue {} byte frame to {} at {} us", frame.len(), frame.receiver, now);

        if let Err(frame) = self.tx_buff.enqueue(frame) {
            self.stats.queue_drops = self.stats.queue_drops.saturating_add(1);
            return Err(CoreError::BufferFull(frame));
        }

        self.dispatch(now)?;
        self.check_exchange(now)?;
        self.run_timers(now)
    }

    /// PHY clear channel assessment changed, `free` when no reception is in progress
    pub fn medium_state_changed(&mut self, free: bool) -> Result<(), CoreError<P::Error>> {
        let now = self.now();

        let state = match free {
            true => ReceptionState::Idle,
            false => ReceptionState::Busy,
        };
        if let Some(f) = self.medium.reception_state_changed(now, state) {
            self.notify(now, f);
        }

        if free {
            if let Some(x) = self.exchange.as_mut() {
                let ac = x.access_category();
                x.reception_ended::<P::Error, _>(exchange_ctx!(self, now, ac))?;
            }
        }

        self.check_exchange(now)?;
        self.run_timers(now)
    }

    /// PHY completed the current transmission
    pub fn transmission_finished(&mut self) -> Result<(), CoreError<P::Error>> {
        let now = self.now();

        let source = match self.on_air.take() {
            Some(s) => s,
            None => {
                warn!("Transmission finished at {} us with nothing on air", now);
                return Ok(());
            }
        };

        trace!("Transmission from {:?} finished at {} us", source, now);

        if let Some(f) = self.medium.transmission_state_changed(now, TransmissionState::Idle) {
            self.notify(now, f);
        }

        self.release(now, source)?;

        self.check_exchange(now)?;
        self.run_timers(now)
    }

    /// PHY completed a reception, `fcs_ok` is false where bit errors were detected
    pub fn frame_received(&mut self, data: &[u8], fcs_ok: bool) -> Result<(), CoreError<P::Error>> {
        let now = self.now();

        let frame = match Frame::decode(data) {
            Ok(f) => Some(f),
            Err(e) => {
                debug!("Failed to decode {} byte frame at {} us: {:?}", data.len(), now, e);
                None
            }
        };
        let fcs_ok = fcs_ok && frame.is_some();

        match &frame {
            Some(f) => trace!("Received {} from {} to {} at {} us (fcs ok: {})", f.kind, f.transmitter, f.receiver, now, fcs_ok),
            None => (),
        }

        if !fcs_ok {
            self.stats.corrupted = self.stats.corrupted.saturating_add(1);
        }

        if let Some(f) = self.medium.frame_received(now, frame.as_ref(), fcs_ok, self.address) {
            self.notify(now, f);
        }

        let mut consumed = false;
        if let Some(x) = self.exchange.as_mut() {
            let ac = x.access_category();
            consumed = x.frame_received::<P::Error, _>(exchange_ctx!(self, now, ac), frame.as_ref(), fcs_ok)?;
        }

        if let (false, true, Some(f)) = (consumed, fcs_ok, frame) {
            self.respond(now, f)?;
        }

        self.check_exchange(now)?;
        self.run_timers(now)
    }

    fn now(&self) -> Ts {
        self.timer.ticks_us()
    }

    fn alarms(&self) -> impl Iterator<Item=(&Alarm, AlarmSource)> {
        core::iter::once((self.medium.alarm(), AlarmSource::Nav))
            .chain(core::iter::once((self.immediate.alarm(), AlarmSource::Immediate)))
            .chain(self.exchange.as_ref().map(|x| (x.alarm(), AlarmSource::Reply)))
            .chain(self.contention.iter().enumerate().map(|(i, c)| (c.alarm(), AlarmSource::Contention(i))))
    }

    /// Earliest expired alarm, ties resolved by arming time then owner
    fn next_expired(&self, now: Ts) -> Option<AlarmSource> {
        let mut next: Option<((Ts, Ts), AlarmSource)> = None;

        for (alarm, source) in self.alarms() {
            let key = match alarm.key() {
                Some(k) if k.0 <= now => k,
                _ => continue,
            };

            match next {
                Some((k, _)) if k <= key => (),
                _ => next = Some((key, source)),
            }
        }

        next.map(|(_, s)| s)
    }

    fn run_timers(&mut self, now: Ts) -> Result<(), CoreError<P::Error>> {
        while let Some(source) = self.next_expired(now) {
            trace!("Alarm {:?} expired at {} us", source, now);

            match source {
                AlarmSource::Nav => {
                    if let Some(f) = self.medium.handle_timeout(now) {
                        self.notify(now, f);
                    }
                },
                AlarmSource::Immediate => {
                    if let Some(frame) = self.immediate.handle_timeout(now) {
                        self.start_transmit(now, frame, TxSource::Immediate)?;
                    }
                },
                AlarmSource::Reply => {
                    if let Some(x) = self.exchange.as_mut() {
                        let ac = x.access_category();
                        x.handle_timeout::<P::Error, _>(exchange_ctx!(self, now, ac))?;
                    }
                },
                AlarmSource::Contention(ac) => {
                    if let Some(frame) = self.contention[ac].handle_timeout(now, &mut self.medium) {
                        self.start_transmit(now, frame, TxSource::Contention(ac))?;
                    }
                },
            }

            self.check_exchange(now)?;
        }

        Ok(())
    }

    /// Push a medium free / busy transition to every contention engine
    fn notify(&mut self, now: Ts, free: bool) {
        for c in self.contention.iter_mut() {
            c.medium_state_changed(now, free, &self.medium);
        }
    }

    /// Return a transmitter to idle once its frame is done with, whether sent
    /// or abandoned, and advance the exchange that requested it
    fn release(&mut self, now: Ts, source: TxSource) -> Result<(), CoreError<P::Error>> {
        let for_exchange = match source {
            TxSource::Contention(ac) => {
                self.contention[ac].transmission_finished(now);
                true
            },
            TxSource::Immediate => {
                self.immediate.transmission_finished(now) == Some(Requester::Exchange)
            },
        };

        if for_exchange {
            if let Some(x) = self.exchange.as_mut() {
                let ac = x.access_category();
                x.transmission_finished::<P::Error, _>(exchange_ctx!(self, now, ac))?;
            }
        }

        Ok(())
    }

    fn start_transmit(&mut self, now: Ts, frame: Frame, source: TxSource) -> Result<(), CoreError<P::Error>> {
        if self.on_air.is_some() {
            error!("Transmit from {:?} at {} us while already on air, dropping {}", source, now, frame.kind);
            self.release(now, source)?;
            return Err(CoreError::Busy);
        }

        let n = match frame.encode(&mut self.buff) {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to encode {} to {} at {} us: {:?}", frame.kind, frame.receiver, now, e);
                self.release(now, source)?;
                return Err(CoreError::Decode(e));
            },
        };

        debug!("Transmit {} to {} ({} bytes, duration {}) at {} us", frame.kind, frame.receiver, n, frame.duration, now);

        self.on_air = Some(source);
        if let Some(f) = self.medium.transmission_state_changed(now, TransmissionState::Transmitting) {
            self.notify(now, f);
        }

        if let Err(e) = self.phy.start_transmit(&self.buff[..n]) {
            error!("PHY rejected transmission at {} us: {:?}", now, e);

            // Unwind as a completed transmission so the exchange times out and retries
            self.transmission_finished()?;
            return Err(CoreError::Phy(e));
        }

        Ok(())
    }

    /// Start the next queued frame if no exchange is active
    fn dispatch(&mut self, now: Ts) -> Result<(), CoreError<P::Error>> {
        if self.exchange.is_some() {
            return Ok(());
        }

        let mut frame = match self.tx_buff.dequeue() {
            Some(f) => f,
            None => return Ok(()),
        };

        frame.transmitter = self.address;
        frame.seq = self.next_seq();
        frame.set_retry(false);
        frame.ac = frame.ac.min(self.contention.len().saturating_sub(1) as u8);
        let ac = frame.ac as usize;

        let phy = &self.phy;
        let mut x = if frame.receiver.is_group() {
            FrameExchange::broadcast(frame)
        } else if frame.len() >= self.config.rts_threshold {
            FrameExchange::rts_cts_data_ack(frame, &self.config, |len| phy.airtime(len))
        } else {
            FrameExchange::data_ack(frame, &self.config, |len| phy.airtime(len))
        };

        x.start::<P::Error, _>(exchange_ctx!(self, now, ac))?;
        self.exchange = Some(x);

        Ok(())
    }

    /// Retire a finished exchange and start the next one
    fn check_exchange(&mut self, now: Ts) -> Result<(), CoreError<P::Error>> {
        match &self.exchange {
            Some(x) if x.is_finished() => (),
            _ => return Ok(()),
        }

        if let Some(x) = self.exchange.take() {
            let (receiver, seq, retries) = (x.receiver(), x.seq(), x.retry_count());

            self.stats.retries = self.stats.retries.saturating_add(retries as u32);

            let event = match x.status() {
                ExchangeStatus::Succeeded => {
                    self.stats.sent = self.stats.sent.saturating_add(1);
                    if retries == 0 {
                        self.stats.sent_without_retry = self.stats.sent_without_retry.saturating_add(1);
                    }
                    MacEvent::TransmitSucceeded{ receiver, seq, retries }
                },
                _ => {
                    warn!("Giving up on frame {} to {} at {} us", seq, receiver, now);
                    self.stats.given_up = self.stats.given_up.saturating_add(1);
                    MacEvent::TransmitFailed{ receiver, seq, retries }
                },
            };

            if self.events.enqueue(event).is_err() {
                warn!("Event queue full at {} us, dropping outcome of frame {}", now, seq);
                self.stats.event_drops = self.stats.event_drops.saturating_add(1);
            }
        }

        self.dispatch(now)
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.seq;
        self.seq = (self.seq + 1) % SEQ_MODULO;
        seq
    }

    /// Respond to a correctly received frame that was not an expected reply
    fn respond(&mut self, now: Ts, frame: Frame) -> Result<(), CoreError<P::Error>> {
        let to_us = frame.receiver == self.address;

        match frame.kind {
            FrameKind::Rts if to_us => {
                if let Some(nav) = self.medium.nav_expiry() {
                    debug!("Ignoring RTS from {} at {} us, NAV set until {} us", frame.transmitter, now, nav);
                    return Ok(());
                }

                let duration = cts_duration(&frame, self.config.sifs, self.phy.airtime(CTS_LEN));
                let cts = Frame::cts(frame.transmitter, duration);

                self.immediate.transmit::<P::Error>(now, cts, self.config.sifs, Requester::Responder)
            },
            FrameKind::Data if to_us => {
                let ack = Frame::ack(frame.transmitter, 0);
                self.immediate.transmit::<P::Error>(now, ack, self.config.sifs, Requester::Responder)?;

                if self.is_duplicate(now, &frame) {
                    debug!("Duplicate frame {} from {} at {} us", frame.seq, frame.transmitter, now);
                    self.stats.duplicates = self.stats.duplicates.saturating_add(1);
                    return Ok(());
                }

                self.deliver(now, frame);
                Ok(())
            },
            FrameKind::Data if frame.receiver.is_group() => {
                self.deliver(now, frame);
                Ok(())
            },
            _ => {
                trace!("Ignoring {} to {} at {} us", frame.kind, frame.receiver, now);
                Ok(())
            },
        }
    }

    fn deliver(&mut self, now: Ts, frame: Frame) {
        info!("Received {} bytes from {} (seq {}) at {} us", frame.payload().len(), frame.transmitter, frame.seq, now);

        match self.rx_buff.enqueue(frame) {
            Ok(_) => self.stats.received = self.stats.received.saturating_add(1),
            Err(_) => {
                error!("RX buffer full, dropping received frame");
                self.stats.rx_drops = self.stats.rx_drops.saturating_add(1);
            },
        }
    }

    /// Check and record the sequence number of a unicast data frame
    fn is_duplicate(&mut self, now: Ts, frame: &Frame) -> bool {
        if !self.config.duplicate_detection {
            return false;
        }

        let timeout = self.config.duplicate_timeout;
        let duplicate = match self.last_seen.get(&frame.transmitter) {
            Some((seq, at)) => frame.is_retry() && *seq == frame.seq && now.saturating_sub(*at) < timeout,
            None => false,
        };

        if self.last_seen.insert(frame.transmitter, (frame.seq, now)).is_err() {
            // Cache full, evict the least recently seen sender
            let oldest = self.last_seen.iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(a, _)| *a);

            if let Some(a) = oldest {
                self.last_seen.remove(&a);
            }
            let _ = self.last_seen.insert(frame.transmitter, (frame.seq, now));
        }

        duplicate
    }
}

impl <P, T, G> Mac for UpperMac<P, T, G>
where
    P: Phy,
    T: Timer,
    G: RngCore,
{
    type Error = CoreError<P::Error>;

    /// Enqueue a frame for TX
    fn transmit(&mut self, frame: Frame) -> Result<(), Self::Error> {
        self.enqueue(frame)
    }

    /// Fetch a delivered data frame
    fn receive(&mut self) -> Result<Option<Frame>, Self::Error> {
        Ok(self.rx_buff.dequeue())
    }

    /// Check whether the MAC is busy
    fn busy(&mut self) -> Result<bool, Self::Error> {
        let b = self.exchange.is_some()
            || self.on_air.is_some()
            || self.tx_buff.len() >= self.config.max_queue_size;

        Ok(b)
    }

    fn tick(&mut self) -> Result<(), Self::Error> {
        let now = self.now();
        self.run_timers(now)
    }
}
