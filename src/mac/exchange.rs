//! Frame exchange sequencing
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{trace, debug, info, warn, error};

use heapless::Vec;
use rand_core::RngCore;

use crate::Ts;
use crate::error::CoreError;
use crate::frame::{Address, Frame, FrameKind, ACK_LEN, CTS_LEN, DURATION_ID_MASK};
use crate::timer::Alarm;

use super::config::Config;
use super::contention::ContentionTx;
use super::immediate::{ImmediateTx, Requester};
use super::medium::MediumTracker;

/// Maximum steps in a single exchange
pub const MAX_STEPS: usize = 8;

/// A single step of a frame exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Send a frame using the contention engine
    TransmitContention(Frame),
    /// Send a frame SIFS after the previous step completed
    TransmitImmediate(Frame),
    /// Wait up to `timeout` after the previous transmission for a reply of kind `accept`
    ExpectReply{ timeout: Ts, accept: FrameKind },
    /// Exchange complete
    Finished,
}

pub type Steps = Vec<Step, MAX_STEPS>;

#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum ExchangeStatus {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
enum Phase {
    Pending,
    Transmitting,
    AwaitingReply,
    /// Reply timeout elapsed during a reception, waiting for it to complete
    AwaitingReception,
    Done,
}

/// Components an exchange drives, borrowed from the owning MAC for each call
pub struct ExchangeContext<'a, R> {
    pub now: Ts,
    pub config: &'a Config,
    pub medium: &'a MediumTracker,
    pub contention: &'a mut ContentionTx,
    pub immediate: &'a mut ImmediateTx,
    pub rng: &'a mut R,
}

/// Clamp a microsecond duration into the duration field
pub fn duration_field(us: Ts) -> u16 {
    us.min((DURATION_ID_MASK - 1) as Ts) as u16
}

/// Step list driver for DATA/ACK, RTS/CTS/DATA/ACK and broadcast exchanges
#[derive(Debug, Clone, PartialEq)]
pub struct FrameExchange {
    steps: Steps,
    step: usize,
    phase: Phase,
    status: ExchangeStatus,

    own: Address,
    receiver: Address,
    seq: u16,
    ac: usize,

    retry_count: u8,
    steps_taken: u32,
    transmissions: u32,

    reply: Alarm,
}

impl FrameExchange {
    /// DATA followed by an ACK
    pub fn data_ack<F: Fn(usize) -> Ts>(mut data: Frame, config: &Config, airtime: F) -> Self {
        let ack_time = airtime(ACK_LEN);
        data.duration = duration_field(config.sifs + ack_time);

        let mut steps = Steps::new();
        append(&mut steps, data_steps(data.clone(), true, reply_timeout(config, ack_time)));
        append(&mut steps, [Step::Finished]);

        Self::new(&data, steps)
    }

    /// RTS / CTS protected DATA followed by an ACK
    pub fn rts_cts_data_ack<F: Fn(usize) -> Ts>(mut data: Frame, config: &Config, airtime: F) -> Self {
        let cts_time = airtime(CTS_LEN);
        let ack_time = airtime(ACK_LEN);
        let data_time = airtime(data.len());

        data.duration = duration_field(config.sifs + ack_time);

        let mut rts = Frame::rts(data.receiver, data.transmitter, duration_field(3 * config.sifs + cts_time + data_time + ack_time));
        rts.ac = data.ac;

        let mut steps = Steps::new();
        append(&mut steps, [
            Step::TransmitContention(rts),
            Step::ExpectReply{ timeout: reply_timeout(config, cts_time), accept: FrameKind::Cts },
        ]);
        append(&mut steps, data_steps(data.clone(), false, reply_timeout(config, ack_time)));
        append(&mut steps, [Step::Finished]);

        Self::new(&data, steps)
    }

    /// Group addressed DATA, no reply and no retries
    pub fn broadcast(mut data: Frame) -> Self {
        data.duration = 0;

        let mut steps = Steps::new();
        append(&mut steps, [Step::TransmitContention(data.clone()), Step::Finished]);

        Self::new(&data, steps)
    }

    fn new(data: &Frame, steps: Steps) -> Self {
        Self {
            steps,
            step: 0,
            phase: Phase::Pending,
            status: ExchangeStatus::InProgress,
            own: data.transmitter,
            receiver: data.receiver,
            seq: data.seq,
            ac: data.ac as usize,
            retry_count: 0,
            steps_taken: 0,
            transmissions: 0,
            reply: Alarm::new(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn status(&self) -> ExchangeStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status != ExchangeStatus::InProgress
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Number of steps executed, `Finished` excluded
    pub fn steps_taken(&self) -> u32 {
        self.steps_taken
    }

    /// Number of frames handed to a transmitter
    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn receiver(&self) -> Address {
        self.receiver
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    pub fn access_category(&self) -> usize {
        self.ac
    }

    pub(crate) fn alarm(&self) -> &Alarm {
        &self.reply
    }

    /// Begin executing the step list
    pub fn start<E, R: RngCore>(&mut self, ctx: ExchangeContext<R>) -> Result<(), CoreError<E>> {
        if self.phase != Phase::Pending {
            return Err(CoreError::TransmitPending);
        }

        debug!("Exchange to {} (seq {}) started at {} us", self.receiver, self.seq, ctx.now);

        self.run(ctx)
    }

    /// A transmission requested by this exchange has completed
    pub fn transmission_finished<E, R: RngCore>(&mut self, ctx: ExchangeContext<R>) -> Result<(), CoreError<E>> {
        if self.phase != Phase::Transmitting {
            return Ok(());
        }

        self.step += 1;
        self.run(ctx)
    }

    /// Offer a completed reception to the exchange.
    ///
    /// Returns true where the frame was consumed as the expected reply.
    pub fn frame_received<E, R: RngCore>(&mut self, ctx: ExchangeContext<R>, frame: Option<&Frame>, fcs_ok: bool) -> Result<bool, CoreError<E>> {
        let accept = match (self.phase, self.steps.get(self.step)) {
            (Phase::AwaitingReply, Some(Step::ExpectReply{ accept, .. })) |
            (Phase::AwaitingReception, Some(Step::ExpectReply{ accept, .. })) => *accept,
            _ => return Ok(false),
        };

        match frame {
            Some(f) if fcs_ok && f.kind == accept && f.receiver == self.own => {
                trace!("Exchange received {} at {} us", f.kind, ctx.now);

                self.reply.cancel();
                self.step += 1;
                self.run::<E, R>(ctx)?;

                Ok(true)
            },
            _ if self.phase == Phase::AwaitingReception => {
                debug!("Reception at {} us did not carry the expected {}", ctx.now, accept);
                self.timeout::<E, R>(ctx)?;
                Ok(false)
            },
            _ => Ok(false),
        }
    }

    /// The physical reception that extended a reply wait ended without a matching frame
    pub fn reception_ended<E, R: RngCore>(&mut self, ctx: ExchangeContext<R>) -> Result<(), CoreError<E>> {
        if self.phase != Phase::AwaitingReception {
            return Ok(());
        }
        self.timeout(ctx)
    }

    /// Handle reply alarm expiry
    pub fn handle_timeout<E, R: RngCore>(&mut self, ctx: ExchangeContext<R>) -> Result<(), CoreError<E>> {
        if !self.reply.take_expired(ctx.now) {
            return Ok(());
        }

        if ctx.medium.is_receiving() {
            trace!("Reply timeout at {} us during reception, waiting for it to end", ctx.now);
            self.phase = Phase::AwaitingReception;
            return Ok(());
        }

        self.timeout(ctx)
    }

    fn timeout<E, R: RngCore>(&mut self, ctx: ExchangeContext<R>) -> Result<(), CoreError<E>> {
        if self.retry_count < ctx.config.short_retry_limit {
            self.retry_count += 1;

            info!("Exchange to {} (seq {}) timed out at {} us, retry {}", self.receiver, self.seq, ctx.now, self.retry_count);

            for s in self.steps.iter_mut() {
                match s {
                    Step::TransmitContention(f) | Step::TransmitImmediate(f) if f.kind == FrameKind::Data => f.set_retry(true),
                    _ => (),
                }
            }

            self.step = 0;
            self.run(ctx)
        } else {
            info!("Exchange to {} (seq {}) failed at {} us after {} retries", self.receiver, self.seq, ctx.now, self.retry_count);

            self.phase = Phase::Done;
            self.status = ExchangeStatus::Failed;
            Ok(())
        }
    }

    /// Execute the current step
    fn run<E, R: RngCore>(&mut self, ctx: ExchangeContext<R>) -> Result<(), CoreError<E>> {
        let step = match self.steps.get(self.step) {
            Some(s) => s.clone(),
            None => Step::Finished,
        };

        if step != Step::Finished {
            self.steps_taken += 1;
        }

        match step {
            Step::TransmitContention(frame) => {
                let params = match self.receiver.is_group() {
                    true => ctx.config.group_contention_params(),
                    false => ctx.config.contention_params(self.retry_count),
                };

                if ctx.contention.start::<E, R>(ctx.now, frame, params, ctx.medium, ctx.rng).is_err() {
                    error!("Exchange to {} (seq {}) failed to start contention at {} us", self.receiver, self.seq, ctx.now);

                    self.reply.cancel();
                    self.phase = Phase::Done;
                    self.status = ExchangeStatus::Failed;
                    return Ok(());
                }

                self.transmissions += 1;
                self.phase = Phase::Transmitting;
            },
            Step::TransmitImmediate(frame) => {
                if ctx.immediate.transmit::<E>(ctx.now, frame, ctx.config.sifs, Requester::Exchange).is_err() {
                    warn!("Immediate transmitter busy at {} us, exchange to {} (seq {}) treated as timed out", ctx.now, self.receiver, self.seq);
                    return self.timeout(ctx);
                }

                self.transmissions += 1;
                self.phase = Phase::Transmitting;
            },
            Step::ExpectReply{ timeout, accept } => {
                trace!("Awaiting {} until {} us", accept, ctx.now + timeout);
                self.reply.arm(ctx.now, ctx.now + timeout);
                self.phase = Phase::AwaitingReply;
            },
            Step::Finished => {
                debug!("Exchange to {} (seq {}) succeeded at {} us", self.receiver, self.seq, ctx.now);
                self.phase = Phase::Done;
                self.status = ExchangeStatus::Succeeded;
            },
        }

        Ok(())
    }
}

/// `2 * propagation + SIFS + reply airtime`, from the end of the soliciting frame
fn reply_timeout(config: &Config, reply_time: Ts) -> Ts {
    2 * config.max_propagation_delay + config.sifs + reply_time
}

fn data_steps(data: Frame, contention: bool, ack_timeout: Ts) -> [Step; 2] {
    let tx = match contention {
        true => Step::TransmitContention(data),
        false => Step::TransmitImmediate(data),
    };
    [tx, Step::ExpectReply{ timeout: ack_timeout, accept: FrameKind::Ack }]
}

fn append<I: IntoIterator<Item=Step>>(steps: &mut Steps, parts: I) {
    for s in parts {
        if steps.push(s).is_err() {
            error!("Exchange step list exceeds {} steps", MAX_STEPS);
        }
    }
}

/// Duration field for a CTS answering `rts`
pub fn cts_duration(rts: &Frame, sifs: Ts, cts_time: Ts) -> u16 {
    let d = (rts.duration as Ts).saturating_sub(sifs + cts_time);
    duration_field(d)
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use rand::rngs::mock::StepRng;

    use crate::mac::contention::ContentionState;
    use crate::phy::ofdm_airtime;
    use super::*;

    fn airtime(len: usize) -> Ts {
        ofdm_airtime(len, 6)
    }

    fn own() -> Address {
        Address::from_u64(1)
    }

    fn peer() -> Address {
        Address::from_u64(2)
    }

    fn data(len: usize) -> Frame {
        let mut f = Frame::data(peer(), own(), Bytes::from(std::vec![0x5a; len]));
        f.seq = 7;
        f
    }

    struct Harness {
        now: Ts,
        config: Config,
        medium: MediumTracker,
        contention: ContentionTx,
        immediate: ImmediateTx,
        rng: StepRng,
        sent: std::vec::Vec<Frame>,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

            Self {
                now: 1000,
                config,
                medium: MediumTracker::new(0),
                contention: ContentionTx::new(0),
                immediate: ImmediateTx::new(),
                rng: StepRng::new(0, 0),
                sent: std::vec::Vec::new(),
            }
        }

        fn ctx(&mut self) -> ExchangeContext<StepRng> {
            ExchangeContext {
                now: self.now,
                config: &self.config,
                medium: &self.medium,
                contention: &mut self.contention,
                immediate: &mut self.immediate,
                rng: &mut self.rng,
            }
        }

        /// Fire transmitter alarms and complete the resulting transmission
        fn transmit(&mut self, x: &mut FrameExchange) -> Frame {
            let f = if let Some(at) = self.contention.alarm().deadline() {
                self.now = at;
                let mut f = self.contention.handle_timeout(self.now, &mut self.medium);
                if f.is_none() {
                    self.now = self.contention.alarm().deadline().unwrap();
                    f = self.contention.handle_timeout(self.now, &mut self.medium);
                }
                let f = f.unwrap();
                self.now += airtime(f.len());
                self.contention.transmission_finished(self.now);
                f
            } else {
                self.now = self.immediate.alarm().deadline().unwrap();
                let f = self.immediate.handle_timeout(self.now).unwrap();
                self.now += airtime(f.len());
                assert_eq!(self.immediate.transmission_finished(self.now), Some(Requester::Exchange));
                f
            };

            x.transmission_finished::<(), _>(self.ctx()).unwrap();
            self.sent.push(f.clone());
            f
        }

        fn reply(&mut self, x: &mut FrameExchange, f: Frame) -> bool {
            self.now += 16 + airtime(f.len());
            x.frame_received::<(), _>(self.ctx(), Some(&f), true).unwrap()
        }

        fn expire(&mut self, x: &mut FrameExchange) {
            self.now = x.alarm().deadline().unwrap();
            x.handle_timeout::<(), _>(self.ctx()).unwrap();
        }
    }

    #[test]
    fn data_ack_succeeds() {
        let mut h = Harness::new(Config::default());
        let mut x = FrameExchange::data_ack(data(100), &h.config, airtime);

        x.start::<(), _>(h.ctx()).unwrap();
        let f = h.transmit(&mut x);
        assert_eq!(f.kind, FrameKind::Data);
        assert_eq!(f.duration as Ts, 16 + airtime(ACK_LEN));
        assert!(!f.is_retry());

        assert!(h.reply(&mut x, Frame::ack(own(), 0)));
        assert_eq!(x.status(), ExchangeStatus::Succeeded);
        assert_eq!(x.steps_taken(), 2);
        assert_eq!(x.transmissions(), 1);
    }

    #[test]
    fn rts_exhausts_retries() {
        let config = Config { short_retry_limit: 3, rts_threshold: 100, ..Default::default() };
        let mut h = Harness::new(config);
        let mut x = FrameExchange::rts_cts_data_ack(data(200), &h.config, airtime);

        x.start::<(), _>(h.ctx()).unwrap();

        for i in 0..4 {
            assert_eq!(x.status(), ExchangeStatus::InProgress);
            let f = h.transmit(&mut x);
            assert_eq!(f.kind, FrameKind::Rts);
            assert_eq!(x.retry_count(), i);
            h.expire(&mut x);
        }

        assert_eq!(x.status(), ExchangeStatus::Failed);
        assert_eq!(x.transmissions(), 4);
        assert!(h.sent.iter().all(|f| f.kind == FrameKind::Rts));
        assert_eq!(h.contention.state(), ContentionState::Idle);
    }

    #[test]
    fn retry_bound() {
        for limit in [0u8, 1, 4, 7] {
            let config = Config { short_retry_limit: limit, ..Default::default() };
            let mut h = Harness::new(config);
            let mut x = FrameExchange::data_ack(data(40), &h.config, airtime);
            x.start::<(), _>(h.ctx()).unwrap();

            while !x.is_finished() {
                let f = h.transmit(&mut x);
                assert_eq!(f.is_retry(), x.retry_count() > 0);
                h.expire(&mut x);
            }

            assert_eq!(x.status(), ExchangeStatus::Failed);
            assert_eq!(x.transmissions(), limit as u32 + 1);
        }
    }

    #[test]
    fn rts_cts_sequence() {
        let mut h = Harness::new(Config::default());
        let d = data(300);
        let data_time = airtime(d.len());
        let mut x = FrameExchange::rts_cts_data_ack(d, &h.config, airtime);

        x.start::<(), _>(h.ctx()).unwrap();

        let rts = h.transmit(&mut x);
        assert_eq!(rts.kind, FrameKind::Rts);
        assert_eq!(rts.duration as Ts, 3 * 16 + 2 * 44 + data_time);

        let cts = Frame::cts(own(), cts_duration(&rts, 16, 44));
        assert!(h.reply(&mut x, cts));

        // DATA follows SIFS after the CTS
        let cts_end = h.now;
        let f = h.transmit(&mut x);
        assert_eq!(f.kind, FrameKind::Data);
        assert_eq!(h.now, cts_end + 16 + data_time);

        assert!(h.reply(&mut x, Frame::ack(own(), 0)));
        assert_eq!(x.status(), ExchangeStatus::Succeeded);
        assert_eq!(x.transmissions(), 2);
    }

    #[test]
    fn ignores_unrelated_frames() {
        let mut h = Harness::new(Config::default());
        let mut x = FrameExchange::data_ack(data(10), &h.config, airtime);
        x.start::<(), _>(h.ctx()).unwrap();
        h.transmit(&mut x);

        // ACK for another station, CTS instead of ACK
        assert!(!h.reply(&mut x, Frame::ack(peer(), 0)));
        assert!(!h.reply(&mut x, Frame::cts(own(), 0)));
        assert_eq!(x.status(), ExchangeStatus::InProgress);

        // Corrupted ACK
        let ack = Frame::ack(own(), 0);
        assert!(!x.frame_received::<(), _>(h.ctx(), Some(&ack), false).unwrap());
        assert_eq!(x.status(), ExchangeStatus::InProgress);
    }

    #[test]
    fn timeout_waits_for_reception() {
        let mut h = Harness::new(Config::default());
        let mut x = FrameExchange::data_ack(data(10), &h.config, airtime);
        x.start::<(), _>(h.ctx()).unwrap();
        h.transmit(&mut x);

        let deadline = x.alarm().deadline().unwrap();
        h.medium.reception_state_changed(deadline - 2, crate::mac::medium::ReceptionState::Busy);
        h.expire(&mut x);
        assert_eq!(x.retry_count(), 0);

        // Late ACK still accepted
        h.now += 40;
        let ack = Frame::ack(own(), 0);
        assert!(x.frame_received::<(), _>(h.ctx(), Some(&ack), true).unwrap());
        assert_eq!(x.status(), ExchangeStatus::Succeeded);
    }

    #[test]
    fn corrupted_reception_after_timeout_retries() {
        let mut h = Harness::new(Config::default());
        let mut x = FrameExchange::data_ack(data(10), &h.config, airtime);
        x.start::<(), _>(h.ctx()).unwrap();
        h.transmit(&mut x);

        let deadline = x.alarm().deadline().unwrap();
        h.medium.reception_state_changed(deadline - 2, crate::mac::medium::ReceptionState::Busy);
        h.expire(&mut x);

        h.now += 40;
        assert!(!x.frame_received::<(), _>(h.ctx(), None, false).unwrap());
        assert_eq!(x.retry_count(), 1);
        assert_eq!(x.status(), ExchangeStatus::InProgress);
        assert_eq!(h.contention.state(), ContentionState::Defer);
    }

    #[test]
    fn busy_immediate_transmitter_retries() {
        let mut h = Harness::new(Config::default());
        let mut x = FrameExchange::rts_cts_data_ack(data(300), &h.config, airtime);

        x.start::<(), _>(h.ctx()).unwrap();
        let rts = h.transmit(&mut x);

        // A response to another station holds the immediate transmitter
        h.immediate.transmit::<()>(h.now, Frame::ack(peer(), 0), 16, Requester::Responder).unwrap();

        let cts = Frame::cts(own(), cts_duration(&rts, 16, 44));
        assert!(h.reply(&mut x, cts));

        // DATA could not be scheduled, the RTS is contended for again
        assert_eq!(x.status(), ExchangeStatus::InProgress);
        assert_eq!(x.retry_count(), 1);
        assert_eq!(x.transmissions(), 2);
        assert!(!x.alarm().is_armed());
        assert_eq!(h.contention.state(), ContentionState::WaitIfs);

        let f = h.transmit(&mut x);
        assert_eq!(f.kind, FrameKind::Rts);
    }

    #[test]
    fn group_frames_use_multicast_window() {
        let mut h = Harness::new(Config::default());
        h.rng = StepRng::new(20, 0);

        let mut x = FrameExchange::data_ack(data(10), &h.config, airtime);
        x.start::<(), _>(h.ctx()).unwrap();
        assert_eq!(h.contention.backoff_slots(), 20 % 16);

        let mut h = Harness::new(Config::default());
        h.rng = StepRng::new(20, 0);

        let mut d = data(10);
        d.receiver = Address::BROADCAST;
        let mut x = FrameExchange::broadcast(d);
        x.start::<(), _>(h.ctx()).unwrap();
        assert_eq!(h.contention.backoff_slots(), 20);
    }

    #[test]
    fn broadcast_has_no_reply() {
        let mut h = Harness::new(Config::default());
        let mut d = data(64);
        d.receiver = Address::BROADCAST;
        d.duration = 99;

        let mut x = FrameExchange::broadcast(d);
        assert_eq!(x.steps().len(), 2);

        x.start::<(), _>(h.ctx()).unwrap();
        let f = h.transmit(&mut x);
        assert_eq!(f.duration, 0);
        assert_eq!(x.status(), ExchangeStatus::Succeeded);
        assert_eq!(x.steps_taken(), 1);
    }
}
