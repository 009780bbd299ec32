//! Host Client
//!
//! The host end of the SPI link to the bridge node. The bus is full duplex
//! with the bridge as the peripheral, so every reply arrives one transfer
//! late. Issuing a command is therefore a small dance:
//!
//! 1. Send the command frame. What comes back belongs to an older
//!    exchange and is ignored.
//! 2. Poll with `STATUS_` until a reply carries the command's transaction
//!    id. The reply to the first poll is also stale, and is discarded.
//!
//! An all-zero reply means the bridge is busy relaying.

use embassy_time::{Duration, Instant, Timer};
use rand_core::RngCore;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::codec::{
    Ack, Command, Envelope, ValveChannel, ACK_MARKER, COMMAND_FRAME_LEN, REPLY_LEN,
};

/// A full duplex byte bus, host side
pub trait SpiBus {
    /// Bus error
    type Error;

    /// Clock out `tx`, filling `rx` with what comes back at the same time
    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error>;
}

/// Polling behaviour of a [HostClient]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HostConfig {
    /// Time between two status polls, in milliseconds
    pub poll_interval_ms: u64,
    /// How long to keep polling for an ACK, in milliseconds
    pub status_budget_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            status_budget_ms: 30_000,
        }
    }
}

impl HostConfig {
    /// Time between two status polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// How long to keep polling for an ACK
    pub fn status_budget(&self) -> Duration {
        Duration::from_millis(self.status_budget_ms)
    }
}

/// A command the bridge would drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum RequestError {
    /// Status queries go through [HostClient::query_status]
    NotRelayed,
    /// `TURNON_`/`TURNOFF` need a channel of `b'1'` or `b'2'`
    BadChannel(u8),
}

/// Check a command before it is sent
pub fn validate(command: Command, parameter: u8) -> Result<(), RequestError> {
    match command {
        Command::TurnOn | Command::TurnOff => match ValveChannel::from_param(parameter) {
            Some(_) => Ok(()),
            None => Err(RequestError::BadChannel(parameter)),
        },
        Command::NoOp => Ok(()),
        Command::GetStatus => Err(RequestError::NotRelayed),
    }
}

/// Host client errors
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum HostError<E> {
    /// The bus failed
    Spi(E),
    /// The command was refused before sending
    Request(RequestError),
    /// No reply with this transaction id within the status budget
    AckTimeout {
        /// The id that was waited for
        transaction_id: u8,
    },
}

impl<E> From<RequestError> for HostError<E> {
    fn from(value: RequestError) -> Self {
        Self::Request(value)
    }
}

/// Transaction id allocator
///
/// Cycles through `1..=255`. Zero is reserved for status queries and is
/// never handed out.
///
/// The remote ignores a command that reuses the id it applied last, so a
/// restarted host should either resume from a persisted id
/// ([starting_after](Self::starting_after)) or start somewhere random
/// ([seeded](Self::seeded)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionIds {
    last: u8,
}

impl Default for TransactionIds {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionIds {
    /// First id handed out is 1
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Resume after a previously used id
    pub const fn starting_after(last: u8) -> Self {
        Self { last }
    }

    /// Start at a random point of the cycle
    pub fn seeded<R: RngCore>(rng: &mut R) -> Self {
        Self {
            last: rng.next_u32() as u8,
        }
    }

    /// The most recently handed out id (0 if none)
    pub fn last(&self) -> u8 {
        self.last
    }

    /// Hand out the next id
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u8 {
        self.last = match self.last {
            u8::MAX => 1,
            n => n + 1,
        };
        self.last
    }
}

/// A battery byte from an ACK, converted to physical units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading(pub u8);

impl BatteryReading {
    /// Volts per count
    pub const VOLTS_PER_COUNT: f32 = 0.069;
    /// Volts at count zero
    pub const OFFSET_VOLTS: f32 = 4.386;
    /// Voltage of a full battery
    pub const FULL_VOLTS: f32 = 13.0;

    /// Battery voltage
    pub fn volts(self) -> f32 {
        f32::from(self.0) * Self::VOLTS_PER_COUNT + Self::OFFSET_VOLTS
    }

    /// Charge, relative to [FULL_VOLTS](Self::FULL_VOLTS), capped at 100
    pub fn percent(self) -> f32 {
        (self.volts() * 100.0 / Self::FULL_VOLTS).min(100.0)
    }
}

impl From<Ack> for BatteryReading {
    fn from(ack: Ack) -> Self {
        Self(ack.battery)
    }
}

/// Interpret what the bridge clocked out
///
/// Zero filler on either side is ignored. All zeros, or anything not
/// opening with the ACK marker, is `None`. Zero bytes trimmed off the end
/// read as a zero id or battery.
pub fn parse_reply(rx: &[u8]) -> Option<Ack> {
    let start = rx.iter().position(|b| *b != 0)?;
    let body = &rx[start..];
    if !body.starts_with(ACK_MARKER) {
        return None;
    }
    Some(Ack {
        transaction_id: body.get(REPLY_LEN).copied().unwrap_or(0),
        battery: body.get(REPLY_LEN + 1).copied().unwrap_or(0),
    })
}

/// Talks to a bridge node over a [SpiBus]
pub struct HostClient<S: SpiBus> {
    spi: S,
    ids: TransactionIds,
    config: HostConfig,
}

impl<S: SpiBus> HostClient<S> {
    /// Create a client
    pub fn new(spi: S, ids: TransactionIds, config: HostConfig) -> Self {
        Self { spi, ids, config }
    }

    /// The id allocator, e.g. to persist [TransactionIds::last]
    pub fn ids(&self) -> &TransactionIds {
        &self.ids
    }

    async fn exchange(
        &mut self,
        env: &Envelope,
    ) -> Result<[u8; COMMAND_FRAME_LEN], HostError<S::Error>> {
        let tx = env.encode();
        let mut rx = [0u8; COMMAND_FRAME_LEN];
        self.spi
            .transfer(&tx, &mut rx)
            .await
            .map_err(HostError::Spi)?;
        Ok(rx)
    }

    /// Send a command, returning its transaction id
    pub async fn send(
        &mut self,
        command: Command,
        parameter: u8,
    ) -> Result<u8, HostError<S::Error>> {
        validate(command, parameter)?;
        let transaction_id = self.ids.next();
        self.exchange(&Envelope {
            command,
            transaction_id,
            parameter,
        })
        .await?;
        Ok(transaction_id)
    }

    /// One status poll
    ///
    /// The reply describes the state at the end of the PREVIOUS transfer.
    pub async fn query_status(&mut self) -> Result<Option<Ack>, HostError<S::Error>> {
        let rx = self.exchange(&Envelope::status()).await?;
        Ok(parse_reply(&rx))
    }

    /// Poll until the bridge reports `transaction_id` as applied
    pub async fn wait_for_ack(&mut self, transaction_id: u8) -> Result<Ack, HostError<S::Error>> {
        let start = Instant::now();
        let mut first = true;
        loop {
            Timer::after(self.config.poll_interval()).await;
            let reply = self.query_status().await?;
            if !core::mem::take(&mut first) {
                if let Some(ack) = reply.filter(|a| a.transaction_id == transaction_id) {
                    return Ok(ack);
                }
            }
            if start.elapsed() >= self.config.status_budget() {
                return Err(HostError::AckTimeout { transaction_id });
            }
        }
    }

    /// [send](Self::send) then [wait_for_ack](Self::wait_for_ack)
    pub async fn execute(
        &mut self,
        command: Command,
        parameter: u8,
    ) -> Result<Ack, HostError<S::Error>> {
        let transaction_id = self.send(command, parameter).await?;
        self.wait_for_ack(transaction_id).await
    }

    /// Give back the bus
    pub fn into_inner(self) -> S {
        self.spi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::{collections::VecDeque, vec::Vec};

    /// Answers each transfer from a queue, zeros once it runs dry
    #[derive(Default)]
    struct FakeSpi {
        replies: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl FakeSpi {
        fn answering(replies: &[&[u8]]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_vec()).collect(),
                sent: Vec::new(),
            }
        }
    }

    impl SpiBus for FakeSpi {
        type Error = ();

        async fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), ()> {
            self.sent.push(tx.to_vec());
            rx.fill(0);
            if let Some(reply) = self.replies.pop_front() {
                let n = reply.len().min(rx.len());
                rx[..n].copy_from_slice(&reply[..n]);
            }
            Ok(())
        }
    }

    struct BrokenSpi;

    impl SpiBus for BrokenSpi {
        type Error = &'static str;

        async fn transfer(&mut self, _tx: &[u8], _rx: &mut [u8]) -> Result<(), &'static str> {
            Err("bus fault")
        }
    }

    /// Counts up from a fixed value
    struct StepRng(u64);

    impl RngCore for StepRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.0 += 1;
            self.0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    fn fast() -> HostConfig {
        HostConfig {
            poll_interval_ms: 1,
            status_budget_ms: 20,
        }
    }

    #[test]
    fn ids_skip_zero() {
        let mut ids = TransactionIds::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);

        let mut ids = TransactionIds::starting_after(254);
        assert_eq!(ids.next(), 255);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.last(), 1);
    }

    #[test]
    fn seeded_ids_start_anywhere() {
        let mut rng = StepRng(0x1_0000_00FE);
        let mut ids = TransactionIds::seeded(&mut rng);
        assert_eq!(ids.last(), 0xFF);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_reply(&[0u8; 9]), None);
        assert_eq!(
            parse_reply(b"ACK_\x05\x50\x00\x00\x00"),
            Some(Ack {
                transaction_id: 5,
                battery: 0x50
            })
        );
        assert_eq!(
            parse_reply(b"\x00\x00ACK_\x05\x50\x00"),
            Some(Ack {
                transaction_id: 5,
                battery: 0x50
            })
        );
        assert_eq!(
            parse_reply(b"ACK_\x00\x00\x00\x00\x00"),
            Some(Ack {
                transaction_id: 0,
                battery: 0
            })
        );
        assert_eq!(parse_reply(b"ACK"), None);
        assert_eq!(parse_reply(b"NAK_\x05\x50\x00\x00\x00"), None);
    }

    #[test]
    fn battery_units() {
        let empty = BatteryReading(0);
        assert!((empty.volts() - 4.386).abs() < 1e-4);

        let mid = BatteryReading(60);
        assert!((mid.volts() - 8.526).abs() < 1e-4);
        assert!((mid.percent() - 65.585).abs() < 1e-2);

        assert_eq!(BatteryReading(255).percent(), 100.0);
        assert_eq!(
            BatteryReading::from(Ack {
                transaction_id: 1,
                battery: 7
            }),
            BatteryReading(7)
        );
    }

    #[test]
    fn validation() {
        assert_eq!(validate(Command::TurnOn, b'1'), Ok(()));
        assert_eq!(validate(Command::TurnOff, b'2'), Ok(()));
        assert_eq!(
            validate(Command::TurnOn, b'3'),
            Err(RequestError::BadChannel(b'3'))
        );
        assert_eq!(validate(Command::NoOp, b'0'), Ok(()));
        assert_eq!(
            validate(Command::GetStatus, b'0'),
            Err(RequestError::NotRelayed)
        );
    }

    #[test]
    fn invalid_requests_never_hit_the_bus() {
        let mut client = HostClient::new(FakeSpi::default(), TransactionIds::new(), fast());
        let res = block_on(client.send(Command::TurnOff, b'x'));
        assert_eq!(res, Err(HostError::Request(RequestError::BadChannel(b'x'))));
        assert!(client.into_inner().sent.is_empty());
    }

    #[test]
    fn execute_waits_for_own_id() {
        let stale_ack = b"ACK_\x05\x50";
        let spi = FakeSpi::answering(&[
            // reply to the command itself
            stale_ack,
            // first poll, discarded even though it looks right
            b"ACK_\x06\x50",
            // bridge busy relaying
            &[0u8; 9],
            stale_ack,
            b"ACK_\x06\x51",
        ]);
        let mut client = HostClient::new(spi, TransactionIds::starting_after(5), fast());
        let ack = block_on(client.execute(Command::TurnOn, b'1')).unwrap();
        assert_eq!(
            ack,
            Ack {
                transaction_id: 6,
                battery: 0x51
            }
        );

        let spi = client.into_inner();
        assert_eq!(spi.sent.len(), 5);
        assert_eq!(spi.sent[0], b"TURNON_\x061");
        assert!(spi.sent[1..].iter().all(|f| f == b"STATUS_\x000"));
    }

    #[test]
    fn gives_up_after_budget() {
        let mut client = HostClient::new(FakeSpi::default(), TransactionIds::new(), fast());
        let res = block_on(client.execute(Command::NoOp, b'0'));
        assert_eq!(res, Err(HostError::AckTimeout { transaction_id: 1 }));
    }

    #[test]
    fn bus_errors_surface() {
        let mut client = HostClient::new(BrokenSpi, TransactionIds::new(), fast());
        assert_eq!(
            block_on(client.query_status()),
            Err(HostError::Spi("bus fault"))
        );
    }
}
