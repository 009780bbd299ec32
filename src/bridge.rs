//! Bridge Protocol Engine
//!
//! The bridge node sits between the host (on the [ByteChannel]) and the
//! radio. It answers status queries itself, and relays every other command
//! to the remote node with bounded retries, until it hears an ACK carrying
//! the command's transaction id.
//!
//! Only one command is in flight at a time. While [Bridge::relay] runs, the
//! host bus isn't read: the transport interrupt keeps draining the last
//! reply, then zeros.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    channel::ByteChannel,
    codec::{verify_table, Ack, Command, Envelope, FrameError, TableError, STATUS_TRANSACTION_ID},
    indicator::Indicator,
    radio::Radio,
    RadioLink, RADIO_MTU,
};

/// Default timings
pub mod defaults {
    use embassy_time::Duration;

    /// Time between two transmissions of the same command. Also the length
    /// of each ACK window.
    pub const ATTEMPT_DELAY: Duration = Duration::from_millis(250);
    /// Total time spent relaying one command before giving up
    pub const RETRY_BUDGET: Duration = Duration::from_secs(10);
    /// Pause between two looks at the host bus
    pub const HOST_POLL_INTERVAL: Duration = Duration::from_millis(1);
    /// How long the indicator stays lit after an accepted ACK
    pub const ACK_BLINK: Duration = Duration::from_millis(250);
}

/// Bridge metadata trait
///
/// This is used to define the types and constants used by a [Bridge]
pub trait BridgeCfg {
    /// The raw mutex guarding the [ByteChannel]. Must be sound for the
    /// context the transport interrupt runs in.
    type Mutex: RawMutex;
    /// The radio driver
    type Radio: RadioLink;
    /// The indicator LED pin
    type Led: OutputPin;

    /// See [defaults::ATTEMPT_DELAY]
    const ATTEMPT_DELAY: Duration;
    /// See [defaults::RETRY_BUDGET]
    const RETRY_BUDGET: Duration;
    /// See [defaults::HOST_POLL_INTERVAL]
    const HOST_POLL_INTERVAL: Duration;
    /// See [defaults::ACK_BLINK]
    const ACK_BLINK: Duration;
}

/// How many transmissions fit in `budget`, one every `delay`
///
/// Never less than one.
pub fn num_attempts(budget: Duration, delay: Duration) -> usize {
    let delay = delay.as_ticks();
    if delay == 0 {
        return 1;
    }
    let n = budget.as_ticks() / delay;
    (n as usize).max(1)
}

/// Where the bridge is in relaying a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum BridgeState {
    /// Watching the host bus
    Idle,
    /// Putting the command on the air
    Sending,
    /// ACK window open
    AwaitingAck,
    /// The last relay was acknowledged
    Applied,
    /// The last relay ran out of attempts
    Exhausted,
}

/// What the bridge knows about the remote node
///
/// Zero at boot. Only ever updated from an accepted ACK.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct BridgeStatus {
    /// Transaction id of the last acknowledged command
    pub last_applied: u8,
    /// Battery reading carried by that ACK
    pub battery: u8,
}

impl BridgeStatus {
    /// The reply the host reads back for a status query
    pub fn reply(&self) -> Ack {
        Ack {
            transaction_id: self.last_applied,
            battery: self.battery,
        }
    }
}

/// How a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Outcome {
    /// The remote acknowledged
    Applied {
        /// The accepted ACK
        ack: Ack,
        /// Transmissions used, including the acknowledged one
        attempts: usize,
    },
    /// No matching ACK within the retry budget
    Exhausted {
        /// Transmissions made
        attempts: usize,
    },
}

/// The bridge node
pub struct Bridge<'a, Cfg: BridgeCfg> {
    channel: &'a ByteChannel<Cfg::Mutex>,
    radio: Radio<Cfg::Radio>,
    led: Indicator<Cfg::Led>,
    status: BridgeStatus,
    state: BridgeState,
    missed_acks: u32,
    swap_pending: bool,
}

impl<'a, Cfg: BridgeCfg> Bridge<'a, Cfg> {
    /// Create a bridge
    ///
    /// Fails if the command token table is corrupt, in which case the node
    /// must not start. The boot status (all zeros) is published so the host
    /// reads a well formed reply from the first transfer.
    pub fn new(
        channel: &'a ByteChannel<Cfg::Mutex>,
        radio: Cfg::Radio,
        led: Cfg::Led,
    ) -> Result<Self, TableError> {
        verify_table()?;
        let mut bridge = Self {
            channel,
            radio: Radio::new(radio),
            led: Indicator::new(led),
            status: BridgeStatus::default(),
            state: BridgeState::Idle,
            missed_acks: 0,
            swap_pending: false,
        };
        bridge.publish_status();
        nut_info!("Bridge up");
        Ok(bridge)
    }

    /// The recorded status
    pub fn status(&self) -> BridgeStatus {
        self.status
    }

    /// The relay state
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Relays in a row that ran out of attempts. Zero after any success.
    pub fn missed_acks(&self) -> u32 {
        self.missed_acks
    }

    /// Attempts per relay, from the configured budget and delay
    pub fn attempts_per_relay() -> usize {
        num_attempts(Cfg::RETRY_BUDGET, Cfg::ATTEMPT_DELAY)
    }

    /// Service the host bus once
    ///
    /// Returns a command that has to be relayed. Status queries are
    /// answered right here, and garbage is dropped, leaving the host to
    /// read zeros.
    pub fn poll_host(&mut self) -> Option<Envelope> {
        if matches!(self.state, BridgeState::Applied | BridgeState::Exhausted) {
            self.state = BridgeState::Idle;
        }
        if self.swap_pending && self.channel.try_swap().is_ok() {
            self.swap_pending = false;
        }

        let frame = self.channel.take_frame()?;
        let env = match Envelope::decode(&frame) {
            Ok(env) => env,
            Err(FrameError::Length(len)) => {
                nut_debug!("Dropping {=usize} byte host frame", len);
                self.drop_reply();
                return None;
            }
            Err(FrameError::UnknownToken) => {
                nut_debug!("Dropping host frame with unknown token");
                self.drop_reply();
                return None;
            }
        };

        match env.command {
            Command::GetStatus => {
                self.publish_status();
                None
            }
            Command::TurnOn | Command::TurnOff | Command::NoOp => {
                if env.transaction_id == STATUS_TRANSACTION_ID {
                    nut_warn!("Dropping command with reserved transaction id");
                    self.drop_reply();
                    return None;
                }
                self.led.toggle();
                self.publish_status();
                Some(env)
            }
        }
    }

    /// Relay one command until it is acknowledged or the budget runs out
    pub async fn relay(&mut self, env: Envelope) -> Outcome {
        let frame = env.encode();
        let attempts = Self::attempts_per_relay();
        let mut buf = [0u8; RADIO_MTU];
        nut_info!(
            "Relaying {=u8} over up to {=usize} attempts",
            env.transaction_id,
            attempts
        );

        let mut accepted = None;
        let mut made = 0;
        for attempt in 1..=attempts {
            made = attempt;
            self.led.toggle();
            self.state = BridgeState::Sending;
            let window_end = Instant::now() + Cfg::ATTEMPT_DELAY;

            if self.radio.send_cca(&frame).await.is_err() {
                nut_warn!("Transmit failed on attempt {=usize}", attempt);
                Timer::at(window_end).await;
                continue;
            }

            self.radio.listen();
            self.state = BridgeState::AwaitingAck;
            if let Some(ack) = self.await_ack(env.transaction_id, window_end, &mut buf).await {
                accepted = Some(ack);
                break;
            }
        }
        self.radio.idle();

        let outcome = match accepted {
            Some(ack) => {
                self.status = BridgeStatus {
                    last_applied: ack.transaction_id,
                    battery: ack.battery,
                };
                self.missed_acks = 0;
                self.state = BridgeState::Applied;
                nut_info!("Applied {=u8} after {=usize} attempts", ack.transaction_id, made);
                self.led.blink(Cfg::ACK_BLINK).await;
                Outcome::Applied {
                    ack,
                    attempts: made,
                }
            }
            None => {
                self.missed_acks = self.missed_acks.saturating_add(1);
                self.state = BridgeState::Exhausted;
                nut_warn!(
                    "No ACK for {=u8} after {=usize} attempts",
                    env.transaction_id,
                    made
                );
                Outcome::Exhausted { attempts: made }
            }
        };

        // Host polls made during the relay piled up unread
        self.channel.reset_rx();
        self.publish_status();
        outcome
    }

    /// Wait until `deadline` for the ACK of `transaction_id`
    ///
    /// Anything else heard in the meantime is stale or garbage and is
    /// skipped.
    async fn await_ack(
        &mut self,
        transaction_id: u8,
        deadline: Instant,
        buf: &mut [u8],
    ) -> Option<Ack> {
        loop {
            let window = deadline.saturating_duration_since(Instant::now());
            match self.radio.recv_within(window, buf).await {
                Ok(Some(frame)) => match Ack::decode(frame) {
                    Some(ack) if ack.transaction_id == transaction_id => return Some(ack),
                    Some(ack) => {
                        nut_debug!(
                            "Ignoring ACK for {=u8}, want {=u8}",
                            ack.transaction_id,
                            transaction_id
                        );
                    }
                    None => {
                        nut_debug!("Ignoring {=usize} byte frame", frame.len());
                    }
                },
                Ok(None) => return None,
                Err(_) => {
                    nut_warn!("Radio receive error");
                    Timer::at(deadline).await;
                    return None;
                }
            }
        }
    }

    /// Poll the host once, and relay whatever it asked for
    pub async fn step(&mut self) -> Option<Outcome> {
        let env = self.poll_host()?;
        Some(self.relay(env).await)
    }

    /// Run the bridge forever
    pub async fn run(&mut self) {
        loop {
            self.step().await;
            Timer::after(Cfg::HOST_POLL_INTERVAL).await;
        }
    }

    /// Park with the indicator lit
    pub async fn halt(&mut self) {
        nut_error!("Bridge halted");
        self.led.halt().await;
    }

    fn publish_status(&mut self) {
        self.channel.stage(&self.status.reply().encode());
        self.swap_pending = self.channel.try_swap().is_err();
    }

    fn drop_reply(&mut self) {
        // A cleared NEXT is what a deferred swap will copy in
        self.swap_pending = self.channel.clear_reply().is_err();
    }
}

/// Park forever with `led` lit, after a failed [Bridge::new] or
/// [Remote::new](crate::remote::Remote::new)
pub async fn halt_on_table_error<P: OutputPin>(err: TableError, led: P) {
    nut_error!("Command table entry {=usize} is corrupt", err.index);
    Indicator::new(led).halt().await;
}
