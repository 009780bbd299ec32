//! Remote Protocol Engine
//!
//! The remote node listens for relayed commands, acknowledges them at once,
//! and then drives the valve relays. Actuation is deduplicated on the
//! transaction id: the bridge retries until it hears an ACK, so the same
//! command regularly shows up more than once.
//!
//! Between commands the node samples its battery, and rests with the radio
//! idle to save power.

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::v2::OutputPin;

use crate::{
    bridge,
    codec::{verify_table, Ack, Command, Envelope, TableError, ValveChannel},
    indicator::Indicator,
    radio::Radio,
    sched::Interval,
    RadioLink, RADIO_MTU,
};

/// Default timings
pub mod defaults {
    use embassy_time::Duration;

    /// How long a relay line is held to move a valve
    pub const IMPULSE: Duration = Duration::from_secs(4);
    /// Time between two battery samples
    pub const BATTERY_PERIOD: Duration = Duration::from_secs(40);
    /// Time spent listening before a rest
    pub const IDLE_PERIOD: Duration = Duration::from_secs(2);
    /// Length of a rest with the radio idle. Zero disables resting.
    pub const LOW_POWER_IDLE: Duration = Duration::from_secs(3);
    /// How long the indicator stays lit after sending an ACK
    pub const ACK_BLINK: Duration = Duration::from_millis(250);
}

/// Remote metadata trait
///
/// This is used to define the types and constants used by a [Remote]
pub trait RemoteCfg {
    /// The radio driver
    type Radio: RadioLink;
    /// The battery voltage ADC
    type Battery: BatterySensor;
    /// A relay output line
    type Pin: OutputPin;
    /// The indicator LED pin
    type Led: OutputPin;

    /// See [defaults::IMPULSE]
    const IMPULSE: Duration;
    /// See [defaults::BATTERY_PERIOD]
    const BATTERY_PERIOD: Duration;
    /// See [defaults::IDLE_PERIOD]
    const IDLE_PERIOD: Duration;
    /// See [defaults::LOW_POWER_IDLE]
    ///
    /// Must be well under the bridge's retry budget, or a command sent
    /// during a rest is never heard. Debug builds check it against half of
    /// [bridge::defaults::RETRY_BUDGET], not the budget a bridge is
    /// actually configured with.
    const LOW_POWER_IDLE: Duration;
    /// See [defaults::ACK_BLINK]
    const ACK_BLINK: Duration;
}

/// Battery voltage measurement
pub trait BatterySensor {
    /// Take one raw 12-bit ADC reading
    fn sample(&mut self) -> u16;
}

/// Scale a raw ADC count into the byte carried by every ACK
pub fn scale_battery(raw: u16) -> u8 {
    let scaled = u32::from(raw) * 6 / 100;
    u8::try_from(scaled).unwrap_or(u8::MAX)
}

/// Which way to move a valve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Drive {
    /// Assert the open line
    Open,
    /// Assert the close line
    Close,
}

/// The two output lines of one valve channel
pub struct ValvePins<P: OutputPin> {
    /// Asserted by `TURNON_`
    pub open: P,
    /// Asserted by `TURNOFF`
    pub close: P,
}

/// Both valve channels' relay lines
///
/// The two lines of a channel are complementary: the other one is always
/// released before one is asserted, and they are never high together.
pub struct RelayBank<P: OutputPin> {
    one: ValvePins<P>,
    two: ValvePins<P>,
}

impl<P: OutputPin> RelayBank<P> {
    /// Take the lines and release all of them
    pub fn new(one: ValvePins<P>, two: ValvePins<P>) -> Self {
        let mut bank = Self { one, two };
        bank.release(ValveChannel::One);
        bank.release(ValveChannel::Two);
        bank
    }

    fn pins(&mut self, channel: ValveChannel) -> &mut ValvePins<P> {
        match channel {
            ValveChannel::One => &mut self.one,
            ValveChannel::Two => &mut self.two,
        }
    }

    /// Assert one line of `channel`, after releasing its complement
    pub fn engage(&mut self, channel: ValveChannel, drive: Drive) {
        let pins = self.pins(channel);
        let (target, other) = match drive {
            Drive::Open => (&mut pins.open, &mut pins.close),
            Drive::Close => (&mut pins.close, &mut pins.open),
        };
        // Don't assert the target unless the complement is known to be low
        if other.set_low().is_err() || target.set_high().is_err() {
            nut_warn!("Relay line write failed");
        }
    }

    /// Release both lines of `channel`
    pub fn release(&mut self, channel: ValveChannel) {
        let pins = self.pins(channel);
        let open = pins.open.set_low();
        let close = pins.close.set_low();
        if open.is_err() || close.is_err() {
            nut_warn!("Relay line write failed");
        }
    }

    /// Hold one line for `hold`, then release the channel
    pub async fn pulse(&mut self, channel: ValveChannel, drive: Drive, hold: Duration) {
        self.engage(channel, drive);
        Timer::after(hold).await;
        self.release(channel);
    }
}

/// Where the remote is in handling a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum RemoteState {
    /// Receiver on, waiting for a command
    Listening,
    /// Sending an ACK
    Acking,
    /// Holding a relay line
    Actuating,
    /// Receiver off
    Resting,
}

/// What became of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Disposition {
    /// Not a relayed command. Nothing was sent.
    Dropped,
    /// Already applied. Acknowledged again, nothing actuated.
    Duplicate,
    /// Acknowledged and applied
    Applied,
}

/// The remote node
pub struct Remote<Cfg: RemoteCfg> {
    radio: Radio<Cfg::Radio>,
    relays: RelayBank<Cfg::Pin>,
    battery: Cfg::Battery,
    led: Indicator<Cfg::Led>,
    battery_level: u8,
    last_applied: Option<u8>,
    state: RemoteState,
    battery_interval: Interval,
    idle_interval: Interval,
    rest_requested: bool,
}

impl<Cfg: RemoteCfg> Remote<Cfg> {
    /// Create a remote
    ///
    /// Fails if the command token table is corrupt, in which case the node
    /// must not start. The battery is sampled once right away.
    pub fn new(
        radio: Cfg::Radio,
        relays: RelayBank<Cfg::Pin>,
        battery: Cfg::Battery,
        led: Cfg::Led,
    ) -> Result<Self, TableError> {
        debug_assert!(
            Cfg::LOW_POWER_IDLE.as_ticks() * 2 <= bridge::defaults::RETRY_BUDGET.as_ticks()
        );
        verify_table()?;

        let now = Instant::now();
        let mut remote = Self {
            radio: Radio::new(radio),
            relays,
            battery,
            led: Indicator::new(led),
            battery_level: 0,
            last_applied: None,
            state: RemoteState::Listening,
            battery_interval: Interval::new(Cfg::BATTERY_PERIOD, now),
            idle_interval: Interval::new(Cfg::IDLE_PERIOD, now),
            rest_requested: false,
        };
        remote.sample_battery();
        nut_info!("Remote up, battery {=u8}", remote.battery_level);
        Ok(remote)
    }

    /// The handling state
    pub fn state(&self) -> RemoteState {
        self.state
    }

    /// Transaction id of the last applied command, if any since boot
    pub fn last_applied(&self) -> Option<u8> {
        self.last_applied
    }

    /// The battery level sent with every ACK
    pub fn battery_level(&self) -> u8 {
        self.battery_level
    }

    /// Take a fresh battery sample
    pub fn sample_battery(&mut self) {
        self.battery_level = scale_battery(self.battery.sample());
        nut_trace!("Battery {=u8}", self.battery_level);
    }

    /// Handle one frame heard over the radio
    ///
    /// The ACK goes out before any actuation: moving a valve takes
    /// seconds, and the bridge would keep retrying meanwhile.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Disposition {
        let env = match Envelope::decode(frame) {
            Ok(env) if env.command.is_relayed() => env,
            Ok(_) => {
                nut_debug!("Dropping status query heard over radio");
                return Disposition::Dropped;
            }
            Err(_) => {
                nut_debug!("Dropping {=usize} byte frame", frame.len());
                return Disposition::Dropped;
            }
        };

        self.state = RemoteState::Acking;
        let ack = Ack {
            transaction_id: env.transaction_id,
            battery: self.battery_level,
        };
        if self.radio.send_cca(&ack.encode()).await.is_err() {
            // The bridge retries, and we ACK again then
            nut_warn!("ACK for {=u8} not sent", env.transaction_id);
        }
        self.led.blink(Cfg::ACK_BLINK).await;

        if self.last_applied == Some(env.transaction_id) {
            nut_debug!("Duplicate {=u8}, ACK only", env.transaction_id);
            self.state = RemoteState::Listening;
            return Disposition::Duplicate;
        }

        self.actuate(&env).await;
        self.last_applied = Some(env.transaction_id);
        self.state = RemoteState::Listening;
        nut_info!("Applied {=u8}", env.transaction_id);
        Disposition::Applied
    }

    async fn actuate(&mut self, env: &Envelope) {
        let drive = match env.command {
            Command::TurnOn => Drive::Open,
            Command::TurnOff => Drive::Close,
            Command::NoOp | Command::GetStatus => return,
        };
        let Some(channel) = ValveChannel::from_param(env.parameter) else {
            nut_warn!("No channel {=u8}, nothing to drive", env.parameter);
            return;
        };
        self.state = RemoteState::Actuating;
        self.relays.pulse(channel, drive, Cfg::IMPULSE).await;
    }

    fn next_housekeeping(&self) -> Instant {
        self.battery_interval
            .deadline()
            .min(self.idle_interval.deadline())
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();
        if self.battery_interval.poll(now) {
            self.sample_battery();
        }
        let rest = core::mem::take(&mut self.rest_requested);
        if self.idle_interval.poll(now) || rest {
            self.rest().await;
        }
    }

    async fn rest(&mut self) {
        if Cfg::LOW_POWER_IDLE.as_ticks() == 0 {
            return;
        }
        // A frame that already landed gets handled before the receiver
        // goes off
        let mut buf = [0u8; RADIO_MTU];
        if let Some(Ok(frame)) = self.radio.try_recv(&mut buf) {
            self.handle_frame(frame).await;
        }

        self.state = RemoteState::Resting;
        self.radio.idle();
        Timer::after(Cfg::LOW_POWER_IDLE).await;
        self.idle_interval.reset(Instant::now());
        self.state = RemoteState::Listening;
    }

    /// Run the remote forever
    pub async fn run(&mut self) {
        let mut buf = [0u8; RADIO_MTU];
        loop {
            self.radio.listen();
            let wake = self.next_housekeeping();
            match select(self.radio.recv(&mut buf), Timer::at(wake)).await {
                Either::First(Ok(frame)) => {
                    if self.handle_frame(frame).await != Disposition::Dropped {
                        self.rest_requested = true;
                    }
                }
                Either::First(Err(_)) => nut_warn!("Radio receive error"),
                Either::Second(()) => {}
            }
            self.housekeeping().await;
        }
    }

    /// Park with the indicator lit
    pub async fn halt(&mut self) {
        nut_error!("Remote halted");
        self.led.halt().await;
    }
}
