//! Status LED

use embassy_time::{Duration, Timer};
use embedded_hal::digital::v2::OutputPin;

/// A single indicator LED on an output pin
///
/// The LED is cosmetic, so pin errors are ignored.
pub struct Indicator<P: OutputPin> {
    pin: P,
    lit: bool,
}

impl<P: OutputPin> Indicator<P> {
    /// Take the pin and switch the LED off
    pub fn new(mut pin: P) -> Self {
        let _ = pin.set_low();
        Self { pin, lit: false }
    }

    /// Is the LED on?
    pub fn is_lit(&self) -> bool {
        self.lit
    }

    /// Switch on or off
    pub fn set(&mut self, on: bool) {
        let _ = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        self.lit = on;
    }

    /// Flip the LED
    pub fn toggle(&mut self) {
        self.set(!self.lit);
    }

    /// On for `dur`, then off
    pub async fn blink(&mut self, dur: Duration) {
        self.set(true);
        Timer::after(dur).await;
        self.set(false);
    }

    /// Light the LED steadily and park forever
    ///
    /// For boot failures there is nothing to recover to.
    pub async fn halt(&mut self) {
        self.set(true);
        loop {
            Timer::after(Duration::from_secs(60)).await;
        }
    }
}
