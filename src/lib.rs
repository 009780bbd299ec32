//! # Valvelink Comms
//!
//! This is the "netstack" of a two node valve controller: a host computer
//! commands a battery powered relay/valve node over a cheap, lossy,
//! half-duplex sub-GHz radio link.
//!
//! ## Entities
//!
//! There are two roles in this netstack:
//!
//! 1. The Bridge, which sits next to the host and talks to it over a
//!    synchronous byte bus (SPI, with the bridge as the peripheral). It
//!    relays commands over the radio and remembers the last acknowledged
//!    transaction.
//! 2. The Remote, which drives the valve relays and measures its own
//!    battery. It only ever answers the Bridge.
//!
//! These roles are assigned at compile time. There is exactly one of each,
//! at fixed addresses, so the protocol carries no addressing of its own.
//!
//! ## Message Framing
//!
//! Every frame is fixed length, so the length alone is enough to reject
//! garbage. See [codec] for the layouts. Commands are 7 byte ASCII tokens
//! (`TURNON_`, `TURNOFF`, `NOOP___`, `STATUS_`) followed by a transaction id
//! and a one byte parameter. Replies are the marker `ACK_` followed by a
//! transaction id and a battery reading. The same layouts are used on the
//! host bus and over the air.
//!
//! ## Transactions
//!
//! The host tags every command with a transaction id (never zero, which is
//! reserved for status queries). The id is what makes a lossy link usable:
//!
//! 1. The Bridge receives a command from the host, and starts sending it
//!    over radio, every 250ms, for up to 10s.
//! 2. The Remote hears the command and IMMEDIATELY replies with an ACK
//!    carrying the same id. Actuating a valve takes seconds, so it happens
//!    only after the ACK is on the air.
//! 3. If this id differs from the last one the Remote applied, it drives the
//!    relays, and then records the id as applied. If it is the same id, the
//!    Bridge's ACK was lost and this is a retry: the Remote only re-sends
//!    the ACK.
//! 4. The Bridge stops retrying as soon as it hears an ACK with the id it is
//!    waiting for, and records the id and battery level. ACKs carrying any
//!    other id are stale and are ignored.
//!
//! This gives at-most-once actuation per id, with at-least-once delivery.
//!
//! Only one command is ever in flight. While the Bridge is retrying it
//! doesn't look at the host bus at all, and the host has to poll with
//! `STATUS_` to learn the result.
//!
//! ## Host bus
//!
//! The host bus is full duplex: the reply to one transfer is clocked out
//! during the NEXT transfer. The bridge keeps a double buffered reply (see
//! [channel]). A host therefore sends its command, then polls `STATUS_`
//! (discarding the first reply) until it reads back its own transaction id.
//! While the Bridge is busy on the radio the host reads all zeros.
//! [host::HostClient] implements that dance.
//!
//! ## Failure handling
//!
//! Nothing on the wire is ever an error frame. Malformed frames are dropped
//! silently, duplicates are re-ACKed, and retries that run out leave the
//! recorded status as it was. The only fatal condition is a corrupt command
//! token table, which is checked once at boot.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod host;
pub mod indicator;
pub mod radio;
pub mod remote;
pub mod sched;

#[cfg(test)]
mod testutil;

pub use crate::bridge::{Bridge, BridgeCfg, BridgeStatus, Outcome};
pub use crate::channel::ByteChannel;
pub use crate::codec::{Ack, Command, Envelope};
pub use crate::radio::Radio;
pub use crate::remote::{Remote, RemoteCfg};

/// Largest frame that is ever sent over the radio, with headroom for
/// oversized garbage so it can be recognised as such.
pub const RADIO_MTU: usize = 16;

/// An error type for the [`RadioLink`] trait
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying radio driver
    Radio(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Radio(value)
    }
}

/// How a frame gets onto the air
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum TxMode {
    /// Listen first, and only transmit if the channel is clear
    ClearChannelAssessment,
    /// Transmit regardless of channel activity
    Forced,
}

/// A trait representing the radio PHY/MAC driver
///
/// Framing, channel tuning, and address filtering are the driver's
/// business. This is the whole surface the protocol needs.
pub trait RadioLink {
    /// The error type of the underlying driver
    type Error;

    /// Send a single frame.
    ///
    /// The future MUST not return until the frame is completely sent. On
    /// return the radio is idle: the caller switches it back to receive
    /// mode if it wants to hear a reply.
    async fn transmit(&mut self, frame: &[u8], mode: TxMode) -> Result<(), Error<Self::Error>>;

    /// Turn the receiver on
    fn set_receive(&mut self);

    /// Turn the receiver off, to save power
    fn set_idle(&mut self);

    /// Receive a single frame, waiting until the driver signals one is ready
    ///
    /// This function MUST be cancellation safe: the protocol drops this
    /// future whenever an ACK window or housekeeping deadline expires.
    async fn recv<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a mut [u8], Error<Self::Error>>;
}
