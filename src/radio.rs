//! Radio Transport Adapter
//!
//! A thin layer over a [RadioLink] driver that keeps track of the receiver
//! state, and gives the protocol engines the few operations they need:
//! send with clear channel assessment, listen, go idle, and receive within a
//! window.
//!
//! [RxSlot] is a helper for driver implementors: a "frame ready" slot that
//! a receive-complete interrupt fills and the driver's [RadioLink::recv]
//! awaits.

use embassy_sync::{blocking_mutex::raw::RawMutex, signal::Signal};
use embassy_time::{with_timeout, Duration, TimeoutError};
use futures::FutureExt;
use heapless::Vec;

use crate::{Error, RadioLink, TxMode};

/// Receiver state, as last commanded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum RadioMode {
    /// Receiver off
    Idle,
    /// Receiver on
    Receive,
}

/// The radio, as seen by the protocol engines
pub struct Radio<L: RadioLink> {
    link: L,
    mode: RadioMode,
}

impl<L: RadioLink> Radio<L> {
    /// Wrap a driver. The receiver is switched off.
    pub fn new(mut link: L) -> Self {
        link.set_idle();
        Self {
            link,
            mode: RadioMode::Idle,
        }
    }

    /// The receiver state
    #[inline]
    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    /// Send one frame, only if the channel is clear
    ///
    /// The radio is idle afterwards, whether or not the send succeeded.
    pub async fn send_cca(&mut self, frame: &[u8]) -> Result<(), Error<L::Error>> {
        let res = self
            .link
            .transmit(frame, TxMode::ClearChannelAssessment)
            .await;
        self.mode = RadioMode::Idle;
        res
    }

    /// Switch the receiver on
    pub fn listen(&mut self) {
        if self.mode != RadioMode::Receive {
            self.link.set_receive();
            self.mode = RadioMode::Receive;
        }
    }

    /// Switch the receiver off
    pub fn idle(&mut self) {
        if self.mode != RadioMode::Idle {
            self.link.set_idle();
            self.mode = RadioMode::Idle;
        }
    }

    /// Wait for the next frame
    pub async fn recv<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a mut [u8], Error<L::Error>> {
        self.link.recv(buf).await
    }

    /// Take a frame only if one is already waiting
    pub fn try_recv<'a>(
        &mut self,
        buf: &'a mut [u8],
    ) -> Option<Result<&'a mut [u8], Error<L::Error>>> {
        self.link.recv(buf).now_or_never()
    }

    /// Wait at most `window` for the next frame
    ///
    /// `Ok(None)` means the window passed without a frame.
    pub async fn recv_within<'a>(
        &mut self,
        window: Duration,
        buf: &'a mut [u8],
    ) -> Result<Option<&'a mut [u8]>, Error<L::Error>> {
        match with_timeout(window, self.link.recv(buf)).await {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(e)) => Err(e),
            Err(TimeoutError) => Ok(None),
        }
    }

    /// Borrow the driver
    pub fn link(&self) -> &L {
        &self.link
    }
}

/// A "frame ready" slot, filled from a receive interrupt
///
/// Holds at most one frame: a new frame replaces one that hasn't been
/// picked up yet, the same way a single hardware receive buffer would.
pub struct RxSlot<R: RawMutex, const N: usize> {
    signal: Signal<R, Vec<u8, N>>,
}

impl<R: RawMutex, const N: usize> Default for RxSlot<R, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex, const N: usize> RxSlot<R, N> {
    /// Create an empty slot. Usable in a `static`.
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }

    /// Store a received frame and wake the waiter
    ///
    /// Frames longer than `N` can't be valid and are refused.
    pub fn deliver(&self, frame: &[u8]) -> bool {
        match Vec::from_slice(frame) {
            Ok(v) => {
                self.signal.signal(v);
                true
            }
            Err(()) => false,
        }
    }

    /// Is a frame waiting?
    pub fn is_ready(&self) -> bool {
        self.signal.signaled()
    }

    /// Drop a waiting frame, if any
    pub fn clear(&self) {
        self.signal.reset();
    }

    /// Wait for a frame and copy it into `buf`
    ///
    /// Frames that don't fit in `buf` are skipped rather than truncated.
    /// Cancellation safe.
    pub async fn wait_into<'a>(&self, buf: &'a mut [u8]) -> &'a mut [u8] {
        loop {
            let frame = self.signal.wait().await;
            let len = frame.len();
            if len <= buf.len() {
                buf[..len].copy_from_slice(&frame);
                return &mut buf[..len];
            }
            nut_warn!("Skipping {=usize} byte frame", len);
        }
    }
}
