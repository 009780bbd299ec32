//! Transport Byte Channel
//!
//! The byte pipe between the host and the bridge node. It is shared between
//! two contexts:
//!
//! * The transport interrupt, which calls [ByteChannel::begin_transfer],
//!   [ByteChannel::on_byte_received], [ByteChannel::next_tx_byte] and
//!   [ByteChannel::end_transfer]. It only moves bytes, it never looks at
//!   them.
//! * The bridge main loop, which takes complete frames out of the receive
//!   buffer and publishes replies.
//!
//! The transmit side is double buffered. The main loop prepares the NEXT
//! buffer whenever it likes, but only copies NEXT into ACTIVE (the buffer
//! the interrupt drains) when it observes the transport idle. A reply that
//! is half way out on the wire is never modified.
//!
//! Once ACTIVE is drained, the interrupt clocks out zeros. The host reads an
//! all-zero reply as "busy, no reply yet".
//!
//! Every access happens inside a short [Mutex] section. Pick a raw mutex
//! that is sound for the context the transport interrupt runs in, e.g.
//! `CriticalSectionRawMutex`.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};
use heapless::Vec;

/// Capacity of the receive and transmit buffers
///
/// Reaching it on receive is treated as garbage on the line and resets
/// the receive buffer.
pub const CHANNEL_CAPACITY: usize = 16;

/// A frame taken out of the receive buffer
pub type RxFrame = Vec<u8, CHANNEL_CAPACITY>;

/// The main loop tried to touch the transmit side mid-transfer
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ChannelError {
    /// A transfer is in progress
    Busy,
}

struct TxBuffer {
    data: [u8; CHANNEL_CAPACITY],
    len: usize,
}

impl TxBuffer {
    const fn new() -> Self {
        Self {
            data: [0u8; CHANNEL_CAPACITY],
            len: 0,
        }
    }

    fn fill(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(CHANNEL_CAPACITY);
        self.data = [0u8; CHANNEL_CAPACITY];
        self.data[..len].copy_from_slice(&bytes[..len]);
        self.len = len;
    }

    fn clear(&mut self) {
        self.data = [0u8; CHANNEL_CAPACITY];
        self.len = 0;
    }
}

struct Shared {
    busy: bool,
    rx: RxFrame,
    active: TxBuffer,
    cursor: usize,
    next: TxBuffer,
}

/// Full duplex byte channel between a transport interrupt and the main loop
pub struct ByteChannel<R: RawMutex> {
    inner: Mutex<R, RefCell<Shared>>,
}

impl<R: RawMutex> Default for ByteChannel<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex> ByteChannel<R> {
    /// Create an empty channel. Usable in a `static`.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Shared {
                busy: false,
                rx: Vec::new(),
                active: TxBuffer::new(),
                cursor: 0,
                next: TxBuffer::new(),
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Shared) -> T) -> T {
        self.inner.lock(|c| f(&mut c.borrow_mut()))
    }
}

/// Transport (interrupt) side
impl<R: RawMutex> ByteChannel<R> {
    /// The host started clocking a transfer (e.g. chip select asserted)
    pub fn begin_transfer(&self) {
        self.with(|s| s.busy = true);
    }

    /// The transfer finished (e.g. chip select released)
    pub fn end_transfer(&self) {
        self.with(|s| s.busy = false);
    }

    /// Store one received byte
    pub fn on_byte_received(&self, byte: u8) {
        self.with(|s| {
            // Can't fail, we clear before we ever reach capacity
            let _ = s.rx.push(byte);
            if s.rx.len() == CHANNEL_CAPACITY {
                s.rx.clear();
            }
        });
    }

    /// The next byte to shift out to the host
    pub fn next_tx_byte(&self) -> u8 {
        self.with(|s| {
            if s.cursor < s.active.len {
                let b = s.active.data[s.cursor];
                s.cursor += 1;
                b
            } else {
                0
            }
        })
    }

    /// Clock a whole full-duplex transfer through the channel, the way the
    /// transport interrupt would: one byte out for every byte in.
    pub fn exchange(&self, tx: &[u8], rx: &mut [u8]) {
        self.begin_transfer();
        for (i, b) in tx.iter().enumerate() {
            let out = self.next_tx_byte();
            if let Some(slot) = rx.get_mut(i) {
                *slot = out;
            }
            self.on_byte_received(*b);
        }
        self.end_transfer();
    }
}

/// Main loop side
impl<R: RawMutex> ByteChannel<R> {
    /// Is a transfer in progress?
    pub fn is_busy(&self) -> bool {
        self.with(|s| s.busy)
    }

    /// Take everything received so far, resetting the receive buffer
    ///
    /// Returns `None` while a transfer is in progress, or if nothing was
    /// received.
    pub fn take_frame(&self) -> Option<RxFrame> {
        self.with(|s| {
            if s.busy || s.rx.is_empty() {
                return None;
            }
            Some(core::mem::take(&mut s.rx))
        })
    }

    /// Drop anything received so far
    pub fn reset_rx(&self) {
        self.with(|s| s.rx.clear());
    }

    /// Prepare the next reply. Only the NEXT buffer is written, so this is
    /// allowed at any time.
    pub fn stage(&self, reply: &[u8]) {
        self.with(|s| s.next.fill(reply));
    }

    /// Copy NEXT into ACTIVE and rewind the transmit cursor
    pub fn try_swap(&self) -> Result<(), ChannelError> {
        self.with(|s| {
            if s.busy {
                return Err(ChannelError::Busy);
            }
            s.active.data = s.next.data;
            s.active.len = s.next.len;
            s.cursor = 0;
            Ok(())
        })
    }

    /// [stage](Self::stage) then [try_swap](Self::try_swap)
    pub fn publish(&self, reply: &[u8]) -> Result<(), ChannelError> {
        self.stage(reply);
        self.try_swap()
    }

    /// Forget any prepared reply, so the host only reads zeros
    ///
    /// NEXT is always cleared; ACTIVE only if the transport is idle.
    pub fn clear_reply(&self) -> Result<(), ChannelError> {
        self.with(|s| {
            s.next.clear();
            if s.busy {
                return Err(ChannelError::Busy);
            }
            s.active.clear();
            s.cursor = 0;
            Ok(())
        })
    }
}
