//! Mocks shared by the unit tests

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    convert::Infallible,
    rc::Rc,
    vec::Vec,
};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_hal::digital::v2::OutputPin;

use crate::{radio::RxSlot, remote::BatterySensor, Error, RadioLink, TxMode, RADIO_MTU};

type Slot = RxSlot<NoopRawMutex, RADIO_MTU>;

/// What the far end does in answer to one transmitted frame
pub enum Reply {
    Frame(Vec<u8>),
    Silence,
    TxError,
}

/// Canned answers, consumed one per transmit. Silence once empty.
#[derive(Default)]
pub struct Script {
    replies: VecDeque<Reply>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, reply: Reply) -> Self {
        self.replies.push_back(reply);
        self
    }

    pub fn ack(self, transaction_id: u8, battery: u8) -> Self {
        let frame = crate::Ack {
            transaction_id,
            battery,
        }
        .encode();
        self.then(Reply::Frame(frame.to_vec()))
    }

    pub fn silence(mut self, n: usize) -> Self {
        for _ in 0..n {
            self = self.then(Reply::Silence);
        }
        self
    }
}

/// A radio whose peer answers from a [Script]
pub struct ScriptedRadio {
    script: Script,
    inbox: Slot,
    sent: Vec<Vec<u8>>,
    attempts: usize,
    listening: bool,
    idles: usize,
    watched: Option<Board>,
    marks: Vec<usize>,
}

impl ScriptedRadio {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            inbox: Slot::new(),
            sent: Vec::new(),
            attempts: 0,
            listening: false,
            idles: 0,
            watched: None,
            marks: Vec::new(),
        }
    }

    /// Note how far `board`'s history got whenever a frame is sent
    pub fn watching(mut self, board: &Board) -> Self {
        self.watched = Some(board.clone());
        self
    }

    /// Length of the watched board's history at each transmit
    pub fn marks(&self) -> Vec<usize> {
        self.marks.clone()
    }

    /// Times the receiver was switched off outside of a transmit
    pub fn idles(&self) -> usize {
        self.idles
    }

    /// Frames that made it onto the air
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.clone()
    }

    /// Transmit calls, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    /// A frame arrives out of the blue
    pub fn inject(&self, frame: &[u8]) {
        self.inbox.deliver(frame);
    }
}

impl RadioLink for ScriptedRadio {
    type Error = ();

    async fn transmit(&mut self, frame: &[u8], _mode: TxMode) -> Result<(), Error<()>> {
        self.attempts += 1;
        self.listening = false;
        if let Some(board) = &self.watched {
            self.marks.push(board.history().len());
        }
        match self.script.replies.pop_front().unwrap_or(Reply::Silence) {
            Reply::Frame(reply) => {
                self.sent.push(frame.to_vec());
                self.inbox.deliver(&reply);
            }
            Reply::Silence => self.sent.push(frame.to_vec()),
            Reply::TxError => return Err(Error::Radio(())),
        }
        Ok(())
    }

    fn set_receive(&mut self) {
        self.listening = true;
    }

    fn set_idle(&mut self) {
        self.idles += 1;
        self.listening = false;
    }

    async fn recv<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a mut [u8], Error<()>> {
        Ok(self.inbox.wait_into(buf).await)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bridge,
    Remote,
}

/// A shared medium between one bridge and one remote
///
/// Frames only arrive while the receiving side is listening, and a number
/// of frames in each direction can be set to get lost.
#[derive(Default)]
pub struct Air {
    to_bridge: Slot,
    to_remote: Slot,
    bridge_listening: Cell<bool>,
    remote_listening: Cell<bool>,
    lose_to_bridge: Cell<usize>,
    lose_to_remote: Cell<usize>,
    log: RefCell<Vec<(Side, Vec<u8>)>>,
}

impl Air {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn end(self: &Rc<Self>, side: Side) -> AirEnd {
        AirEnd {
            air: self.clone(),
            side,
        }
    }

    /// Lose the next `n` frames headed for the bridge
    pub fn lose_acks(&self, n: usize) {
        self.lose_to_bridge.set(n);
    }

    /// Lose the next `n` frames headed for the remote
    pub fn lose_commands(&self, n: usize) {
        self.lose_to_remote.set(n);
    }

    /// Everything transmitted, by sender
    pub fn sent_by(&self, side: Side) -> Vec<Vec<u8>> {
        self.log
            .borrow()
            .iter()
            .filter(|(s, _)| *s == side)
            .map(|(_, f)| f.clone())
            .collect()
    }
}

pub struct AirEnd {
    air: Rc<Air>,
    side: Side,
}

impl AirEnd {
    fn listening(&self) -> &Cell<bool> {
        match self.side {
            Side::Bridge => &self.air.bridge_listening,
            Side::Remote => &self.air.remote_listening,
        }
    }

    fn inbox(&self) -> &Slot {
        match self.side {
            Side::Bridge => &self.air.to_bridge,
            Side::Remote => &self.air.to_remote,
        }
    }
}

impl RadioLink for AirEnd {
    type Error = ();

    async fn transmit(&mut self, frame: &[u8], _mode: TxMode) -> Result<(), Error<()>> {
        let air = &self.air;
        self.listening().set(false);
        air.log.borrow_mut().push((self.side, frame.to_vec()));

        let (peer_listening, peer_inbox, lose) = match self.side {
            Side::Bridge => (&air.remote_listening, &air.to_remote, &air.lose_to_remote),
            Side::Remote => (&air.bridge_listening, &air.to_bridge, &air.lose_to_bridge),
        };
        if lose.get() > 0 {
            lose.set(lose.get() - 1);
        } else if peer_listening.get() {
            peer_inbox.deliver(frame);
        }
        Ok(())
    }

    fn set_receive(&mut self) {
        self.listening().set(true);
    }

    fn set_idle(&mut self) {
        self.listening().set(false);
    }

    async fn recv<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a mut [u8], Error<()>> {
        Ok(self.inbox().wait_into(buf).await)
    }
}

/// Four recorded output lines
#[derive(Default)]
pub struct BoardState {
    levels: [bool; 4],
    history: Vec<[bool; 4]>,
}

#[derive(Clone, Default)]
pub struct Board {
    state: Rc<RefCell<BoardState>>,
}

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, idx: usize) -> RecordingPin {
        RecordingPin {
            idx,
            board: self.clone(),
        }
    }

    pub fn level(&self, idx: usize) -> bool {
        self.state.borrow().levels[idx]
    }

    /// Every state the lines went through, one entry per pin write
    pub fn history(&self) -> Vec<[bool; 4]> {
        self.state.borrow().history.clone()
    }

    pub fn rising_edges(&self, idx: usize) -> usize {
        let hist = self.history();
        let mut prev = false;
        let mut edges = 0;
        for snap in hist {
            if snap[idx] && !prev {
                edges += 1;
            }
            prev = snap[idx];
        }
        edges
    }

    fn set(&self, idx: usize, level: bool) {
        let mut state = self.state.borrow_mut();
        state.levels[idx] = level;
        let snap = state.levels;
        state.history.push(snap);
    }
}

pub struct RecordingPin {
    idx: usize,
    board: Board,
}

impl OutputPin for RecordingPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.board.set(self.idx, false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.board.set(self.idx, true);
        Ok(())
    }
}

/// A battery that reads whatever the test says
#[derive(Clone, Default)]
pub struct FakeBattery {
    raw: Rc<Cell<u16>>,
    samples: Rc<Cell<usize>>,
}

impl FakeBattery {
    pub fn new(raw: u16) -> Self {
        let b = Self::default();
        b.raw.set(raw);
        b
    }

    pub fn set(&self, raw: u16) {
        self.raw.set(raw);
    }

    pub fn samples(&self) -> usize {
        self.samples.get()
    }
}

impl BatterySensor for FakeBattery {
    fn sample(&mut self) -> u16 {
        self.samples.set(self.samples.get() + 1);
        self.raw.get()
    }
}
