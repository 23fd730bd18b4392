//! Simulated open-drain I2C bus with a single slave.
//!
//! The master's pins and quarter-bit timer are handles onto a shared
//! [`Wire`]. Each line is the wired-AND of master and slave drive. The slave
//! decodes START/STOP/bits from line edges, so whatever the master does is
//! observed exactly as a logic analyser would see it.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::{InputPin, OutputPin};
use embedded_hal::timer::{CountDown, Periodic};
use embedded_hal::watchdog::Watchdog;
use void::Void;

/// What the bus carried, in order.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Event {
    Start,
    Stop,
    /// A byte plus the ACK bit that followed it. For bytes the slave sent,
    /// `acked` is the master's answer.
    Byte { value: u8, acked: bool },
}

/// How the slave picks the bytes it sends.
pub enum Reply {
    /// Pop from a queue, `0xff` once empty.
    Queue(VecDeque<u8>),
    /// Last byte written to the slave, plus one.
    Increment,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Phase {
    Idle,
    Address,
    Receive,
    Transmit(u8),
}

#[derive(Clone, Copy)]
enum Which {
    Scl,
    Sda,
}

struct Wire {
    // master drive, true = released
    master_scl: bool,
    master_sda: bool,
    // slave drive
    slave_sda_low: bool,
    sda_stuck: bool,
    stretch: u32,
    stretch_armed: u32,
    // resolved levels as last seen
    scl: bool,
    sda: bool,

    address: u8,
    nack_address: bool,
    nack_data_at: Option<usize>,
    reply: Reply,

    phase: Phase,
    clocks: u8,
    shift: u8,
    ack: bool,
    data_index: usize,
    last_written: u8,
    received: Vec<u8>,

    ticks: u64,
    log: Vec<(u64, Event)>,
}

impl Wire {
    fn levels(&self) -> (bool, bool) {
        let scl = self.master_scl && self.stretch == 0;
        let sda = self.master_sda && !self.slave_sda_low && !self.sda_stuck;
        (scl, sda)
    }

    fn drive(&mut self, which: Which, released: bool) {
        match which {
            Which::Scl => self.master_scl = released,
            Which::Sda => self.master_sda = released,
        }
        self.settle();
    }

    fn tick(&mut self) {
        self.ticks += 1;
        if self.stretch > 0 && self.stretch != u32::MAX {
            self.stretch -= 1;
            if self.stretch == 0 {
                self.settle();
            }
        }
    }

    fn settle(&mut self) {
        let (scl, sda) = self.levels();
        let (old_scl, old_sda) = (self.scl, self.sda);
        self.scl = scl;
        self.sda = sda;

        if scl && old_scl && sda != old_sda {
            if sda {
                self.on_stop();
            } else {
                self.on_start();
            }
        } else if scl && !old_scl {
            self.on_rise();
        } else if !scl && old_scl {
            self.on_fall();
        }

        // The slave only changes SDA while SCL is low, so no edge to report.
        self.sda = self.levels().1;
    }

    fn record(&mut self, event: Event) {
        self.log.push((self.ticks, event));
    }

    fn on_start(&mut self) {
        self.phase = Phase::Address;
        self.clocks = 0;
        self.shift = 0;
        self.slave_sda_low = false;
        self.record(Event::Start);
    }

    fn on_stop(&mut self) {
        self.phase = Phase::Idle;
        self.slave_sda_low = false;
        self.record(Event::Stop);
    }

    fn on_rise(&mut self) {
        match self.phase {
            Phase::Idle => {}
            Phase::Address | Phase::Receive => {
                if self.clocks < 8 {
                    self.shift = (self.shift << 1) | self.sda as u8;
                }
                self.clocks += 1;
            }
            Phase::Transmit(_) => {
                self.clocks += 1;
                if self.clocks == 9 {
                    self.ack = !self.sda;
                }
            }
        }
    }

    fn on_fall(&mut self) {
        if self.stretch_armed > 0 && self.phase != Phase::Idle {
            self.stretch = self.stretch_armed;
            self.stretch_armed = 0;
        }

        match self.phase {
            Phase::Idle => {}
            Phase::Address | Phase::Receive => {
                if self.clocks == 8 {
                    self.ack = if self.phase == Phase::Address {
                        self.shift >> 1 == self.address && !self.nack_address
                    } else {
                        self.nack_data_at != Some(self.data_index)
                    };
                    self.slave_sda_low = self.ack;
                } else if self.clocks == 9 {
                    self.slave_sda_low = false;
                    let value = self.shift;
                    let acked = self.ack;
                    self.record(Event::Byte { value, acked });
                    self.clocks = 0;
                    self.shift = 0;

                    if self.phase == Phase::Address {
                        if !acked {
                            self.phase = Phase::Idle;
                        } else if value & 1 == 1 {
                            self.begin_transmit();
                        } else {
                            self.phase = Phase::Receive;
                            self.data_index = 0;
                        }
                    } else {
                        self.received.push(value);
                        self.last_written = value;
                        self.data_index += 1;
                        if !acked {
                            self.phase = Phase::Idle;
                        }
                    }
                }
            }
            Phase::Transmit(byte) => {
                if self.clocks < 8 {
                    self.slave_sda_low = (byte >> (7 - self.clocks)) & 1 == 0;
                } else if self.clocks == 8 {
                    self.slave_sda_low = false;
                } else {
                    let acked = self.ack;
                    self.record(Event::Byte { value: byte, acked });
                    if acked {
                        self.begin_transmit();
                    } else {
                        self.phase = Phase::Idle;
                    }
                }
            }
        }
    }

    fn begin_transmit(&mut self) {
        let byte = match &mut self.reply {
            Reply::Queue(queue) => queue.pop_front().unwrap_or(0xff),
            Reply::Increment => self.last_written.wrapping_add(1),
        };
        self.phase = Phase::Transmit(byte);
        self.clocks = 0;
        self.slave_sda_low = byte & 0x80 == 0;
    }
}

/// Handle onto the shared bus.
#[derive(Clone)]
pub struct Bus(Rc<RefCell<Wire>>);

impl Bus {
    /// Idle bus with a slave at `address` that ACKs everything.
    pub fn new(address: u8) -> Self {
        Bus(Rc::new(RefCell::new(Wire {
            master_scl: true,
            master_sda: true,
            slave_sda_low: false,
            sda_stuck: false,
            stretch: 0,
            stretch_armed: 0,
            scl: true,
            sda: true,
            address,
            nack_address: false,
            nack_data_at: None,
            reply: Reply::Queue(VecDeque::new()),
            phase: Phase::Idle,
            clocks: 0,
            shift: 0,
            ack: false,
            data_index: 0,
            last_written: 0,
            received: Vec::new(),
            ticks: 0,
            log: Vec::new(),
        })))
    }

    pub fn scl(&self) -> Pin {
        Pin {
            bus: self.clone(),
            which: Which::Scl,
        }
    }

    pub fn sda(&self) -> Pin {
        Pin {
            bus: self.clone(),
            which: Which::Sda,
        }
    }

    pub fn ticker(&self) -> Ticker {
        Ticker { bus: self.clone() }
    }

    pub fn reply_with(&self, bytes: &[u8]) {
        self.0.borrow_mut().reply = Reply::Queue(bytes.iter().copied().collect());
    }

    pub fn reply_increment(&self) {
        self.0.borrow_mut().reply = Reply::Increment;
    }

    pub fn nack_address(&self) {
        self.0.borrow_mut().nack_address = true;
    }

    pub fn nack_data_at(&self, index: usize) {
        self.0.borrow_mut().nack_data_at = Some(index);
    }

    /// Hold SCL low for `ticks` starting at the first SCL fall after START.
    /// `u32::MAX` holds it forever.
    pub fn stretch_after_start(&self, ticks: u32) {
        self.0.borrow_mut().stretch_armed = ticks;
    }

    pub fn hold_sda_low(&self) {
        let mut wire = self.0.borrow_mut();
        wire.sda_stuck = true;
        wire.sda = false;
    }

    /// Slave left mid-read by a master reset, driving the MSB of `byte`.
    pub fn interrupted_read(&self, byte: u8) {
        let mut wire = self.0.borrow_mut();
        wire.phase = Phase::Transmit(byte);
        wire.clocks = 0;
        wire.slave_sda_low = byte & 0x80 == 0;
        wire.sda = wire.levels().1;
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().log.iter().map(|(_, e)| *e).collect()
    }

    pub fn timed_events(&self) -> Vec<(u64, Event)> {
        self.0.borrow().log.clone()
    }

    pub fn clear_events(&self) {
        self.0.borrow_mut().log.clear();
    }

    /// Data bytes the slave accepted.
    pub fn received(&self) -> Vec<u8> {
        self.0.borrow().received.clone()
    }

    /// True when the master drives neither line.
    pub fn master_released(&self) -> bool {
        let wire = self.0.borrow();
        wire.master_scl && wire.master_sda
    }

    /// Resolved `(SCL, SDA)` levels.
    pub fn levels(&self) -> (bool, bool) {
        self.0.borrow().levels()
    }

    pub fn ticks(&self) -> u64 {
        self.0.borrow().ticks
    }
}

/// Master side of one line.
pub struct Pin {
    bus: Bus,
    which: Which,
}

impl OutputPin for Pin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.bus.0.borrow_mut().drive(self.which, false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.bus.0.borrow_mut().drive(self.which, true);
        Ok(())
    }
}

impl InputPin for Pin {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Infallible> {
        let (scl, sda) = self.bus.levels();
        Ok(match self.which {
            Which::Scl => scl,
            Which::Sda => sda,
        })
    }

    fn is_low(&self) -> Result<bool, Infallible> {
        self.is_high().map(|high| !high)
    }
}

/// GPIO fault reported by [`Flaky`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Fault;

/// Line that refuses its `nth` `set_low` (1-based) and passes everything else
/// through to the bus.
pub struct Flaky {
    pin: Pin,
    fail_at: Option<usize>,
    lows: usize,
}

impl Flaky {
    pub fn new(pin: Pin, fail_at: Option<usize>) -> Self {
        Flaky {
            pin,
            fail_at,
            lows: 0,
        }
    }
}

impl OutputPin for Flaky {
    type Error = Fault;

    fn set_low(&mut self) -> Result<(), Fault> {
        self.lows += 1;
        if self.fail_at == Some(self.lows) {
            return Err(Fault);
        }
        self.pin.set_low().map_err(|e| match e {})
    }

    fn set_high(&mut self) -> Result<(), Fault> {
        self.pin.set_high().map_err(|e| match e {})
    }
}

impl InputPin for Flaky {
    type Error = Fault;

    fn is_high(&self) -> Result<bool, Fault> {
        self.pin.is_high().map_err(|e| match e {})
    }

    fn is_low(&self) -> Result<bool, Fault> {
        self.pin.is_low().map_err(|e| match e {})
    }
}

/// Quarter-bit timer; every wait advances bus time by one tick.
pub struct Ticker {
    bus: Bus,
}

impl CountDown for Ticker {
    type Time = u32;

    fn start<T>(&mut self, _count: T)
    where
        T: Into<Self::Time>,
    {
    }

    fn wait(&mut self) -> nb::Result<(), Void> {
        self.bus.0.borrow_mut().tick();
        Ok(())
    }
}

impl Periodic for Ticker {}

/// Millisecond delay that only records what was asked.
#[derive(Default)]
pub struct NoDelay {
    pub total_ms: u64,
}

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += u64::from(ms);
    }
}

#[derive(Default)]
pub struct Led {
    pub on: bool,
}

impl OutputPin for Led {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.on = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.on = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct Dog {
    pub feeds: usize,
}

impl Watchdog for Dog {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}
