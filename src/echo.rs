//! Echo verification loop
//!
//! Sends a running 8-bit counter to the peer, reads one byte back after a
//! short think time and checks that the peer answered `counter + 1`. One
//! status line per iteration goes to the console, plus a tally every
//! [`EchoConfig::stats_every`] iterations:
//!
//! ```text
//! [007] TX: 0x07 ✓ | RX: 0x08 ✓
//! [008] TX: 0x08 ✓ | RX: 0x0A ✗ (expected 0x09)
//! [009] TX: 0x09 ✗ NACK
//! --- Stats: Success=8, Fail=2 ---
//! ```
//!
//! Every collaborator is injected, so the loop runs unchanged against a fake
//! platform.

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Read, Write};
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::watchdog::Watchdog;

use crate::i2c::Status;

/// Address of the echoing peer.
pub const PEER_ADDRESS: u8 = 0x55;

/// Echo loop configuration
#[derive(Debug, Clone, Copy)]
pub struct EchoConfig {
    /// 7-bit peer address
    pub peer: u8,
    /// Pause between the write and the read, giving the peer time to answer
    pub think_time_ms: u32,
    /// Pause between iterations
    pub gap_ms: u32,
    /// Print the tally whenever `counter % stats_every == stats_every - 1`.
    /// Zero disables it.
    pub stats_every: u8,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            peer: PEER_ADDRESS,
            think_time_ms: 100,
            gap_ms: 500,
            stats_every: 10,
        }
    }
}

/// Running tally. Both counters wrap at 256.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    pub success: u8,
    pub fail: u8,
}

/// Result of one iteration
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// Peer answered `counter + 1`
    Echoed,
    /// Peer answered something else
    Mismatch { expected: u8, received: u8 },
    /// Peer refused the counter byte
    WriteFailed(Status),
    /// Counter was accepted but the read back failed
    ReadFailed(Status),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        *self == Outcome::Echoed
    }
}

/// The top-level activity: exchange, verify, report, repeat.
pub struct EchoLoop<I2C, DELAY, LED, WDG, CON> {
    i2c: I2C,
    delay: DELAY,
    led: LED,
    watchdog: WDG,
    console: CON,
    config: EchoConfig,
    counter: u8,
    stats: Stats,
}

impl<I2C, DELAY, LED, WDG, CON, E> EchoLoop<I2C, DELAY, LED, WDG, CON>
where
    I2C: Write<Error = E> + Read<Error = E>,
    E: Into<Status>,
    DELAY: DelayMs<u32>,
    LED: OutputPin,
    WDG: Watchdog,
    CON: fmt::Write,
{
    pub fn new(i2c: I2C, delay: DELAY, led: LED, watchdog: WDG, console: CON, config: EchoConfig) -> Self {
        EchoLoop {
            i2c,
            delay,
            led,
            watchdog,
            console,
            config,
            counter: 0,
            stats: Stats::default(),
        }
    }

    /// Counter value the next iteration will send.
    pub fn counter(&self) -> u8 {
        self.counter
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn free(self) -> (I2C, DELAY, LED, WDG, CON) {
        (self.i2c, self.delay, self.led, self.watchdog, self.console)
    }

    /// Print the startup banner naming the peer.
    pub fn banner(&mut self) {
        const RULE: &str = "========================================";

        self.emit(format_args!("\r\n{}\r\n", RULE));
        self.emit(format_args!("I2C echo master\r\n"));
        self.emit(format_args!("{}\r\n", RULE));
        let peer = self.config.peer;
        self.emit(format_args!("Peer at 0x{:02X}\r\n", peer));
        self.emit(format_args!("{}\r\n\r\n", RULE));
    }

    /// Banner, then iterate forever.
    pub fn run(mut self) -> ! {
        self.banner();
        loop {
            self.step();
        }
    }

    /// One full iteration, including the watchdog refresh and the gap.
    pub fn step(&mut self) -> Outcome {
        let counter = self.counter;
        self.emit(format_args!("[{:03}] TX: 0x{:02X} ", counter, counter));

        let outcome = self.exchange(counter);
        if outcome.is_success() {
            self.stats.success = self.stats.success.wrapping_add(1);
        } else {
            self.stats.fail = self.stats.fail.wrapping_add(1);
        }
        self.emit(format_args!("\r\n"));

        let every = self.config.stats_every;
        if every != 0 && counter % every == every - 1 {
            let Stats { success, fail } = self.stats;
            self.emit(format_args!("--- Stats: Success={}, Fail={} ---\r\n", success, fail));
        }

        self.counter = counter.wrapping_add(1);
        self.watchdog.feed();
        self.delay.delay_ms(self.config.gap_ms);

        outcome
    }

    fn exchange(&mut self, counter: u8) -> Outcome {
        let peer = self.config.peer;

        if let Err(error) = self.i2c.write(peer, &[counter]) {
            let status = error.into();
            #[cfg(feature = "defmt")]
            defmt::warn!("echo: write of {=u8} failed: {}", counter, status);
            self.emit(format_args!("✗ NACK"));
            return Outcome::WriteFailed(status);
        }

        self.emit(format_args!("✓ "));
        self.led.set_high().ok();
        self.delay.delay_ms(self.config.think_time_ms);

        let mut response = [0u8];
        let outcome = match self.i2c.read(peer, &mut response) {
            Err(error) => {
                let status = error.into();
                #[cfg(feature = "defmt")]
                defmt::warn!("echo: read after {=u8} failed: {}", counter, status);
                self.emit(format_args!("| RX: FAIL"));
                Outcome::ReadFailed(status)
            }
            Ok(()) => {
                let received = response[0];
                let expected = counter.wrapping_add(1);
                self.emit(format_args!("| RX: 0x{:02X} ", received));

                if received == expected {
                    self.emit(format_args!("✓"));
                    Outcome::Echoed
                } else {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("echo: expected {=u8:#x}, got {=u8:#x}", expected, received);
                    self.emit(format_args!("✗ (expected 0x{:02X})", expected));
                    Outcome::Mismatch { expected, received }
                }
            }
        };

        self.led.set_low().ok();
        outcome
    }

    // Console failures must not stop the loop.
    fn emit(&mut self, args: fmt::Arguments) {
        self.console.write_fmt(args).ok();
    }
}
