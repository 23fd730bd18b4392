//! A [bit banging] I2C master built on the [`embedded-hal`] traits, and the
//! echo loop that exercises it against a peer.
//!
//! - [`i2c`]: the bus engine. Two open-drain pins plus a quarter-bit timer.
//! - [`echo`]: sends a running counter, reads back one byte and checks for
//!   `counter + 1`.
//!
//! [bit banging]: https://en.wikipedia.org/wiki/Bit_banging
//! [`embedded-hal`]: https://github.com/rust-embedded/embedded-hal
//!
//! ## Usage examples
//!
//! See `demos/echo.rs` for the Blue Pill board binary.

#![cfg_attr(not(test), no_std)]

pub mod echo;
pub mod i2c;

pub use echo::{EchoConfig, EchoLoop, Outcome, Stats};
pub use i2c::{Error, Line, SoftI2c, Speed, Status};
