/*!
  # Bit-banged I2C master over two open-drain GPIO lines

  This implementation consumes the following hardware resources:
  - A periodic timer ticking once per quarter bit
  - Two open-drain GPIO pins for the SDA and SCL lines.

  Lines are never driven high. A pin is either pulled to ground or released
  to high-Z, and the external pull-up returns it to logic 1. Every line
  transition is surrounded by quarter-bit waits, so setup and hold times do
  not depend on pad drive strength.

  Framing is deliberately plain: no repeated START. [`WriteRead`] issues a
  STOP after the write phase, waits [`SETTLE_TICKS`] and then starts a fresh
  read transaction.

  ## Hardware requirements

  1. Configure both GPIO pins as open-drain outputs that can also be read.
  2. Start the timer at [`QUARTER_BIT_HZ`]. That frequency alone sets the bit
     rate; the [`Speed`] passed to [`SoftI2c::init`] is advisory.

  ## Blue Pill example

  ```ignore
    use stm32f1xx_hal::{prelude::*, stm32, timer::Timer};
    use embedded_hal::blocking::i2c::Write;
    use bitbang_i2c_echo::i2c::{SoftI2c, Speed, QUARTER_BIT_HZ};

    let pdev = stm32::Peripherals::take().unwrap();
    let mut flash = pdev.FLASH.constrain();
    let mut rcc = pdev.RCC.constrain();
    let mut gpiob = pdev.GPIOB.split(&mut rcc.apb2);
    let clocks = rcc.cfgr.use_hse(8.mhz()).sysclk(48.mhz()).freeze(&mut flash.acr);

    let tick = Timer::tim3(pdev.TIM3, &clocks, &mut rcc.apb1)
        .start_count_down(QUARTER_BIT_HZ.hz());
    let scl = gpiob.pb6.into_open_drain_output(&mut gpiob.crl);
    let sda = gpiob.pb7.into_open_drain_output(&mut gpiob.crl);

    let mut i2c = SoftI2c::new(scl, sda, tick);
    i2c.init(Speed::Standard).unwrap();
    i2c.write(0x55, &[0x2a]).unwrap();
  ```
*/

use embedded_hal::blocking::i2c::{Read, Write, WriteRead};
use embedded_hal::digital::v2::{InputPin, OutputPin};
use embedded_hal::timer::{CountDown, Periodic};
use nb::block;

/// Tick rate of the quarter-bit timer (5 µs per tick).
///
/// A written bit spans three ticks and a read bit four, so the bus never runs
/// faster than 67 kHz.
pub const QUARTER_BIT_HZ: u32 = 200_000;

/// Quiet time after [`SoftI2c::init`] releases the lines (1 ms).
pub const BUS_RECOVERY_TICKS: u32 = QUARTER_BIT_HZ / 1_000;

/// Gap between the write and read phases of [`WriteRead`] (500 µs).
pub const SETTLE_TICKS: u32 = QUARTER_BIT_HZ / 2_000;

/// Default clock-stretch limit (10 ms).
pub const DEFAULT_STRETCH_TIMEOUT_TICKS: u32 = QUARTER_BIT_HZ / 100;

/// SCL pulses issued at init to free a slave that holds SDA low.
///
/// Nine should be enough for any slave, but some need a few more.
pub const RECOVERY_CLOCKS: u8 = 15;

/// Highest valid 7-bit slave address.
pub const MAX_ADDRESS: u8 = 0x7f;

// Spin iterations between releasing SDA and sampling it.
const PAD_SETTLE_SPINS: u32 = 50;

/// I2C error
#[derive(Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// GPIO error
    Bus(E),
    /// Address or data byte not acknowledged. STOP has been issued.
    Nack,
    /// Slave held SCL low past the stretch limit
    Timeout,
    /// SDA or SCL still low after bus recovery at init
    BusStuck,
    /// Address does not fit in 7 bits
    InvalidAddress(u8),
}

impl<E> Error<E> {
    /// Coarse classification of this error.
    pub fn status(&self) -> Status {
        match self {
            Error::Nack => Status::Nack,
            Error::Timeout => Status::Timeout,
            Error::Bus(_) | Error::BusStuck | Error::InvalidAddress(_) => Status::Error,
        }
    }
}

/// Outcome of a transfer, discriminated by tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// Every byte on the wire was acknowledged
    Ok,
    /// GPIO failure, stuck bus or bad argument
    Error,
    /// Clock stretched past the limit
    Timeout,
    /// A transmitted byte was not acknowledged
    Nack,
}

impl Status {
    /// Classify the result of an engine call.
    pub fn of<E>(result: &Result<(), Error<E>>) -> Self {
        match result {
            Ok(()) => Status::Ok,
            Err(error) => error.status(),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl<E> From<Error<E>> for Status {
    fn from(error: Error<E>) -> Self {
        error.status()
    }
}

/// Commanded state of one open-drain line.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Line {
    /// High-Z, pulled up externally
    Released,
    /// Pulled to ground
    DrivenLow,
}

/// Nominal bus speed requested by the caller.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// 100 kHz
    Standard,
    /// 400 kHz
    Fast,
}

impl Speed {
    pub fn hz(self) -> u32 {
        match self {
            Speed::Standard => 100_000,
            Speed::Fast => 400_000,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Ticks to wait for a stretched SCL to rise before giving up with
    /// [`Error::Timeout`]. `None` skips the check entirely: SCL is assumed
    /// high as soon as it is released, and a stretching slave is clocked over.
    pub stretch_timeout: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stretch_timeout: Some(DEFAULT_STRETCH_TIMEOUT_TICKS),
        }
    }
}

/// Bit banging I2C master
pub struct SoftI2c<SCL, SDA, CLK>
where
    SCL: OutputPin + InputPin,
    SDA: OutputPin + InputPin,
    CLK: CountDown + Periodic,
{
    scl: SCL,
    sda: SDA,
    clk: CLK,
    scl_line: Line,
    sda_line: Line,
    speed: Speed,
    config: Config,
}

impl<SCL, SDA, CLK, E> SoftI2c<SCL, SDA, CLK>
where
    SCL: OutputPin<Error = E> + InputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    CLK: CountDown + Periodic,
{
    /// Create instance with the default [`Config`].
    ///
    /// The pins are not touched until [`init`](Self::init). Until then their
    /// state is unknown, so [`lines`](Self::lines) reports both as driven low.
    pub fn new(scl: SCL, sda: SDA, clk: CLK) -> Self {
        Self::with_config(scl, sda, clk, Config::default())
    }

    pub fn with_config(scl: SCL, sda: SDA, clk: CLK, config: Config) -> Self {
        SoftI2c {
            scl,
            sda,
            clk,
            scl_line: Line::DrivenLow,
            sda_line: Line::DrivenLow,
            speed: Speed::Standard,
            config,
        }
    }

    /// Release both lines, let the bus settle and clear a hung slave.
    ///
    /// `speed` is recorded but does not change timing; see [`QUARTER_BIT_HZ`].
    pub fn init(&mut self, speed: Speed) -> Result<(), Error<E>> {
        self.speed = speed;

        self.release_sda()?;
        self.raise_scl()?;
        self.wait_ticks(BUS_RECOVERY_TICKS);

        self.recover().map_err(|error| {
            self.abandon();
            error
        })
    }

    /// Speed passed to the last [`init`](Self::init).
    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Commanded state of `(SCL, SDA)`. Meaningful once [`init`](Self::init) has run.
    pub fn lines(&self) -> (Line, Line) {
        (self.scl_line, self.sda_line)
    }

    /// True when the master is driving neither line.
    pub fn is_idle(&self) -> bool {
        self.lines() == (Line::Released, Line::Released)
    }

    /// Give back the pins and the timer.
    pub fn free(self) -> (SCL, SDA, CLK) {
        (self.scl, self.sda, self.clk)
    }

    fn recover(&mut self) -> Result<(), Error<E>> {
        if self.scl.is_low().map_err(Error::Bus)? {
            #[cfg(feature = "defmt")]
            defmt::warn!("i2c: SCL held low at init");
            return Err(Error::BusStuck);
        }
        if self.sda.is_high().map_err(Error::Bus)? {
            return Ok(());
        }

        #[cfg(feature = "defmt")]
        defmt::warn!("i2c: SDA held low at init, clocking it free");

        for _ in 0..RECOVERY_CLOCKS {
            if self.sda.is_high().map_err(Error::Bus)? {
                break;
            }
            self.set_scl_low()?;
            self.wait_for_clk();
            self.raise_scl()?;
            self.wait_for_clk();
        }

        if self.sda.is_low().map_err(Error::Bus)? {
            return Err(Error::BusStuck);
        }

        // Park both lines low, then STOP so the slave resets its state machine.
        self.set_scl_low()?;
        self.wait_for_clk();
        self.i2c_stop()
    }

    fn i2c_start(&mut self) -> Result<(), Error<E>> {
        self.release_sda()?;
        self.wait_for_clk();
        self.release_scl()?;
        self.wait_for_clk();

        self.set_sda_low()?;
        self.wait_for_clk();
        self.set_scl_low()?;
        self.wait_for_clk();

        Ok(())
    }

    // Entered with SCL low.
    fn i2c_stop(&mut self) -> Result<(), Error<E>> {
        self.set_sda_low()?;
        self.wait_for_clk();
        self.release_scl()?;
        self.wait_for_clk();
        self.release_sda()?;
        self.wait_for_clk();

        Ok(())
    }

    /// Shift `byte` out MSB first, then clock in the slave's ACK bit.
    fn i2c_write_byte(&mut self, byte: u8) -> Result<bool, Error<E>> {
        for bit_offset in 0..8 {
            self.set_scl_low()?;
            self.wait_for_clk();

            if (byte >> (7 - bit_offset)) & 0b1 == 1 {
                self.release_sda()?;
            } else {
                self.set_sda_low()?;
            }
            self.wait_for_clk();

            self.release_scl()?;
            self.wait_for_clk();
        }

        self.set_scl_low()?;
        self.wait_for_clk();
        self.release_sda()?;
        self.wait_for_clk();
        self.release_scl()?;
        self.wait_for_clk();

        let ack = !self.sample_sda()?;
        self.wait_for_clk();
        self.set_scl_low()?;
        self.wait_for_clk();

        Ok(ack)
    }

    /// Shift a byte in MSB first, sampling in the middle of SCL high, then
    /// answer with ACK or NACK.
    fn i2c_read_byte(&mut self, should_send_ack: bool) -> Result<u8, Error<E>> {
        let mut byte: u8 = 0;

        self.release_sda()?;

        for _ in 0..8 {
            self.set_scl_low()?;
            self.wait_for_clk();
            self.wait_for_clk();

            self.release_scl()?;
            self.wait_for_clk();

            byte <<= 1;
            if self.sample_sda()? {
                byte |= 1;
            }
            self.wait_for_clk();
        }

        self.set_scl_low()?;
        self.wait_for_clk();

        if should_send_ack {
            self.set_sda_low()?;
        } else {
            self.release_sda()?;
        }
        self.wait_for_clk();

        self.release_scl()?;
        self.wait_for_clk();
        self.wait_for_clk();
        self.set_scl_low()?;
        self.wait_for_clk();

        self.release_sda()?;

        Ok(byte)
    }

    fn transmit(&mut self, frame: u8, output: &[u8]) -> Result<(), Error<E>> {
        // ST
        self.i2c_start()?;

        // SAD + W
        if !self.i2c_write_byte(frame)? {
            return self.refused();
        }

        for byte in output {
            if !self.i2c_write_byte(*byte)? {
                return self.refused();
            }
        }

        // SP
        self.i2c_stop()
    }

    fn receive(&mut self, frame: u8, input: &mut [u8]) -> Result<(), Error<E>> {
        // ST
        self.i2c_start()?;

        // SAD + R
        if !self.i2c_write_byte(frame)? {
            return self.refused();
        }

        // The slave already drives the MSB of its first byte. Clock one byte
        // out and NACK it, or that bit could mask the STOP.
        if input.is_empty() {
            self.i2c_read_byte(false)?;
        }

        let last = input.len().saturating_sub(1);
        for (i, slot) in input.iter_mut().enumerate() {
            *slot = self.i2c_read_byte(i < last)?;
        }

        // SP
        self.i2c_stop()
    }

    fn refused(&mut self) -> Result<(), Error<E>> {
        self.i2c_stop()?;
        Err(Error::Nack)
    }

    /// Run one framed transaction, releasing the bus if it fails midway.
    fn transaction<F>(&mut self, frame: u8, op: F) -> Result<(), Error<E>>
    where
        F: FnOnce(&mut Self, u8) -> Result<(), Error<E>>,
    {
        let result = op(self, frame);
        match &result {
            Err(Error::Timeout) | Err(Error::Bus(_)) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("i2c: transfer to {=u8:#x} aborted, releasing bus", frame >> 1);
                self.abandon();
            }
            #[cfg(feature = "defmt")]
            Err(Error::Nack) => defmt::debug!("i2c: NACK from {=u8:#x}", frame >> 1),
            _ => {}
        }
        result
    }

    // Best effort: the transfer has already failed.
    fn abandon(&mut self) {
        self.scl_line = Line::Released;
        self.sda_line = Line::Released;
        self.scl.set_high().ok();
        self.sda.set_high().ok();
    }

    /// Release SCL and wait out any clock stretching.
    fn release_scl(&mut self) -> Result<(), Error<E>> {
        self.raise_scl()?;

        if let Some(limit) = self.config.stretch_timeout {
            let mut waited = 0;
            while self.scl.is_low().map_err(Error::Bus)? {
                if waited >= limit {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("i2c: SCL stretched past {=u32} ticks", limit);
                    return Err(Error::Timeout);
                }
                self.wait_for_clk();
                waited += 1;
            }
        }

        Ok(())
    }

    #[inline]
    fn raise_scl(&mut self) -> Result<(), Error<E>> {
        self.scl_line = Line::Released;
        self.scl.set_high().map_err(Error::Bus)
    }

    #[inline]
    fn set_scl_low(&mut self) -> Result<(), Error<E>> {
        self.scl_line = Line::DrivenLow;
        self.scl.set_low().map_err(Error::Bus)
    }

    #[inline]
    fn release_sda(&mut self) -> Result<(), Error<E>> {
        self.sda_line = Line::Released;
        self.sda.set_high().map_err(Error::Bus)
    }

    #[inline]
    fn set_sda_low(&mut self) -> Result<(), Error<E>> {
        self.sda_line = Line::DrivenLow;
        self.sda.set_low().map_err(Error::Bus)
    }

    #[inline]
    fn sample_sda(&mut self) -> Result<bool, Error<E>> {
        self.release_sda()?;
        for _ in 0..PAD_SETTLE_SPINS {
            core::hint::spin_loop();
        }
        self.sda.is_high().map_err(Error::Bus)
    }

    #[inline]
    fn wait_for_clk(&mut self) {
        block!(self.clk.wait()).ok();
    }

    fn wait_ticks(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.wait_for_clk();
        }
    }
}

/// On-wire address byte: 7-bit address followed by the R/W flag.
fn address_byte<E>(address: u8, read: bool) -> Result<u8, Error<E>> {
    if address > MAX_ADDRESS {
        return Err(Error::InvalidAddress(address));
    }
    Ok((address << 1) | read as u8)
}

impl<SCL, SDA, CLK, E> Write for SoftI2c<SCL, SDA, CLK>
where
    SCL: OutputPin<Error = E> + InputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    CLK: CountDown + Periodic,
{
    type Error = Error<E>;

    /// An empty `output` still addresses the slave, which makes a cheap probe.
    fn write(&mut self, addr: u8, output: &[u8]) -> Result<(), Self::Error> {
        let frame = address_byte(addr, false)?;
        self.transaction(frame, |bus, frame| bus.transmit(frame, output))
    }
}

impl<SCL, SDA, CLK, E> Read for SoftI2c<SCL, SDA, CLK>
where
    SCL: OutputPin<Error = E> + InputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    CLK: CountDown + Periodic,
{
    type Error = Error<E>;

    /// The last byte is answered with NACK, all others with ACK. An empty
    /// `input` addresses the slave and discards one NACKed byte.
    fn read(&mut self, addr: u8, input: &mut [u8]) -> Result<(), Self::Error> {
        let frame = address_byte(addr, true)?;
        self.transaction(frame, |bus, frame| bus.receive(frame, input))
    }
}

impl<SCL, SDA, CLK, E> WriteRead for SoftI2c<SCL, SDA, CLK>
where
    SCL: OutputPin<Error = E> + InputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    CLK: CountDown + Periodic,
{
    type Error = Error<E>;

    /// Two separate transactions with a STOP and [`SETTLE_TICKS`] in between.
    fn write_read(&mut self, addr: u8, output: &[u8], input: &mut [u8]) -> Result<(), Self::Error> {
        Write::write(self, addr, output)?;
        self.wait_ticks(SETTLE_TICKS);
        Read::read(self, addr, input)
    }
}
