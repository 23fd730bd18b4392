//! Counter echo against a peer at 0x55, on a Blue Pill (STM32F103).
//!
//! - SCL: PB6, SDA: PB7, open-drain with external pull-ups
//! - LED: PC13 (lit when low)
//! - Console: RTT channel 0
//!
//! ```text
//! cargo run --release --example echo --features board --target thumbv7m-none-eabi
//! ```

#![no_std]
#![no_main]

use panic_halt as _;

use core::fmt;

use cortex_m_rt::entry;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::watchdog::WatchdogEnable;
use rtt_target::{rprint, rprintln, rtt_init_print};
use stm32f1xx_hal::delay::Delay;
use stm32f1xx_hal::watchdog::IndependentWatchdog;
use stm32f1xx_hal::{prelude::*, stm32, timer::Timer};

use bitbang_i2c_echo::echo::{EchoConfig, EchoLoop};
use bitbang_i2c_echo::i2c::{SoftI2c, Speed, QUARTER_BIT_HZ};

const HSE_MHZ: u32 = 8;
const SYSCLK_MHZ: u32 = 48;
const WATCHDOG_MS: u32 = 2_000;

/// RTT as the echo loop's console.
struct RttConsole;

impl fmt::Write for RttConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        rprint!("{}", s);
        Ok(())
    }
}

/// Inverts an output so `set_high` means "LED on".
struct ActiveLow<P>(P);

impl<P: OutputPin> OutputPin for ActiveLow<P> {
    type Error = P::Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_high()
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_low()
    }
}

#[entry]
fn main() -> ! {
    rtt_init_print!();

    // Bring-up runs with interrupts masked.
    let echo = cortex_m::interrupt::free(|_| {
        let cp = cortex_m::Peripherals::take().unwrap();
        let pdev = stm32::Peripherals::take().unwrap();

        let mut flash = pdev.FLASH.constrain();
        let mut rcc = pdev.RCC.constrain();

        let clocks = rcc
            .cfgr
            .use_hse(HSE_MHZ.mhz())
            .sysclk(SYSCLK_MHZ.mhz())
            .pclk1((SYSCLK_MHZ / 2).mhz())
            .freeze(&mut flash.acr);

        let mut gpiob = pdev.GPIOB.split(&mut rcc.apb2);
        let mut gpioc = pdev.GPIOC.split(&mut rcc.apb2);

        let mut led = ActiveLow(gpioc.pc13.into_push_pull_output(&mut gpioc.crh));
        led.set_low().ok();

        let tick = Timer::tim3(pdev.TIM3, &clocks, &mut rcc.apb1).start_count_down(QUARTER_BIT_HZ.hz());
        let scl = gpiob.pb6.into_open_drain_output(&mut gpiob.crl);
        let sda = gpiob.pb7.into_open_drain_output(&mut gpiob.crl);

        let mut i2c = SoftI2c::new(scl, sda, tick);
        if let Err(e) = i2c.init(Speed::Standard) {
            // Keep going: every transfer will fail and be counted.
            rprintln!("I2C init failed: {:?}", e.status());
        }

        let delay = Delay::new(cp.SYST, clocks);

        let mut watchdog = IndependentWatchdog::new(pdev.IWDG);
        watchdog.start(WATCHDOG_MS.ms());

        EchoLoop::new(i2c, delay, led, watchdog, RttConsole, EchoConfig::default())
    });

    echo.run()
}
