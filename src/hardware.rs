use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use rppal::gpio::{Bias, Gpio as RppalGpio, IoPin, Level, Mode};

use crate::dht22::{Capture, FRAME_BITS};

/// Longest a single line level may last before the read is abandoned.
pub const EDGE_TIMEOUT: Duration = Duration::from_micros(200);
/// High pulses longer than this encode a 1 bit.
pub const ONE_BIT_THRESHOLD: Duration = Duration::from_micros(50);
pub const MIN_START_PULSE: Duration = Duration::from_millis(1);

/// Raw bit capture from a single-wire humidity sensor.
pub trait BitReader: Send + Sync {
    fn read_bits(&self, pin: u8, delay: Duration) -> Capture;
}

/// Pin drive primitives used for the power rail and the status LEDs.
pub trait Gpio {
    fn pin_mode(&mut self, pin: u8, mode: Mode) -> Result<(), anyhow::Error>;
    fn digital_write(&mut self, pin: u8, level: Level) -> Result<(), anyhow::Error>;
}

#[derive(Debug)]
pub struct RpiGpio {
    gpio: RppalGpio,
    pins: HashMap<u8, IoPin>,
}

impl RpiGpio {
    pub fn new() -> Result<RpiGpio, anyhow::Error> {
        let gpio = RppalGpio::new().context("Failed to initialize GPIO")?;
        Ok(RpiGpio {
            gpio,
            pins: HashMap::new(),
        })
    }
}

impl Gpio for RpiGpio {
    fn pin_mode(&mut self, pin: u8, mode: Mode) -> Result<(), anyhow::Error> {
        if let Some(io) = self.pins.get_mut(&pin) {
            io.set_mode(mode);
            return Ok(());
        }

        let io = self
            .gpio
            .get(pin)
            .with_context(|| format!("Failed to acquire GPIO pin {pin}"))?
            .into_io(mode);
        self.pins.insert(pin, io);
        Ok(())
    }

    fn digital_write(&mut self, pin: u8, level: Level) -> Result<(), anyhow::Error> {
        let io = self
            .pins
            .get_mut(&pin)
            .with_context(|| format!("GPIO pin {pin} has not been configured"))?;

        match level {
            Level::High => io.set_high(),
            Level::Low => io.set_low(),
        }
        Ok(())
    }
}

/// Bit-banged reader for DHT22/AM2302 sensors.
///
/// Timing is best effort: the kernel may preempt the busy loop, which shows
/// up as short frames or checksum failures and is left to the decoder.
#[derive(Debug, Clone)]
pub struct Dht22Reader {
    gpio: RppalGpio,
}

impl Dht22Reader {
    pub fn new() -> Result<Dht22Reader, anyhow::Error> {
        let gpio = RppalGpio::new().context("Failed to initialize GPIO")?;
        Ok(Dht22Reader { gpio })
    }
}

impl BitReader for Dht22Reader {
    fn read_bits(&self, pin: u8, delay: Duration) -> Capture {
        let mut io = match self.gpio.get(pin) {
            Ok(p) => p.into_io(Mode::Output),
            Err(e) => {
                log::debug!("Failed to acquire data pin {pin}: {e}");
                return Capture::no_response();
            }
        };

        io.set_low();
        thread::sleep(delay.max(MIN_START_PULSE));
        io.set_high();
        io.set_mode(Mode::Input);
        io.set_bias(Bias::PullUp);

        // The sensor answers by pulling the line low, then high, for ~80us each.
        if wait_while(&io, Level::High).is_none() {
            return Capture::no_response();
        }
        if wait_while(&io, Level::Low).is_none() {
            return Capture {
                first_bit: Some(0),
                bits: Vec::new(),
            };
        }

        let mut bits = Vec::with_capacity(FRAME_BITS);
        if wait_while(&io, Level::High).is_some() {
            while bits.len() < FRAME_BITS {
                if wait_while(&io, Level::Low).is_none() {
                    break;
                }
                match wait_while(&io, Level::High) {
                    Some(high) => bits.push(u8::from(high > ONE_BIT_THRESHOLD)),
                    None => break,
                }
            }
        }

        Capture {
            first_bit: Some(1),
            bits,
        }
    }
}

fn wait_while(io: &IoPin, level: Level) -> Option<Duration> {
    let start = Instant::now();
    while io.read() == level {
        if start.elapsed() > EDGE_TIMEOUT {
            return None;
        }
    }
    Some(start.elapsed())
}
