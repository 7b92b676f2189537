//! Scripted stand-ins for the hardware and storage seams.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rppal::gpio::{Level, Mode};

use crate::db::BatchStore;
use crate::dht22::{Capture, START_OF_FRAME, calculate_checksum};
use crate::hardware::{BitReader, Gpio};
use crate::sample::Sample;

pub fn capture_from_bytes(bytes: [u8; 5]) -> Capture {
    let bits = bytes
        .iter()
        .flat_map(|byte| (0..8).rev().map(move |i| (byte >> i) & 1))
        .collect();

    Capture {
        first_bit: Some(START_OF_FRAME),
        bits,
    }
}

pub fn frame(humidity_tenths: u16, temperature_tenths: u16) -> Capture {
    let [b1, b2] = humidity_tenths.to_be_bytes();
    let [b3, b4] = temperature_tenths.to_be_bytes();
    let checksum = calculate_checksum(&[b1, b2, b3, b4, 0]);
    capture_from_bytes([b1, b2, b3, b4, checksum])
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[derive(Debug, Default)]
struct PinScript {
    queued: VecDeque<Capture>,
    fallback: Option<Capture>,
    reads: usize,
}

/// Replays queued captures per pin, then the pin's fallback, then silence.
#[derive(Debug, Default)]
pub struct ScriptedReader {
    pins: Mutex<HashMap<u8, PinScript>>,
}

impl ScriptedReader {
    pub fn new() -> ScriptedReader {
        ScriptedReader::default()
    }

    pub fn push(&self, pin: u8, capture: Capture) {
        self.pins
            .lock()
            .unwrap()
            .entry(pin)
            .or_default()
            .queued
            .push_back(capture);
    }

    pub fn set_default(&self, pin: u8, capture: Capture) {
        self.pins.lock().unwrap().entry(pin).or_default().fallback = Some(capture);
    }

    pub fn reads(&self, pin: u8) -> usize {
        self.pins.lock().unwrap().get(&pin).map_or(0, |p| p.reads)
    }
}

impl BitReader for ScriptedReader {
    fn read_bits(&self, pin: u8, _delay: Duration) -> Capture {
        let mut pins = self.pins.lock().unwrap();
        let script = pins.entry(pin).or_default();
        script.reads += 1;
        script
            .queued
            .pop_front()
            .or_else(|| script.fallback.clone())
            .unwrap_or_else(Capture::no_response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioEvent {
    Mode(u8, Mode),
    Write(u8, Level),
}

#[derive(Debug, Clone, Default)]
pub struct RecordingGpio {
    events: Arc<Mutex<Vec<GpioEvent>>>,
}

impl RecordingGpio {
    pub fn events(&self) -> Vec<GpioEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn writes_to(&self, pin: u8) -> Vec<Level> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                GpioEvent::Write(p, level) if p == pin => Some(level),
                _ => None,
            })
            .collect()
    }
}

impl Gpio for RecordingGpio {
    fn pin_mode(&mut self, pin: u8, mode: Mode) -> Result<(), anyhow::Error> {
        self.events.lock().unwrap().push(GpioEvent::Mode(pin, mode));
        Ok(())
    }

    fn digital_write(&mut self, pin: u8, level: Level) -> Result<(), anyhow::Error> {
        self.events.lock().unwrap().push(GpioEvent::Write(pin, level));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    batches: Arc<Mutex<Vec<Vec<Sample>>>>,
    failures_left: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn failing(times: usize) -> MemoryStore {
        let store = MemoryStore::default();
        store.failures_left.store(times, Ordering::SeqCst);
        store
    }

    pub fn batches(&self) -> Vec<Vec<Sample>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.batches().into_iter().flatten().collect()
    }
}

impl BatchStore for MemoryStore {
    fn write(&mut self, batch: &[Sample]) -> Result<PathBuf, anyhow::Error> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("disk unavailable");
        }

        let mut batches = self.batches.lock().unwrap();
        batches.push(batch.to_vec());
        Ok(PathBuf::from(format!("batch-{}", batches.len())))
    }
}
