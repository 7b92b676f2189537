use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::mpsc::{Sender, error::TrySendError};

use crate::config::ChannelConfig;
use crate::dht22;
use crate::hardware::BitReader;
use crate::history::{HistoryBuffer, OutlierFilter};
use crate::sample::Sample;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("queue is full, cannot publish sample from pin {pin}")]
    QueueFull { pin: u8 },
    #[error("queue is closed, cannot publish sample from pin {pin}")]
    QueueClosed { pin: u8 },
    #[error("history of pin {pin} rejected its newest sample, check the clock and retention window")]
    HistoryInvariantViolation { pin: u8 },
    #[error("channel for pin {pin} is not idle")]
    NotIdle { pin: u8 },
    #[error("channel thread for pin {pin} panicked")]
    Panicked { pin: u8 },
    #[error("failed to spawn channel thread for pin {pin}")]
    Spawn {
        pin: u8,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub pin: u8,
    pub state: ChannelState,
    pub is_running: bool,
    pub is_finished: bool,
    pub latest_sample: Option<Sample>,
    pub freshness: Option<Duration>,
    pub history_len: usize,
}

impl ChannelStatus {
    pub fn pretty(&self, tz: &Tz) -> String {
        let latest = self
            .latest_sample
            .as_ref()
            .map_or_else(|| "none".to_string(), |s| s.pretty(tz));
        let freshness = self
            .freshness
            .map_or_else(|| "n/a".to_string(), |f| format!("{:.1}s", f.as_secs_f64()));

        format!(
            "pin: {}, state: {:?}, running: {}, finished: {}, history: {}, latest: [{}], freshness: {}",
            self.pin,
            self.state,
            self.is_running,
            self.is_finished,
            self.history_len,
            latest,
            freshness
        )
    }
}

/// Renders sample times in UTC; use `pretty` for a local timezone.
impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty(&Tz::UTC))
    }
}

#[derive(Debug, Default)]
struct Shared {
    keep_running: AtomicBool,
    finished: AtomicBool,
    history_len: AtomicUsize,
    latest: Mutex<Option<Sample>>,
}

impl Shared {
    fn latest(&self) -> Option<Sample> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_latest(&self, sample: Sample) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
    }
}

/// Polls one sensor pin on its own thread and publishes validated samples.
pub struct SensorChannel {
    pin: u8,
    config: ChannelConfig,
    reader: Arc<dyn BitReader>,
    sender: Option<Sender<Sample>>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Result<(), ChannelError>>>,
}

impl SensorChannel {
    pub fn new(
        pin: u8,
        config: ChannelConfig,
        reader: Arc<dyn BitReader>,
        sender: Sender<Sample>,
    ) -> SensorChannel {
        SensorChannel {
            pin,
            config,
            reader,
            sender: Some(sender),
            shared: Arc::default(),
            handle: None,
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn start(&mut self) -> Result<(), ChannelError> {
        let pin = self.pin;
        if self.state() != ChannelState::Idle {
            return Err(ChannelError::NotIdle { pin });
        }
        let Some(sender) = self.sender.take() else {
            return Err(ChannelError::NotIdle { pin });
        };

        let poller = Poller {
            pin,
            history: HistoryBuffer::new(self.config.retention),
            filter: OutlierFilter {
                min_history: self.config.min_history,
                threshold: self.config.outlier_threshold,
            },
            config: self.config.clone(),
            reader: Arc::clone(&self.reader),
            sender,
            shared: Arc::clone(&self.shared),
        };

        self.shared.keep_running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("dht-pin-{pin}"))
            .spawn(move || {
                let result = poller.run();
                shared.keep_running.store(false, Ordering::Release);
                shared.finished.store(true, Ordering::Release);
                result
            })
            .map_err(|source| {
                self.shared.keep_running.store(false, Ordering::Release);
                self.shared.finished.store(true, Ordering::Release);
                ChannelError::Spawn { pin, source }
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Asks the polling loop to exit after the cycle in flight.
    pub fn stop(&mut self) {
        self.shared.keep_running.store(false, Ordering::Release);
        match &self.handle {
            Some(handle) => handle.thread().unpark(),
            None => {
                // never started; nothing will ever run
                self.sender = None;
                self.shared.finished.store(true, Ordering::Release);
            }
        }
    }

    /// Waits for the polling thread and returns how it ended.
    pub fn join(&mut self) -> Result<(), ChannelError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let result = handle.join().unwrap_or(Err(ChannelError::Panicked { pin: self.pin }));
        self.shared.finished.store(true, Ordering::Release);
        result
    }

    /// Joins the thread if it has already exited on its own.
    pub fn reap(&mut self) -> Option<Result<(), ChannelError>> {
        if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            Some(self.join())
        } else {
            None
        }
    }

    pub fn state(&self) -> ChannelState {
        if self.shared.finished.load(Ordering::Acquire) {
            ChannelState::Stopped
        } else if self.handle.is_some() {
            ChannelState::Running
        } else {
            ChannelState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ChannelState::Running && self.shared.keep_running.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ChannelState::Stopped
    }

    pub fn latest_sample(&self) -> Option<Sample> {
        self.shared.latest()
    }

    /// Age of the latest sample.
    pub fn freshness(&self) -> Option<Duration> {
        self.shared.latest().as_ref().map(age)
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            pin: self.pin,
            state: self.state(),
            is_running: self.is_running(),
            is_finished: self.is_finished(),
            latest_sample: self.latest_sample(),
            freshness: self.freshness(),
            history_len: self.shared.history_len.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SensorChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn age(sample: &Sample) -> Duration {
    (Utc::now() - sample.timestamp).to_std().unwrap_or_default()
}

struct Poller {
    pin: u8,
    config: ChannelConfig,
    reader: Arc<dyn BitReader>,
    sender: Sender<Sample>,
    shared: Arc<Shared>,
    history: HistoryBuffer,
    filter: OutlierFilter,
}

impl Poller {
    fn run(mut self) -> Result<(), ChannelError> {
        log::info!("Channel for pin {} started", self.pin);

        while self.shared.keep_running.load(Ordering::Acquire) {
            let cycle_start = Instant::now();

            if let Err(e) = self.poll_once() {
                log::error!("{e}");
                return Err(e);
            }

            let remaining = self
                .config
                .poll_interval
                .saturating_sub(cycle_start.elapsed());
            self.sleep(remaining);
        }

        log::info!("Channel for pin {} stopped", self.pin);
        Ok(())
    }

    fn poll_once(&mut self) -> Result<(), ChannelError> {
        let pin = self.pin;
        let capture = self.reader.read_bits(pin, self.config.read_delay);

        let reading = match dht22::decode(&capture) {
            Ok(reading) => reading,
            Err(e) => {
                log::debug!("Skipping read on pin {pin}: {e}");
                return Ok(());
            }
        };

        let now = Utc::now();
        self.history.evict(now);

        let sample = self.filter.apply(
            &self.history,
            Sample {
                pin,
                humidity: reading.humidity,
                temperature_f: reading.temperature_fahrenheit(),
                timestamp: now,
            },
        );

        self.history
            .append(sample.clone(), now)
            .map_err(|_| ChannelError::HistoryInvariantViolation { pin })?;
        self.shared
            .history_len
            .store(self.history.len(), Ordering::Relaxed);
        self.shared.set_latest(sample.clone());

        log::info!("{}", sample.pretty(&self.config.timezone));

        self.sender.try_send(sample).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::QueueFull { pin },
            TrySendError::Closed(_) => ChannelError::QueueClosed { pin },
        })
    }

    // Woken early by `SensorChannel::stop`.
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.shared.keep_running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
}
