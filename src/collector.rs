use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backon::{BlockingRetryable, ConstantBuilder};
use rppal::gpio::{Level, Mode};
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{Instant, MissedTickBehavior};

use crate::channel::{ChannelError, ChannelStatus, SensorChannel};
use crate::config::CollectorConfig;
use crate::db::BatchStore;
use crate::hardware::{BitReader, Gpio};
use crate::sample::Sample;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("only {ready} channels ready (out of {total}) after waiting {waited:?}, {stopped} stopped")]
    ChannelsNotReady {
        ready: usize,
        total: usize,
        stopped: usize,
        waited: Duration,
    },
    #[error(transparent)]
    ChannelFailed(ChannelError),
    #[error(transparent)]
    Hardware(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLed {
    Ok,
    Error,
    Off,
}

fn retry_builder() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(Duration::from_millis(100))
        .with_max_times(5)
}

/// Runs one channel per data pin and persists what they publish.
pub struct Collector<G, S> {
    config: CollectorConfig,
    gpio: G,
    store: S,
    channels: Vec<SensorChannel>,
    sender: Sender<Sample>,
    receiver: Receiver<Sample>,
    last_power_cycle: Instant,
    last_status: Instant,
}

impl<G: Gpio, S: BatchStore> Collector<G, S> {
    /// Powers the sensors, starts every channel and waits until each has
    /// produced a sample.
    pub async fn start(
        config: CollectorConfig,
        pins: &[u8],
        reader: Arc<dyn BitReader>,
        mut gpio: G,
        store: S,
    ) -> Result<Self, CollectorError> {
        if let Some(pin) = config.power_pin {
            (|| -> Result<(), anyhow::Error> {
                gpio.pin_mode(pin, Mode::Output)?;
                gpio.digital_write(pin, Level::High)
            })
            .retry(retry_builder())
            .notify(|e, dur| {
                log::error!("{e}");
                log::info!("Retrying in {:?}", dur);
            })
            .call()
            .context("Failed to power up sensors")?;

            log::info!(
                "Sensor power on (pin {pin}), settling for {:?}",
                config.power_settle
            );
            tokio::time::sleep(config.power_settle).await;
        }

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let mut collector = Collector {
            channels: Vec::with_capacity(pins.len()),
            config,
            gpio,
            store,
            sender,
            receiver,
            last_power_cycle: Instant::now(),
            last_status: Instant::now(),
        };

        collector.set_status_led(StatusLed::Off);
        for &pin in pins {
            let mut channel = SensorChannel::new(
                pin,
                collector.config.channel.clone(),
                Arc::clone(&reader),
                collector.sender.clone(),
            );
            let started = channel.start();
            collector.channels.push(channel);

            if let Err(e) = started {
                if let Err(teardown) = collector.abort() {
                    log::error!("Failed to tear down after start failure: {teardown}");
                }
                return Err(CollectorError::ChannelFailed(e));
            }
        }

        collector.wait_ready().await?;
        collector.set_status_led(StatusLed::Ok);

        let now = Instant::now();
        collector.last_power_cycle = now;
        collector.last_status = now;
        Ok(collector)
    }

    async fn wait_ready(&mut self) -> Result<(), CollectorError> {
        let total = self.channels.len();
        let start = Instant::now();

        loop {
            let ready = self
                .channels
                .iter()
                .filter(|c| c.latest_sample().is_some())
                .count();

            if ready == total {
                log::info!("All {total} channels ready after {:?}", start.elapsed());
                return Ok(());
            }

            let waited = start.elapsed();
            if waited >= self.config.ready_timeout {
                self.abort()?;
                let stopped = self.channels.iter().filter(|c| c.is_finished()).count();
                return Err(CollectorError::ChannelsNotReady {
                    ready,
                    total,
                    stopped,
                    waited,
                });
            }

            tokio::time::sleep(self.config.ready_poll).await;
        }
    }

    /// Drains and persists on a fixed cadence until `shutdown` resolves or a
    /// channel fails, then shuts down.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), CollectorError> {
        let mut ticker = tokio::time::interval(self.config.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Stop requested");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        log::error!("{e}");
                        break Err(e);
                    }
                }
            }

            if self.last_power_cycle.elapsed() >= self.config.power_cycle_interval {
                // the off hold is long; a stop request must not wait for it
                tokio::select! {
                    _ = &mut shutdown => {
                        log::info!("Stop requested during power cycle");
                        break Ok(());
                    }
                    cycled = self.power_cycle() => {
                        if let Err(e) = cycled {
                            log::error!("{e}");
                            break Err(e);
                        }
                        self.last_power_cycle = Instant::now();
                    }
                }
            }
        };

        let stopped = self.shutdown();
        result.and(stopped)
    }

    fn tick(&mut self) -> Result<(), CollectorError> {
        self.check_channels()?;

        let batch = self.drain();
        self.persist(&batch);

        if self.last_status.elapsed() >= self.config.status_interval {
            self.log_status();
            self.last_status = Instant::now();
        }

        Ok(())
    }

    fn check_channels(&mut self) -> Result<(), CollectorError> {
        for channel in &mut self.channels {
            match channel.reap() {
                Some(Err(e)) => return Err(CollectorError::ChannelFailed(e)),
                Some(Ok(())) => log::warn!("Channel for pin {} exited", channel.pin()),
                None => {}
            }
        }
        Ok(())
    }

    /// Takes every sample currently queued without waiting.
    pub fn drain(&mut self) -> Vec<Sample> {
        let mut batch = Vec::new();
        while let Ok(sample) = self.receiver.try_recv() {
            batch.push(sample);
        }
        batch
    }

    fn persist(&mut self, batch: &[Sample]) {
        if batch.is_empty() {
            return;
        }

        let written = (|| self.store.write(batch))
            .retry(retry_builder())
            .notify(|e, dur| {
                log::warn!("{e:#}");
                log::info!("Retrying in {:?}", dur);
            })
            .call();

        match written {
            Ok(path) => log::info!("Wrote {} samples to {}", batch.len(), path.display()),
            Err(e) => log::error!("Failed to write batch of {} samples: {e:#}", batch.len()),
        }
    }

    /// Cuts sensor power for `power_off_hold`, then restores it.
    pub async fn power_cycle(&mut self) -> Result<(), CollectorError> {
        let Some(pin) = self.config.power_pin else {
            return Ok(());
        };

        log::info!(
            "Power cycling sensors (pin {pin}) for {:?}",
            self.config.power_off_hold
        );
        self.gpio
            .digital_write(pin, Level::Low)
            .context("Failed to cut sensor power")?;
        tokio::time::sleep(self.config.power_off_hold).await;
        self.gpio
            .digital_write(pin, Level::High)
            .context("Failed to restore sensor power")?;
        Ok(())
    }

    /// Only drives the LEDs when both pins are configured.
    pub fn set_status_led(&mut self, status: StatusLed) {
        let (Some(ok), Some(err)) = (self.config.ok_led_pin, self.config.err_led_pin) else {
            return;
        };

        let (ok_level, err_level) = match status {
            StatusLed::Ok => (Level::High, Level::Low),
            StatusLed::Error => (Level::Low, Level::High),
            StatusLed::Off => (Level::Low, Level::Low),
        };

        let result = self
            .gpio
            .pin_mode(ok, Mode::Output)
            .and_then(|()| self.gpio.pin_mode(err, Mode::Output))
            .and_then(|()| self.gpio.digital_write(ok, ok_level))
            .and_then(|()| self.gpio.digital_write(err, err_level));
        if let Err(e) = result {
            log::error!("Failed to set status LEDs to {status:?}: {e:#}");
        }
    }

    pub fn statuses(&self) -> Vec<ChannelStatus> {
        self.channels.iter().map(SensorChannel::status).collect()
    }

    /// Samples waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn log_status(&self) {
        log::info!("Queue: {}/{}", self.queued(), self.sender.max_capacity());
        for status in self.statuses() {
            log::info!("{}", status.pretty(&self.config.channel.timezone));
        }
    }

    /// Stops every channel and returns the first failure among them.
    fn stop_channels(&mut self) -> Result<(), ChannelError> {
        for channel in &mut self.channels {
            channel.stop();
        }

        let mut first = None;
        for channel in &mut self.channels {
            if let Err(e) = channel.join() {
                log::error!("{e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn power_down(&mut self) -> Result<(), CollectorError> {
        if let Some(pin) = self.config.power_pin {
            self.gpio
                .digital_write(pin, Level::Low)
                .context("Failed to cut sensor power")?;
        }
        Ok(())
    }

    /// Teardown for a collector that never became ready. Nothing is
    /// persisted.
    fn abort(&mut self) -> Result<(), CollectorError> {
        log::warn!("Aborting start of {} channels", self.channels.len());
        self.set_status_led(StatusLed::Error);
        let stopped = self.stop_channels();
        self.power_down()?;
        stopped.map_err(CollectorError::ChannelFailed)
    }

    /// Flags the error LED, stops the channels, persists what is still
    /// queued and cuts sensor power.
    pub fn shutdown(mut self) -> Result<(), CollectorError> {
        log::info!("Shutting down {} channels", self.channels.len());
        self.set_status_led(StatusLed::Error);

        let stopped = self.stop_channels();

        let batch = self.drain();
        self.persist(&batch);

        self.power_down()?;
        stopped.map_err(CollectorError::ChannelFailed)
    }
}

#[cfg(test)]
mod tests {
    use std::future;

    use super::*;
    use crate::config::ChannelConfig;
    use crate::testing::{GpioEvent, MemoryStore, RecordingGpio, ScriptedReader, frame};

    const POWER: u8 = 22;
    const OK_LED: u8 = 5;
    const ERR_LED: u8 = 6;

    fn fast_config() -> CollectorConfig {
        CollectorConfig {
            channel: ChannelConfig {
                poll_interval: Duration::from_millis(5),
                ..ChannelConfig::default()
            },
            power_pin: Some(POWER),
            ok_led_pin: Some(OK_LED),
            err_led_pin: Some(ERR_LED),
            power_settle: Duration::from_millis(1),
            power_off_hold: Duration::from_millis(1),
            ready_timeout: Duration::from_secs(2),
            ready_poll: Duration::from_millis(1),
            drain_interval: Duration::from_millis(10),
            power_cycle_interval: Duration::from_secs(3600),
            status_interval: Duration::from_secs(3600),
            ..CollectorConfig::default()
        }
    }

    fn reader_for(pins: &[u8]) -> Arc<ScriptedReader> {
        let reader = Arc::new(ScriptedReader::new());
        for &pin in pins {
            reader.set_default(pin, frame(500, 200));
        }
        reader
    }

    #[tokio::test]
    async fn test_collects_from_all_channels() {
        let reader = reader_for(&[4, 17]);
        let gpio = RecordingGpio::default();
        let store = MemoryStore::default();

        let collector = Collector::start(
            fast_config(),
            &[4, 17],
            reader,
            gpio.clone(),
            store.clone(),
        )
        .await
        .unwrap();

        assert_eq!(
            &gpio.events()[..2],
            &[
                GpioEvent::Mode(POWER, Mode::Output),
                GpioEvent::Write(POWER, Level::High)
            ]
        );
        assert_eq!(collector.statuses().len(), 2);
        assert!(collector.statuses().iter().all(|s| s.is_running));

        collector
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        let batches = store.batches();
        assert!(!batches.is_empty());
        assert!(batches.iter().all(|b| !b.is_empty()));

        let samples = store.samples();
        assert!(samples.iter().any(|s| s.pin == 4));
        assert!(samples.iter().any(|s| s.pin == 17));
        assert!(samples.iter().all(|s| s.humidity == 50.0 && s.temperature_f == 68.0));

        assert_eq!(gpio.writes_to(POWER), [Level::High, Level::Low]);
        assert_eq!(gpio.writes_to(OK_LED), [Level::Low, Level::High, Level::Low]);
        assert_eq!(gpio.writes_to(ERR_LED), [Level::Low, Level::Low, Level::High]);
    }

    #[tokio::test]
    async fn test_readiness_timeout_stops_all_channels() {
        let reader = reader_for(&[4]);
        let gpio = RecordingGpio::default();
        let config = CollectorConfig {
            ready_timeout: Duration::from_millis(200),
            ..fast_config()
        };

        let err = Collector::start(
            config,
            &[4, 17, 18],
            reader.clone(),
            gpio.clone(),
            MemoryStore::default(),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(
            err,
            CollectorError::ChannelsNotReady {
                ready: 1,
                total: 3,
                stopped: 3,
                ..
            }
        ));
        assert!(err.to_string().starts_with("only 1 channels ready (out of 3)"));
        assert!(err.to_string().ends_with(", 3 stopped"));

        // sensors unpowered and the error LED lit on the way out
        assert_eq!(gpio.writes_to(POWER), [Level::High, Level::Low]);
        assert_eq!(gpio.writes_to(ERR_LED).last(), Some(&Level::High));
        assert_eq!(gpio.writes_to(OK_LED).last(), Some(&Level::Low));

        // every polling thread has been joined, so nothing reads any more
        let reads: Vec<usize> = [4, 17, 18].iter().map(|&p| reader.reads(p)).collect();
        assert!(reads.iter().all(|&n| n > 0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after: Vec<usize> = [4, 17, 18].iter().map(|&p| reader.reads(p)).collect();
        assert_eq!(reads, after);
    }

    #[tokio::test]
    async fn test_channel_failure_during_readiness_is_reported() {
        // pin 4 floods a one-slot queue that nobody drains while pin 17 stays silent
        let reader = reader_for(&[4]);
        let gpio = RecordingGpio::default();
        let config = CollectorConfig {
            queue_capacity: 1,
            ready_timeout: Duration::from_millis(200),
            ..fast_config()
        };

        let err = Collector::start(
            config,
            &[4, 17],
            reader,
            gpio.clone(),
            MemoryStore::default(),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(
            err,
            CollectorError::ChannelFailed(ChannelError::QueueFull { pin: 4 })
        ));
        assert_eq!(gpio.writes_to(POWER).last(), Some(&Level::Low));
        assert_eq!(gpio.writes_to(ERR_LED).last(), Some(&Level::High));
    }

    #[tokio::test]
    async fn test_stop_interrupts_power_cycle() {
        let reader = reader_for(&[4]);
        let gpio = RecordingGpio::default();
        let config = CollectorConfig {
            power_off_hold: Duration::from_secs(30),
            power_cycle_interval: Duration::ZERO,
            ..fast_config()
        };

        let collector = Collector::start(
            config,
            &[4],
            reader,
            gpio.clone(),
            MemoryStore::default(),
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            collector.run(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        // cut for the cycle, never restored, cut again at shutdown
        assert_eq!(gpio.writes_to(POWER), [Level::High, Level::Low, Level::Low]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let reader = reader_for(&[4]);
        let store = MemoryStore::default();
        let config = CollectorConfig {
            drain_interval: Duration::from_secs(3600),
            ..fast_config()
        };

        let collector = Collector::start(
            config,
            &[4],
            reader,
            RecordingGpio::default(),
            store.clone(),
        )
        .await
        .unwrap();

        collector
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        // the immediate first tick, then the final drain on shutdown
        let batches = store.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches[1].len() > 1);
    }

    #[tokio::test]
    async fn test_power_cycles_on_interval() {
        let reader = reader_for(&[4]);
        let gpio = RecordingGpio::default();
        let config = CollectorConfig {
            power_cycle_interval: Duration::from_millis(20),
            ..fast_config()
        };

        let collector = Collector::start(
            config,
            &[4],
            reader,
            gpio.clone(),
            MemoryStore::default(),
        )
        .await
        .unwrap();
        collector
            .run(tokio::time::sleep(Duration::from_millis(150)))
            .await
            .unwrap();

        let writes = gpio.writes_to(POWER);
        assert!(writes.len() >= 4);
        assert_eq!(writes.first(), Some(&Level::High));
        assert_eq!(writes.last(), Some(&Level::Low));
        // the stop may land inside a hold, leaving two lows at the end
        assert!(writes[..writes.len() - 1].windows(2).all(|w| w[0] != w[1]));
    }

    #[tokio::test]
    async fn test_queue_overflow_is_fatal() {
        let reader = reader_for(&[4]);
        let config = CollectorConfig {
            queue_capacity: 2,
            channel: ChannelConfig {
                poll_interval: Duration::from_millis(1),
                ..ChannelConfig::default()
            },
            drain_interval: Duration::from_millis(30),
            ..fast_config()
        };

        let collector = Collector::start(
            config,
            &[4],
            reader,
            RecordingGpio::default(),
            MemoryStore::default(),
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), collector.run(future::pending()))
            .await
            .unwrap();

        assert!(matches!(
            result,
            Err(CollectorError::ChannelFailed(ChannelError::QueueFull { pin: 4 }))
        ));
    }

    #[tokio::test]
    async fn test_persist_retries_failed_writes() {
        let reader = reader_for(&[4]);
        let store = MemoryStore::failing(2);

        let mut collector = Collector::start(
            CollectorConfig {
                power_pin: None,
                ..fast_config()
            },
            &[4],
            reader,
            RecordingGpio::default(),
            store.clone(),
        )
        .await
        .unwrap();

        let batch = collector.drain();
        assert!(!batch.is_empty());
        collector.persist(&batch);
        assert_eq!(store.batches(), [batch]);

        collector.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_leds_untouched_without_both_pins() {
        let reader = reader_for(&[4]);
        let gpio = RecordingGpio::default();

        let collector = Collector::start(
            CollectorConfig {
                power_pin: None,
                err_led_pin: None,
                ..fast_config()
            },
            &[4],
            reader,
            gpio.clone(),
            MemoryStore::default(),
        )
        .await
        .unwrap();
        collector.shutdown().unwrap();

        assert!(gpio.events().is_empty());
    }
}
