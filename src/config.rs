use std::time::Duration;

use chrono_tz::Tz;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_DELAY: Duration = Duration::from_millis(1);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MIN_HISTORY: usize = 10;
pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 25.0;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_POWER_SETTLE: Duration = Duration::from_secs(5);
pub const DEFAULT_POWER_OFF_HOLD: Duration = Duration::from_secs(30);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READY_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POWER_CYCLE_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Target time between the starts of two reads.
    pub poll_interval: Duration,
    /// Start pulse handed to the bit capture routine.
    pub read_delay: Duration,
    pub retention: Duration,
    pub min_history: usize,
    pub outlier_threshold: f64,
    /// Used when rendering timestamps in logs.
    pub timezone: Tz,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_delay: DEFAULT_READ_DELAY,
            retention: DEFAULT_RETENTION,
            min_history: DEFAULT_MIN_HISTORY,
            outlier_threshold: DEFAULT_OUTLIER_THRESHOLD,
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub channel: ChannelConfig,
    pub queue_capacity: usize,
    pub power_pin: Option<u8>,
    pub ok_led_pin: Option<u8>,
    pub err_led_pin: Option<u8>,
    /// Wait after powering the sensors up.
    pub power_settle: Duration,
    /// How long the rail stays off during a power cycle.
    pub power_off_hold: Duration,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    pub drain_interval: Duration,
    pub power_cycle_interval: Duration,
    pub status_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            power_pin: None,
            ok_led_pin: None,
            err_led_pin: None,
            power_settle: DEFAULT_POWER_SETTLE,
            power_off_hold: DEFAULT_POWER_OFF_HOLD,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            ready_poll: DEFAULT_READY_POLL,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            power_cycle_interval: DEFAULT_POWER_CYCLE_INTERVAL,
            status_interval: DEFAULT_STATUS_INTERVAL,
        }
    }
}
