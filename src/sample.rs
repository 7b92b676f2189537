use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub const PRETTY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub pin: u8,
    pub humidity: f64,
    pub temperature_f: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn local_time(&self, tz: &Tz) -> DateTime<Tz> {
        self.timestamp.with_timezone(tz)
    }

    pub fn pretty(&self, tz: &Tz) -> String {
        format!(
            "pin: {:2}, Tf: {:.1}, RH: {:.1}, time: {}",
            self.pin,
            self.temperature_f,
            self.humidity,
            self.local_time(tz).format(PRETTY_TIME_FORMAT)
        )
    }
}
