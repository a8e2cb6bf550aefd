use std::fmt;
use std::time::Duration;

use sonar_fabric::Response;

/// Running totals for one host
#[derive(Debug, Default, Clone)]
pub struct HostStats {
    pub sent: u64,
    pub received: u64,
    min: Option<Duration>,
    max: Option<Duration>,
    total: Duration,
}

impl HostStats {
    pub fn record(&mut self, response: &Response) {
        self.sent += 1;
        if !response.is_success() {
            return;
        }
        let Some(rtt) = response.rtt() else {
            return;
        };

        self.received += 1;
        self.total += rtt;
        self.min = Some(self.min.map_or(rtt, |min| min.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |max| max.max(rtt)));
    }

    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        (self.sent - self.received) as f64 * 100.0 / self.sent as f64
    }

    pub fn average(&self) -> Option<Duration> {
        let received = u32::try_from(self.received).ok().filter(|n| *n > 0)?;
        Some(self.total / received)
    }
}

impl fmt::Display for HostStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} probes sent, {} received, {:.1}% loss",
            self.sent,
            self.received,
            self.loss_percent()
        )?;
        if let (Some(min), Some(avg), Some(max)) = (self.min, self.average(), self.max) {
            write!(
                f,
                ", rtt min/avg/max = {:.3}/{:.3}/{:.3} ms",
                millis(min),
                millis(avg),
                millis(max)
            )?;
        }
        Ok(())
    }
}

pub fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
