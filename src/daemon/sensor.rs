use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::util::config::{SensorConfig, SensorKindConfig};
use crate::util::logging::error;

/// One verdict from the activity classifier.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SensorReading {
    pub active: bool,
    pub confidence: f64,
}

/// Source of raw activity readings. Implementations own their transport and
/// release it on drop.
pub trait ActivitySensor: Send {
    fn sample(&mut self) -> Result<SensorReading>;
}

/// Polls the classifier sidecar over HTTP with a bounded request timeout.
pub struct HttpPollSensor {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpPollSensor {
    pub fn new(endpoint: &str, timeout_ms: u64) -> Result<Self> {
        reqwest::Url::parse(endpoint)
            .with_context(|| format!("invalid sensor endpoint: {endpoint}"))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()
            .context("failed to build sensor HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

impl ActivitySensor for HttpPollSensor {
    fn sample(&mut self) -> Result<SensorReading> {
        let reading = self
            .client
            .get(&self.endpoint)
            .send()
            .with_context(|| format!("sensor request to {} failed", self.endpoint))?
            .error_for_status()
            .context("sensor returned an error status")?
            .json::<SensorReading>()
            .context("sensor returned a malformed reading")?;
        Ok(reading)
    }
}

/// Sensor used when no classifier is configured. Every sample reads inactive,
/// so the machine reports STOP.
pub struct NullSensor;

impl ActivitySensor for NullSensor {
    fn sample(&mut self) -> Result<SensorReading> {
        Ok(SensorReading {
            active: false,
            confidence: 0.0,
        })
    }
}

/// Suppresses single-frame flicker: a sample only counts as active once
/// `required` consecutive readings clear the confidence floor.
#[derive(Debug)]
pub struct ConfirmationFilter {
    required: u32,
    min_confidence: f64,
    streak: u32,
}

impl ConfirmationFilter {
    pub fn new(required: u32, min_confidence: f64) -> Self {
        Self {
            required: required.max(1),
            min_confidence,
            streak: 0,
        }
    }

    /// Feed one reading; returns the confirmed activity verdict.
    pub fn observe(&mut self, reading: SensorReading) -> bool {
        if reading.active && reading.confidence >= self.min_confidence {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 0;
        }
        self.streak >= self.required
    }

    /// Drops any partial streak, e.g. when the shift window closes.
    pub fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Builds the sensor named by config. A bad endpoint is not fatal: the daemon
/// falls back to a null sensor and reports STOP until the config is fixed.
pub fn build_sensor(cfg: &SensorConfig) -> Box<dyn ActivitySensor> {
    match cfg.kind {
        SensorKindConfig::Http => match HttpPollSensor::new(&cfg.endpoint, cfg.timeout_ms) {
            Ok(sensor) => Box::new(sensor),
            Err(e) => {
                error!("sensor endpoint rejected, running without a sensor: {e:#}");
                Box::new(NullSensor)
            }
        },
        SensorKindConfig::None => Box::new(NullSensor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(active: bool, confidence: f64) -> SensorReading {
        SensorReading { active, confidence }
    }

    #[test]
    fn filter_requires_consecutive_active_frames() {
        let mut filter = ConfirmationFilter::new(3, 0.5);
        assert!(!filter.observe(reading(true, 0.9)));
        assert!(!filter.observe(reading(true, 0.9)));
        assert!(filter.observe(reading(true, 0.9)));
        // Stays confirmed while the streak holds.
        assert!(filter.observe(reading(true, 0.9)));
    }

    #[test]
    fn inactive_frame_resets_the_streak() {
        let mut filter = ConfirmationFilter::new(3, 0.5);
        filter.observe(reading(true, 0.9));
        filter.observe(reading(true, 0.9));
        assert!(!filter.observe(reading(false, 0.9)));
        assert!(!filter.observe(reading(true, 0.9)));
        assert!(!filter.observe(reading(true, 0.9)));
        assert!(filter.observe(reading(true, 0.9)));
    }

    #[test]
    fn low_confidence_counts_as_inactive() {
        let mut filter = ConfirmationFilter::new(2, 0.5);
        assert!(!filter.observe(reading(true, 0.49)));
        assert!(!filter.observe(reading(true, 0.9)));
        assert!(!filter.observe(reading(true, 0.49)));
        // The floor is inclusive.
        assert!(!filter.observe(reading(true, 0.5)));
        assert!(filter.observe(reading(true, 0.5)));
    }

    #[test]
    fn reset_clears_a_partial_streak() {
        let mut filter = ConfirmationFilter::new(2, 0.5);
        filter.observe(reading(true, 0.9));
        filter.reset();
        assert!(!filter.observe(reading(true, 0.9)));
        assert!(filter.observe(reading(true, 0.9)));
    }

    #[test]
    fn zero_required_frames_still_needs_one() {
        let mut filter = ConfirmationFilter::new(0, 0.5);
        assert!(filter.observe(reading(true, 0.9)));
        assert!(!filter.observe(reading(false, 0.0)));
    }

    #[test]
    fn null_sensor_always_reads_inactive() {
        let mut sensor = NullSensor;
        let r = sensor.sample().unwrap();
        assert!(!r.active);
        assert_eq!(r.confidence, 0.0);
    }
}
