use crate::model::{Alert, AlertSeverity, TelemetryReading};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Normal and critical operating band for one physical quantity.
///
/// A value at or beyond `min`/`max` raises a warning, at or beyond
/// `critical_min`/`critical_max` a critical alert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub min: f64,
    pub max: f64,
    pub critical_min: f64,
    pub critical_max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64, critical_min: f64, critical_max: f64) -> Self {
        Self {
            min,
            max,
            critical_min,
            critical_max,
        }
    }

    fn classify(&self, value: f64) -> Option<(AlertSeverity, Direction)> {
        let direction = if value <= self.min {
            Direction::Low
        } else if value >= self.max {
            Direction::High
        } else {
            return None;
        };

        if value <= self.critical_min || value >= self.critical_max {
            Some((AlertSeverity::Critical, direction))
        } else {
            Some((AlertSeverity::Warning, direction))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub temperature: Band,
    pub humidity: Band,
    pub pressure: Band,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature: Band::new(18.0, 28.0, 15.0, 35.0),
            humidity: Band::new(40.0, 80.0, 30.0, 90.0),
            pressure: Band::new(995.0, 1015.0, 980.0, 1030.0),
        }
    }
}

/// Turns readings into alerts, suppressing repeats of the same condition
/// for a device within the cooldown window.
#[derive(Debug)]
pub struct AlertEvaluator {
    thresholds: Thresholds,
    cooldown: Duration,
    last_raised: HashMap<(String, String, AlertSeverity), DateTime<Utc>>,
}

impl AlertEvaluator {
    pub fn new(thresholds: Thresholds, cooldown: Duration) -> Self {
        Self {
            thresholds,
            cooldown,
            last_raised: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, reading: &TelemetryReading) -> Vec<Alert> {
        let checks = [
            ("temperature", "°C", reading.temperature, self.thresholds.temperature),
            ("humidity", "%", reading.humidity, self.thresholds.humidity),
            ("pressure", "hPa", reading.pressure, self.thresholds.pressure),
        ];

        let mut alerts = Vec::new();
        for (metric, unit, value, band) in checks {
            let Some((severity, direction)) = band.classify(value) else {
                continue;
            };

            let alert_type = match direction {
                Direction::Low => format!("{}_low", metric),
                Direction::High => format!("{}_high", metric),
            };

            let key = (reading.device_id.clone(), alert_type.clone(), severity);
            if let Some(last) = self.last_raised.get(&key) {
                if reading.observed_at - *last < self.cooldown {
                    continue;
                }
            }
            self.last_raised.insert(key, reading.observed_at);

            let message = match severity {
                AlertSeverity::Critical => {
                    format!("{} in critical range: {}{}", metric, value, unit)
                }
                AlertSeverity::Warning => {
                    format!("{} outside normal range: {}{}", metric, value, unit)
                }
            };

            alerts.push(Alert {
                device_id: reading.device_id.clone(),
                alert_type,
                message,
                severity,
                timestamp: reading.observed_at,
            });
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(at_secs: i64, temperature: f64, humidity: f64, pressure: f64) -> TelemetryReading {
        TelemetryReading {
            device_id: "dev-1".to_string(),
            observed_at: Utc.timestamp_opt(1_700_000_000 + at_secs, 0).unwrap(),
            temperature,
            humidity,
            pressure,
            firmware_version: None,
        }
    }

    fn evaluator() -> AlertEvaluator {
        AlertEvaluator::new(Thresholds::default(), Duration::seconds(60))
    }

    #[test]
    fn test_normal_reading_raises_nothing() {
        assert!(evaluator().evaluate(&reading(0, 22.5, 55.0, 1008.0)).is_empty());
    }

    #[test]
    fn test_warning_and_critical() {
        let alerts = evaluator().evaluate(&reading(0, 29.0, 95.0, 1008.0));

        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, "temperature_high");
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[1].alert_type, "humidity_high");
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
        assert!(alerts[1].message.contains("critical range"));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let alerts = evaluator().evaluate(&reading(0, 18.0, 55.0, 980.0));

        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, "temperature_low");
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[1].alert_type, "pressure_low");
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let mut evaluator = evaluator();

        assert_eq!(evaluator.evaluate(&reading(0, 30.0, 55.0, 1008.0)).len(), 1);
        assert!(evaluator.evaluate(&reading(30, 30.5, 55.0, 1008.0)).is_empty());
        assert_eq!(evaluator.evaluate(&reading(61, 30.0, 55.0, 1008.0)).len(), 1);
    }

    #[test]
    fn test_escalation_is_not_suppressed() {
        let mut evaluator = evaluator();

        assert_eq!(evaluator.evaluate(&reading(0, 30.0, 55.0, 1008.0)).len(), 1);
        let escalated = evaluator.evaluate(&reading(5, 36.0, 55.0, 1008.0));
        assert_eq!(escalated.len(), 1);
        assert_eq!(escalated[0].severity, AlertSeverity::Critical);
    }
}
