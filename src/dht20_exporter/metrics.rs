// dht20-exporter - Temperature and humidity metrics exporter for Prometheus
//
// Copyright 2021-2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::sensor::{Humidity, SensorError, TemperatureCelsius};
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::error::Error;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Collection of Prometheus metrics updated based on DHT20 sensor humidity and
/// temperature readings. Relative humidity and temperature in degrees celsius will
/// be emitted as gauges.
///
/// Gauges keep the value of the last successful reading when a read fails.
#[derive(Clone)]
pub struct SensorMetrics {
    humidity: Gauge,
    temperature: Gauge,
    last_reading: Gauge,
    collections: Counter,
    errors: CounterVec,
}

impl SensorMetrics {
    pub fn new(reg: &Registry) -> Result<Self, prometheus::Error> {
        let humidity = Gauge::new("sensor_humidity", "Humidity of a sensor in %RH.")?;
        let temperature = Gauge::new("sensor_temperature", "Temperature of a sensor in degrees celsius.")?;
        let last_reading = Gauge::new("sensor_last_read_timestamp", "Timestamp of last successful read")?;
        let collections = Counter::new("sensor_collections_total", "Number of attempted reads")?;
        let errors = CounterVec::new(
            Opts::new("sensor_errors_total", "Number of failed reads by type"),
            &["kind"],
        )?;

        reg.register(Box::new(humidity.clone()))?;
        reg.register(Box::new(temperature.clone()))?;
        reg.register(Box::new(last_reading.clone()))?;
        reg.register(Box::new(collections.clone()))?;
        reg.register(Box::new(errors.clone()))?;

        Ok(Self {
            humidity,
            temperature,
            last_reading,
            collections,
            errors,
        })
    }

    pub fn update(&self, result: Result<(Humidity, TemperatureCelsius), SensorError>) {
        self.collections.inc();

        match result {
            Ok((humidity, temp)) => {
                self.humidity.set(humidity.into());
                self.temperature.set(temp.into());

                // If we can't get the number of seconds since the epoch, skip the update
                let _ = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| self.last_reading.set(d.as_secs_f64()));
            }
            Err(e) => {
                self.errors.with_label_values(&[e.kind().as_label()]).inc();
                tracing::error!(message = "unable to read sensor for metric collection", error = %e);
            }
        };
    }

    /// Relative humidity from the most recent successful read.
    pub fn humidity(&self) -> Humidity {
        Humidity::from(self.humidity.get())
    }

    /// Temperature from the most recent successful read.
    pub fn temperature(&self) -> TemperatureCelsius {
        TemperatureCelsius::from(self.temperature.get())
    }
}

/// Error exposing Prometheus metrics in the text exposition format.
#[derive(Debug)]
pub enum ExpositionError {
    Encoding(&'static str, Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Encoding(msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExpositionError::Encoding(_, ref e) => Some(e.as_ref()),
        }
    }
}

/// Wrapper that exposes metrics from a Prometheus registry in the text exposition format.
///
/// Gathering doesn't touch the sensor, it only reads the values of gauges and counters
/// set by the background sampler. It's safe to call from the HTTP request path.
#[derive(Debug)]
pub struct MetricsExposition {
    registry: Registry,
}

impl MetricsExposition {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Collect all metrics from the registry and encode them in the Prometheus text exposition
    /// format, returning an error if metrics couldn't be encoded for some reason.
    pub fn encoded_text(&self) -> Result<Vec<u8>, ExpositionError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        tracing::debug!(
            message = "encoding metric families to text exposition format",
            num_metrics = metric_families.len(),
        );

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| ExpositionError::Encoding("unable to encode Prometheus metrics", Box::new(e)))
            .map(|_| buffer)
    }
}
