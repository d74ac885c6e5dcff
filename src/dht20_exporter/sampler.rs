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

use crate::metrics::SensorMetrics;
use crate::sensor::{DHT20Sensor, SensorError, SensorErrorKind};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Level};

/// Shortest interval between reads, used in place of a zero interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically read the sensor and update metrics based on the readings.
///
/// Reads happen in the background, *not* in response to scrapes. Failed reads are
/// logged and counted but otherwise ignored, metrics keep the values from the last
/// successful read.
pub struct Sampler {
    sensor: Arc<Mutex<DHT20Sensor>>,
    metrics: SensorMetrics,
    interval: Duration,
}

impl Sampler {
    /// Create a new sampler that reads `sensor` every `interval`. A zero interval is
    /// replaced with `MIN_INTERVAL`.
    pub fn new(sensor: DHT20Sensor, metrics: SensorMetrics, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            tracing::warn!(message = "zero sampling interval, using minimum", interval = ?MIN_INTERVAL);
            MIN_INTERVAL
        } else {
            interval
        };

        Sampler {
            sensor: Arc::new(Mutex::new(sensor)),
            metrics,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Read the sensor once and update metrics with the result.
    ///
    /// Reading the sensor blocks for at least the settle delays of its timing profile
    /// so it is done on a thread dedicated to blocking operations.
    pub async fn poll_once(&self) {
        let sensor_ref = self.sensor.clone();

        let res = task::spawn_blocking(move || {
            // A read that panicked leaves the sensor closed or ready, both are safe to use
            let mut s = sensor_ref.lock().unwrap_or_else(PoisonError::into_inner);
            s.measure()
        })
        .instrument(tracing::span!(Level::DEBUG, "sensor_read"))
        .await
        .unwrap_or_else(|e| {
            Err(SensorError::KindMsgCause(
                SensorErrorKind::Runtime,
                "sensor read task did not complete",
                Box::new(e),
            ))
        });

        self.metrics.update(res);
    }

    /// Read the sensor immediately and then once every interval until `shutdown`
    /// completes.
    ///
    /// Shutdown is only checked between reads, a read that has already started is
    /// allowed to finish. If a read takes longer than the interval, missed ticks are
    /// skipped instead of being run back-to-back.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick of an interval completes immediately
        interval.tick().await;
        self.poll_once().await;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!(message = "stopping sensor sampler");
                    break;
                }
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }
}
