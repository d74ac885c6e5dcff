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

//! Export DHT20 temperature and humidity sensor readings as Prometheus metrics.
//!
//! ## Features
//!
//! `dht20-exporter` reads relative humidity and temperature from a DHT20 sensor connected
//! over I2C and exports the values as Prometheus metrics. It is best run on a Raspberry PI.
//!
//! The following metrics are exported:
//!
//! * `sensor_humidity` - Relative humidity (from 0 to 100) measured by the sensor.
//! * `sensor_temperature` - Degrees celsius measured by the sensor.
//! * `sensor_last_read_timestamp` - UNIX timestamp of the last time the sensor was correctly read.
//! * `sensor_collections_total` - Total number of attempts to read the sensor.
//! * `sensor_errors_total` - Total errors by type while trying to read the sensor.
//!
//! ## Build
//!
//! `dht20-exporter` must be built from source using a [Rust toolchain](https://rustup.rs/).
//! To cross-compile it for a Raspberry PI from Ubuntu GNU/Linux, install a linker and a
//! Rust target for ARMv7.
//!
//! ```text
//! apt-get install gcc-arm-linux-gnueabihf musl-tools
//! rustup target add armv7-unknown-linux-musleabihf
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Install
//!
//! ### I2C
//!
//! The I2C interface of the Raspberry PI must be enabled (`sudo raspi-config`, under
//! "Interface Options"). The DHT20 uses address `0x38` on bus `1` (`/dev/i2c-1`) by
//! default. Use `--bus` and `--address` if your wiring is different.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `2112` at `/metrics`.
//!
//! **NOTE**: The sensor is read every `30s` by default, in the background (*not* in
//! response to Prometheus scrapes). Scrapes more frequent than that don't have any
//! benefit unless `--refresh-secs` is adjusted as well. If a read fails, the metrics
//! keep the values of the last successful read.
//!
//! ```yaml
//! scrape_configs:
//!   - job_name: dht20
//!     static_configs:
//!       - targets: ['example:2112']
//! ```
//!

pub mod http;
pub mod metrics;
pub mod sampler;
pub mod sensor;
