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

use clap::Parser;
use dht20_exporter::http::{http_route, RequestContext};
use dht20_exporter::metrics::{MetricsExposition, SensorMetrics};
use dht20_exporter::sampler::Sampler;
use dht20_exporter::sensor::{open_bus, BusAddress, DHT20Sensor, TimingProfile, DEFAULT_BUS};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use prometheus::process_collector::ProcessCollector;
use prometheus::Registry;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;
use std::{io, process};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::oneshot;
use tokio::task;
use tracing::{Instrument, Level};

const DEFAULT_REFRESH_SECS: u64 = 30;
const DEFAULT_INIT_DELAY_MS: u64 = 100;
const DEFAULT_TRIGGER_DELAY_MS: u64 = 10;
const DEFAULT_READY_DELAY_MS: u64 = 80;
const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 2112);

/// Expose humidity and temperature from a DHT20 sensor as Prometheus metrics
///
/// Read relative humidity and temperature from a DHT20 sensor connected to the I2C
/// bus of a local machine, usually a Raspberry PI, and expose them as Prometheus
/// metrics. Several other metrics are emitted as well to help diagnose failures
/// reading the sensor.
///
/// The sensor is read in the background at a fixed interval. If a read fails, the
/// metrics keep the values from the last successful read.
#[derive(Debug, Parser)]
#[clap(name = "dht20-exporter", version = clap::crate_version!())]
struct Dht20ExporterApplication {
    /// I2C bus number the sensor is connected to (the N in /dev/i2c-N)
    #[clap(long, default_value_t = DEFAULT_BUS)]
    bus: u8,

    /// I2C address of the sensor. Hex values must be prefixed with '0x'
    #[clap(long, default_value = "0x38", parse(try_from_str = parse_address))]
    address: u16,

    /// Read the sensor at this interval, in seconds (must be at least 1)
    #[clap(long, default_value_t = DEFAULT_REFRESH_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    refresh_secs: u64,

    /// Time to wait after power on before initializing the sensor, in milliseconds
    #[clap(long, default_value_t = DEFAULT_INIT_DELAY_MS)]
    init_delay_ms: u64,

    /// Time to wait before triggering each measurement, in milliseconds
    #[clap(long, default_value_t = DEFAULT_TRIGGER_DELAY_MS)]
    trigger_delay_ms: u64,

    /// Time to wait for a measurement to complete before reading it, in milliseconds
    #[clap(long, default_value_t = DEFAULT_READY_DELAY_MS)]
    ready_delay_ms: u64,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, dht20-exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

/// Parse an I2C address as hex (with a `0x` prefix) or decimal.
fn parse_address(s: &str) -> Result<u16, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = Dht20ExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let address = BusAddress::new(opts.bus, opts.address);
    let timing = TimingProfile::new(
        Duration::from_millis(opts.init_delay_ms),
        Duration::from_millis(opts.trigger_delay_ms),
        Duration::from_millis(opts.ready_delay_ms),
    );

    let bus = open_bus(address).unwrap_or_else(|e| {
        tracing::error!(message = "failed to open I2C bus", address = %address, error = %e);
        process::exit(1)
    });
    tracing::info!(message = "opened I2C bus", address = %bus.address());

    let sensor = DHT20Sensor::from_bus_with_timing(bus, timing).unwrap_or_else(|e| {
        tracing::error!(message = "failed to initialize sensor", address = %address, error = %e);
        process::exit(1)
    });

    let registry = Registry::new();
    let metrics = SensorMetrics::new(&registry)
        .and_then(|m| registry.register(Box::new(ProcessCollector::for_self())).map(|_| m))
        .unwrap_or_else(|e| {
            tracing::error!(message = "failed to register sensor metrics", error = %e);
            process::exit(1)
        });

    // Periodically read from the sensor and update metrics based on the readings
    // until the server is shutdown.
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let sampler = Sampler::new(sensor, metrics, Duration::from_secs(opts.refresh_secs));
    let sampler_task = task::spawn(async move {
        sampler
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
    });

    let context = Arc::new(RequestContext::new(MetricsExposition::new(registry)));
    let service = make_service_fn(move |_| {
        let context = context.clone();

        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                http_route(req, context.clone()).instrument(tracing::span!(Level::DEBUG, "http_request"))
            }))
        }
    });

    let server = Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error starting server", address = %opts.bind, err = %e);
        process::exit(1)
    });

    tracing::info!(message = "starting server", address = %opts.bind, sensor = %address);

    server
        .serve(service)
        .with_graceful_shutdown(async move {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }

            let _ = stop_tx.send(());
        })
        .await?;

    sampler_task.await?;
    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
