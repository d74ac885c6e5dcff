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

use crate::sensor::core::{BusConnection, Humidity, SensorError, SensorErrorKind, TemperatureCelsius};
use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::Duration;

pub(crate) const INIT_STATUS_REGISTER: u8 = 0x71;
pub(crate) const TRIGGER_MEASUREMENT: [u8; 4] = [0x00, 0xAC, 0x33, 0x00];
pub(crate) const FRAME_SIZE: usize = 7;

/// Humidity and temperature are both 20-bit fractions of their full range.
pub(crate) const FRACTION_SCALE: f64 = 1_048_576.0;

const DEFAULT_INIT_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_TRIGGER_DELAY: Duration = Duration::from_millis(10);
const DEFAULT_READY_DELAY: Duration = Duration::from_millis(80);

/// How long to wait for the sensor at each step of initialization and measurement.
///
/// The DHT20 doesn't expose a "ready" signal so the only way to know a step has
/// completed is to wait long enough. Defaults are based on the datasheet:
///
/// * `init` - Time after power on before the status register may be read.
/// * `trigger` - Time to wait before sending the measurement command.
/// * `ready` - Time for the sensor to complete a measurement after the command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimingProfile {
    init: Duration,
    trigger: Duration,
    ready: Duration,
}

impl TimingProfile {
    pub fn new(init: Duration, trigger: Duration, ready: Duration) -> Self {
        Self { init, trigger, ready }
    }

    pub fn init_delay(&self) -> Duration {
        self.init
    }

    pub fn trigger_delay(&self) -> Duration {
        self.trigger
    }

    pub fn ready_delay(&self) -> Duration {
        self.ready
    }
}

impl Default for TimingProfile {
    fn default() -> Self {
        Self::new(DEFAULT_INIT_DELAY, DEFAULT_TRIGGER_DELAY, DEFAULT_READY_DELAY)
    }
}

/// Bytes read from the sensor after a measurement has been triggered.
///
/// The first byte is the status of the sensor, the next five contain humidity and
/// temperature as packed 20-bit values, and the last is a CRC (unused). Humidity
/// uses the high nibble of the fourth byte and temperature uses the low nibble.
#[derive(Debug)]
struct RawFrame {
    bytes: [u8; FRAME_SIZE],
}

impl RawFrame {
    /// Read a complete frame from the bus. Reads of fewer bytes than a full frame
    /// are an error, the data isn't decoded in that case.
    fn from_bus(bus: &mut dyn BusConnection) -> Result<Self, SensorError> {
        let mut bytes = [0; FRAME_SIZE];
        let read = bus.read_bytes(&mut bytes).map_err(|e| {
            SensorError::KindMsgCause(SensorErrorKind::Bus, "unable to read measurement data", e)
        })?;

        if read != FRAME_SIZE {
            return Err(SensorError::ShortRead(FRAME_SIZE, read));
        }

        tracing::trace!(message = "read measurement frame", bytes = ?bytes);
        Ok(Self { bytes })
    }

    fn status(&self) -> u8 {
        self.bytes[0]
    }

    fn humidity_raw(&self) -> u32 {
        (self.bytes[1] as u32) << 12 | (self.bytes[2] as u32) << 4 | (self.bytes[3] as u32 & 0xF0) >> 4
    }

    fn temperature_raw(&self) -> u32 {
        (self.bytes[3] as u32 & 0x0F) << 16 | (self.bytes[4] as u32) << 8 | self.bytes[5] as u32
    }
}

impl From<RawFrame> for (Humidity, TemperatureCelsius) {
    /// Convert the raw 20-bit values of a frame into relative humidity and temperature.
    ///
    /// Values are not clamped. Given the size of the fields, humidity is always in the
    /// range `[0, 100)` and temperature in the range `[-50, 150)`.
    fn from(frame: RawFrame) -> Self {
        let humidity_raw = frame.humidity_raw();
        let temp_raw = frame.temperature_raw();

        let humidity = Humidity::from(humidity_raw as f64 / FRACTION_SCALE * 100.0);
        let temperature = TemperatureCelsius::from(temp_raw as f64 / FRACTION_SCALE * 200.0 - 50.0);

        tracing::debug!(
            message = "parsed sensor data",
            status = frame.status(),
            raw_temperature = temp_raw,
            raw_humidity = humidity_raw,
            temperature = %temperature,
            humidity = %humidity
        );

        (humidity, temperature)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
    Closed,
}

/// Read relative humidity and temperature in degrees celsius from a DHT20 sensor
pub struct DHT20Sensor {
    bus: Box<dyn BusConnection + Send + 'static>,
    timing: TimingProfile,
    state: State,
}

impl DHT20Sensor {
    /// Create a new sensor using default timings, initializing it over the provided bus.
    ///
    /// The bus is closed if initialization fails and must not be used by the caller
    /// afterwards.
    pub fn from_bus<T>(bus: T) -> Result<Self, SensorError>
    where
        T: BusConnection + Send + 'static,
    {
        Self::from_bus_with_timing(bus, TimingProfile::default())
    }

    /// Create a new sensor using the given timings, initializing it over the provided bus.
    ///
    /// The bus is closed if initialization fails and must not be used by the caller
    /// afterwards.
    pub fn from_bus_with_timing<T>(bus: T, timing: TimingProfile) -> Result<Self, SensorError>
    where
        T: BusConnection + Send + 'static,
    {
        let mut sensor = Self {
            bus: Box::new(bus),
            timing,
            state: State::Uninitialized,
        };

        if !sensor.bus.is_open() {
            // Nothing to release, don't close the bus again when dropped
            sensor.state = State::Closed;
            return Err(SensorError::KindMsg(
                SensorErrorKind::InvalidState,
                "I2C bus connection is not open",
            ));
        }

        if let Err(e) = sensor.init() {
            sensor.close();
            return Err(e);
        }

        sensor.state = State::Ready;
        Ok(sensor)
    }

    fn init(&mut self) -> Result<(), SensorError> {
        thread::sleep(self.timing.init_delay());
        let status = self.bus.read_register(INIT_STATUS_REGISTER).map_err(|e| {
            SensorError::KindMsgCause(SensorErrorKind::Initialization, "unable to read sensor status", e)
        })?;

        tracing::debug!(message = "initialized sensor", status = status);
        Ok(())
    }

    fn trigger_measurement(&mut self) -> Result<(), SensorError> {
        thread::sleep(self.timing.trigger_delay());
        let written = self.bus.write_bytes(&TRIGGER_MEASUREMENT).map_err(|e| {
            SensorError::KindMsgCause(SensorErrorKind::Bus, "unable to trigger measurement", e)
        })?;

        if written != TRIGGER_MEASUREMENT.len() {
            return Err(SensorError::KindMsg(
                SensorErrorKind::Bus,
                "short write of measurement command",
            ));
        }

        Ok(())
    }

    /// Trigger a measurement and read relative humidity and temperature from the sensor
    /// or return an error if the read failed with details about what caused the read to
    /// fail.
    ///
    /// This method blocks for the `trigger` and `ready` delays of the timing profile in
    /// addition to any time spent waiting on the bus. Failed reads are not retried.
    pub fn measure(&mut self) -> Result<(Humidity, TemperatureCelsius), SensorError> {
        if self.state != State::Ready {
            return Err(SensorError::KindMsg(SensorErrorKind::InvalidState, "sensor is closed"));
        }

        self.trigger_measurement()?;
        thread::sleep(self.timing.ready_delay());
        let frame = RawFrame::from_bus(self.bus.as_mut())?;
        Ok(frame.into())
    }

    /// Release the underlying bus. Calling this more than once has no effect.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }

        self.state = State::Closed;
        if let Err(e) = self.bus.close() {
            tracing::warn!(message = "error closing I2C bus", error = %e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn timing(&self) -> TimingProfile {
        self.timing
    }
}

impl Drop for DHT20Sensor {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for DHT20Sensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DHT20Sensor")
            .field("timing", &self.timing)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{DHT20Sensor, RawFrame, TimingProfile, FRAME_SIZE, TRIGGER_MEASUREMENT};
    use crate::sensor::core::{Humidity, SensorError, SensorErrorKind, TemperatureCelsius};
    use crate::sensor::test::{encode_frame, MockBus};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn no_delay() -> TimingProfile {
        TimingProfile::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn test_timing_profile_default() {
        let timing = TimingProfile::default();

        assert_eq!(Duration::from_millis(100), timing.init_delay());
        assert_eq!(Duration::from_millis(10), timing.trigger_delay());
        assert_eq!(Duration::from_millis(80), timing.ready_delay());
    }

    #[test]
    fn test_raw_frame_fields() {
        let frame = RawFrame {
            bytes: [0x1C, 0x12, 0x34, 0x5A, 0xBC, 0xDE, 0xFF],
        };

        assert_eq!(0x1C, frame.status());
        assert_eq!(0x12345, frame.humidity_raw());
        assert_eq!(0xABCDE, frame.temperature_raw());
    }

    #[test]
    fn test_raw_frame_into_midpoint() {
        // Half of the 20-bit range for both fields
        let frame = RawFrame {
            bytes: [0x1C, 0x80, 0x00, 0x08, 0x00, 0x00, 0x00],
        };

        let (h, t): (Humidity, TemperatureCelsius) = frame.into();

        assert_eq!(Humidity::from(50.0), h);
        assert_eq!(TemperatureCelsius::from(50.0), t);
    }

    #[test]
    fn test_raw_frame_into_extremes() {
        let (h, t): (Humidity, TemperatureCelsius) = RawFrame { bytes: [0; FRAME_SIZE] }.into();
        assert_eq!(Humidity::from(0.0), h);
        assert_eq!(TemperatureCelsius::from(-50.0), t);

        let (h, t): (Humidity, TemperatureCelsius) = RawFrame {
            bytes: [0xFF; FRAME_SIZE],
        }
        .into();
        assert!(f64::from(h) < 100.0 && f64::from(h) > 99.99);
        assert!(f64::from(t) < 150.0 && f64::from(t) > 149.99);
    }

    #[test]
    fn test_raw_frame_round_trip() {
        for &(humidity, temperature) in &[(0.0, -50.0), (12.5, -10.0), (55.5, 22.25), (99.9, 85.0)] {
            let (h, t): (Humidity, TemperatureCelsius) = RawFrame {
                bytes: encode_frame(humidity, temperature),
            }
            .into();

            assert!((f64::from(h) - humidity).abs() <= 0.01, "humidity {} != {}", h, humidity);
            assert!((f64::from(t) - temperature).abs() <= 0.01, "temperature {} != {}", t, temperature);
        }
    }

    #[test]
    fn test_dht20_sensor_measure_valid() {
        let bus = MockBus::new(&encode_frame(55.5, 22.25));
        let state = bus.state();
        let mut sensor = DHT20Sensor::from_bus_with_timing(bus, no_delay()).unwrap();

        let (h, t) = sensor.measure().unwrap();

        assert!((f64::from(h) - 55.5).abs() <= 0.01);
        assert!((f64::from(t) - 22.25).abs() <= 0.01);
        assert_eq!(1, state.register_reads.load(Ordering::SeqCst));
        assert_eq!(1, state.writes.load(Ordering::SeqCst));
        assert_eq!(TRIGGER_MEASUREMENT.to_vec(), *state.last_write.lock().unwrap());
    }

    #[test]
    fn test_dht20_sensor_measure_repeated() {
        let bus = MockBus::new(&encode_frame(40.0, 18.0));
        let state = bus.state();
        let mut sensor = DHT20Sensor::from_bus_with_timing(bus, no_delay()).unwrap();

        for _ in 0..3 {
            assert!(sensor.measure().is_ok());
        }

        assert_eq!(1, state.register_reads.load(Ordering::SeqCst));
        assert_eq!(3, state.writes.load(Ordering::SeqCst));
        assert_eq!(3, state.reads.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dht20_sensor_from_bus_default_timing() {
        let sensor = DHT20Sensor::from_bus(MockBus::new(&encode_frame(55.5, 22.25))).unwrap();

        assert_eq!(TimingProfile::default(), sensor.timing());
        assert!(!sensor.is_closed());
    }

    #[test]
    fn test_dht20_sensor_timing_does_not_change_decode() {
        let frame = encode_frame(63.2, -4.75);
        let mut fast = DHT20Sensor::from_bus_with_timing(MockBus::new(&frame), no_delay()).unwrap();
        let mut slow = DHT20Sensor::from_bus_with_timing(
            MockBus::new(&frame),
            TimingProfile::new(Duration::from_millis(1), Duration::from_millis(2), Duration::from_millis(3)),
        )
        .unwrap();

        assert_eq!(fast.measure().unwrap(), slow.measure().unwrap());
    }

    #[test]
    fn test_dht20_sensor_init_failure_closes_bus() {
        let bus = MockBus::new(&encode_frame(55.5, 22.25));
        let state = bus.state();
        state.fail_register.store(true, Ordering::SeqCst);

        let res = DHT20Sensor::from_bus_with_timing(bus, no_delay());

        assert!(res.is_err());
        assert_eq!(SensorErrorKind::Initialization, res.unwrap_err().kind());
        assert_eq!(1, state.closes.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dht20_sensor_closed_bus() {
        let bus = MockBus::new(&encode_frame(55.5, 22.25)).closed();
        let state = bus.state();

        let res = DHT20Sensor::from_bus_with_timing(bus, no_delay());

        assert!(res.is_err());
        assert_eq!(SensorErrorKind::InvalidState, res.unwrap_err().kind());
        assert_eq!(0, state.register_reads.load(Ordering::SeqCst));
        assert_eq!(0, state.closes.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dht20_sensor_measure_write_error() {
        let bus = MockBus::new(&encode_frame(55.5, 22.25));
        let state = bus.state();
        let mut sensor = DHT20Sensor::from_bus_with_timing(bus, no_delay()).unwrap();
        state.fail_write.store(true, Ordering::SeqCst);

        let res = sensor.measure();

        assert!(res.is_err());
        assert_eq!(SensorErrorKind::Bus, res.unwrap_err().kind());
        assert_eq!(0, state.reads.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dht20_sensor_measure_read_error() {
        let bus = MockBus::new(&encode_frame(55.5, 22.25));
        let state = bus.state();
        let mut sensor = DHT20Sensor::from_bus_with_timing(bus, no_delay()).unwrap();
        state.fail_read.store(true, Ordering::SeqCst);

        let res = sensor.measure();

        assert!(res.is_err());
        assert_eq!(SensorErrorKind::Bus, res.unwrap_err().kind());
    }

    #[test]
    fn test_dht20_sensor_measure_short_read() {
        let frame = encode_frame(55.5, 22.25);
        let bus = MockBus::new(&frame[..4]);
        let mut sensor = DHT20Sensor::from_bus_with_timing(bus, no_delay()).unwrap();

        match sensor.measure() {
            Err(SensorError::ShortRead(expected, got)) => {
                assert_eq!(FRAME_SIZE, expected);
                assert_eq!(4, got);
            }
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_dht20_sensor_close_idempotent() {
        let bus = MockBus::new(&encode_frame(55.5, 22.25));
        let state = bus.state();
        let mut sensor = DHT20Sensor::from_bus_with_timing(bus, no_delay()).unwrap();

        sensor.close();
        sensor.close();
        drop(sensor);

        assert_eq!(1, state.closes.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dht20_sensor_drop_closes_bus() {
        let bus = MockBus::new(&encode_frame(55.5, 22.25));
        let state = bus.state();
        let sensor = DHT20Sensor::from_bus_with_timing(bus, no_delay()).unwrap();

        drop(sensor);

        assert_eq!(1, state.closes.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dht20_sensor_measure_after_close() {
        let bus = MockBus::new(&encode_frame(55.5, 22.25));
        let state = bus.state();
        let mut sensor = DHT20Sensor::from_bus_with_timing(bus, no_delay()).unwrap();
        sensor.close();

        let res = sensor.measure();

        assert!(sensor.is_closed());
        assert!(res.is_err());
        assert_eq!(SensorErrorKind::InvalidState, res.unwrap_err().kind());
        assert_eq!(0, state.writes.load(Ordering::SeqCst));
    }
}
