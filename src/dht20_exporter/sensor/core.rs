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

use std::error::Error;
use std::fmt::{self, Formatter};

use rppal::i2c::I2c;

/// Default I2C address of the DHT20 sensor.
pub const DEFAULT_ADDRESS: u16 = 0x38;

/// Default I2C bus of a Raspberry PI (`/dev/i2c-1`).
pub const DEFAULT_BUS: u8 = 1;

/// Error returned by a `BusConnection` implementation.
pub type BusError = Box<dyn Error + Send + Sync>;

/// Temperature, in degrees celsius
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct TemperatureCelsius(f64);

impl From<TemperatureCelsius> for f64 {
    fn from(v: TemperatureCelsius) -> Self {
        v.0
    }
}

impl From<f64> for TemperatureCelsius {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TemperatureCelsius {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}c", self.0)
    }
}

/// Relative humidity (from 0 to 100)
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct Humidity(f64);

impl From<Humidity> for f64 {
    fn from(v: Humidity) -> Self {
        v.0
    }
}

impl From<f64> for Humidity {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Humidity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Potential kinds of errors that can be encountered reading from the DHT20 sensor
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Initialization,
    InvalidState,
    Bus,
    Framing,
    Runtime,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Initialization => "initialization",
            SensorErrorKind::InvalidState => "invalid_state",
            SensorErrorKind::Bus => "bus",
            SensorErrorKind::Framing => "framing",
            SensorErrorKind::Runtime => "runtime",
        }
    }
}

/// Error initializing or reading the DHT20 sensor via an I2C bus
#[derive(Debug)]
pub enum SensorError {
    ShortRead(usize, usize),
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, BusError),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::ShortRead(_, _) => SensorErrorKind::Framing,
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::ShortRead(expected, got) => {
                write!(f, "short read: expected {} bytes, got {}", expected, got)
            }
            SensorError::KindMsg(_, msg) => msg.fmt(f),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// I2C bus number and slave address of a sensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusAddress {
    bus: u8,
    address: u16,
}

impl BusAddress {
    pub fn new(bus: u8, address: u16) -> Self {
        Self { bus, address }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn address(&self) -> u16 {
        self.address
    }
}

impl Default for BusAddress {
    fn default() -> Self {
        Self::new(DEFAULT_BUS, DEFAULT_ADDRESS)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "/dev/i2c-{}@{:#04x}", self.bus, self.address)
    }
}

/// Abstraction around an I2C device to allow for easier testing.
///
/// Implementations are addressed to a single device when created, all reads and
/// writes go to that device.
pub trait BusConnection {
    /// Read a single byte from the given register of the device.
    fn read_register(&mut self, register: u8) -> Result<u8, BusError>;

    /// Write raw bytes to the device, returning the number of bytes written.
    fn write_bytes(&mut self, payload: &[u8]) -> Result<usize, BusError>;

    /// Read raw bytes from the device into `buffer`, returning the number of bytes read.
    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, BusError>;

    /// Release the underlying device. Further calls to other methods will fail.
    fn close(&mut self) -> Result<(), BusError>;

    /// True if the connection has not been closed.
    fn is_open(&self) -> bool;
}

/// `BusConnection` backed by the Linux I2C interface of a Raspberry PI.
#[derive(Debug)]
pub struct I2cBus {
    i2c: Option<I2c>,
    address: BusAddress,
}

impl I2cBus {
    pub fn address(&self) -> BusAddress {
        self.address
    }

    fn device(&mut self) -> Result<&mut I2c, BusError> {
        let address = self.address;
        self.i2c
            .as_mut()
            .ok_or_else(|| format!("i2c bus {} is closed", address).into())
    }
}

impl BusConnection for I2cBus {
    fn read_register(&mut self, register: u8) -> Result<u8, BusError> {
        Ok(self.device()?.smbus_read_byte(register)?)
    }

    fn write_bytes(&mut self, payload: &[u8]) -> Result<usize, BusError> {
        Ok(self.device()?.write(payload)?)
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, BusError> {
        Ok(self.device()?.read(buffer)?)
    }

    fn close(&mut self) -> Result<(), BusError> {
        // The file descriptor for the bus is closed when the I2c instance is dropped
        self.i2c.take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.i2c.is_some()
    }
}

/// Open the I2C bus a sensor is connected to and select the sensor's address
/// for all following reads and writes.
///
/// The bus number corresponds to the device `/dev/i2c-N`. On a Raspberry PI the
/// I2C interface must be enabled (`raspi-config`) for this device to exist.
pub fn open_bus(address: BusAddress) -> Result<I2cBus, SensorError> {
    let mut i2c = I2c::with_bus(address.bus()).map_err(|e| {
        SensorError::KindMsgCause(SensorErrorKind::Initialization, "unable to open I2C bus", Box::new(e))
    })?;

    i2c.set_slave_address(address.address()).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to select I2C slave address",
            Box::new(e),
        )
    })?;

    Ok(I2cBus { i2c: Some(i2c), address })
}

#[cfg(test)]
mod test {
    use super::{BusAddress, SensorError, SensorErrorKind};
    use std::error::Error;
    use std::io;

    #[test]
    fn test_bus_address_default() {
        let addr = BusAddress::default();

        assert_eq!(1, addr.bus());
        assert_eq!(0x38, addr.address());
        assert_eq!("/dev/i2c-1@0x38", addr.to_string());
    }

    #[test]
    fn test_sensor_error_short_read() {
        let err = SensorError::ShortRead(7, 3);

        assert_eq!(SensorErrorKind::Framing, err.kind());
        assert_eq!("short read: expected 7 bytes, got 3", err.to_string());
        assert!(err.source().is_none());
    }

    #[test]
    fn test_sensor_error_with_cause() {
        let cause = io::Error::new(io::ErrorKind::Other, "nack");
        let err = SensorError::KindMsgCause(SensorErrorKind::Bus, "unable to read", Box::new(cause));

        assert_eq!(SensorErrorKind::Bus, err.kind());
        assert_eq!("unable to read: nack", err.to_string());
        assert!(err.source().is_some());
    }

    #[test]
    fn test_sensor_error_kind_labels() {
        assert_eq!("bus", SensorErrorKind::Bus.as_label());
        assert_eq!("framing", SensorErrorKind::Framing.as_label());
        assert_eq!("runtime", SensorErrorKind::Runtime.as_label());
    }
}
