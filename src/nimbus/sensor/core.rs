// Nimbus - Environmental sensor metrics publisher for Cloud Monitoring
//
// Copyright 2022 Nick Pillitteri
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

use crate::catalog::{GAS_INDEX, GAS_RESISTANCE, HEAT_STABLE, HUMIDITY, MEAS_INDEX, PRESSURE, TEMPERATURE};
use std::error::Error;
use std::fmt::{self, Formatter};

use rppal::i2c::I2c;

/// Values from a single measurement of the sensor.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SensorSample {
    /// Degrees celsius
    pub temperature: f64,
    /// Hectopascals
    pub pressure: f64,
    /// Relative humidity (from 0 to 100)
    pub humidity: f64,
    /// Ohms
    pub gas_resistance: f64,
    pub gas_index: u8,
    pub meas_index: u8,
    pub heat_stable: bool,
}

impl SensorSample {
    /// Every value of the sample paired with the ID of the metric it is published as.
    pub fn fields(&self) -> [(&'static str, f64); 7] {
        [
            (TEMPERATURE, self.temperature),
            (PRESSURE, self.pressure),
            (HUMIDITY, self.humidity),
            (GAS_RESISTANCE, self.gas_resistance),
            (GAS_INDEX, f64::from(self.gas_index)),
            (MEAS_INDEX, f64::from(self.meas_index)),
            (HEAT_STABLE, if self.heat_stable { 1.0 } else { 0.0 }),
        ]
    }
}

impl fmt::Display for SensorSample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}c {:.2}hPa {:.2}% {:.0}ohm",
            self.temperature, self.pressure, self.humidity, self.gas_resistance
        )
    }
}

/// Potential kinds of errors that can be encountered reading from the BME680 sensor
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Initialization,
    ChipId,
    Io,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Initialization => "initialization",
            SensorErrorKind::ChipId => "chip_id",
            SensorErrorKind::Io => "io",
        }
    }
}

/// Error initializing or reading the BME680 sensor via the I2C bus
#[derive(Debug)]
pub enum SensorError {
    ChipId(u8, u8),
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::ChipId(_, _) => SensorErrorKind::ChipId,
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::ChipId(expected, got) => {
                write!(f, "unexpected chip id: expected {:#04x}, got {:#04x}", expected, got)
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

/// Open the I2C bus and address the device at `address`.
///
/// Nothing is read or written, so this succeeds even if no device is present.
pub fn open_bus(address: u8) -> Result<I2c, SensorError> {
    let mut bus = I2c::new().map_err(|e| {
        SensorError::KindMsgCause(SensorErrorKind::Initialization, "unable to open I2C bus", Box::new(e))
    })?;

    bus.set_slave_address(u16::from(address)).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to set I2C slave address",
            Box::new(e),
        )
    })?;

    Ok(bus)
}

/// Abstraction around an `rppal::i2c::I2c` to allow for easier testing.
pub trait RegisterBus {
    /// Read consecutive registers starting at `register` to fill `buf`.
    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<(), SensorError>;

    /// Write a single register.
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError>;

    fn read_register(&mut self, register: u8) -> Result<u8, SensorError> {
        let mut buf = [0; 1];
        self.read_registers(register, &mut buf)?;
        Ok(buf[0])
    }
}

impl RegisterBus for I2c {
    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        self.write_read(&[register], buf)
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Io, "unable to read registers", Box::new(e)))
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        self.smbus_write_byte(register, value)
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Io, "unable to write register", Box::new(e)))
    }
}

#[cfg(test)]
mod test {
    use super::{SensorError, SensorErrorKind, SensorSample};

    #[test]
    fn test_sample_fields() {
        let sample = SensorSample {
            temperature: 21.5,
            pressure: 1013.25,
            humidity: 60.2,
            gas_resistance: 120_000.0,
            gas_index: 0,
            meas_index: 3,
            heat_stable: true,
        };

        let fields = sample.fields();
        assert_eq!(("temperature", 21.5), fields[0]);
        assert_eq!(("pressure", 1013.25), fields[1]);
        assert_eq!(("humidity", 60.2), fields[2]);
        assert_eq!(("gas_resistance", 120_000.0), fields[3]);
        assert_eq!(("gas_index", 0.0), fields[4]);
        assert_eq!(("meas_index", 3.0), fields[5]);
        assert_eq!(("heat_stable", 1.0), fields[6]);
    }

    #[test]
    fn test_sensor_error_chip_id() {
        let err = SensorError::ChipId(0x61, 0x60);

        assert_eq!(SensorErrorKind::ChipId, err.kind());
        assert_eq!("unexpected chip id: expected 0x61, got 0x60", err.to_string());
    }
}
