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

#![cfg(test)]

use crate::sensor::bme680::{CHIP_ID, CHIP_ID_ADDR, COEFF_ADDR1, COEFF_ADDR1_LEN, COEFF_ADDR2, COEFF_SIZE, FIELD0_ADDR, FIELD_LENGTH};
use crate::sensor::core::{RegisterBus, SensorError, SensorErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const REGISTER_COUNT: usize = 256;

/// RegisterBus implementation that always fails, like a sensor that was unplugged.
pub(crate) struct FailingBus;

impl RegisterBus for FailingBus {
    fn read_registers(&mut self, _register: u8, _buf: &mut [u8]) -> Result<(), SensorError> {
        Err(SensorError::KindMsg(SensorErrorKind::Io, "remote I/O error"))
    }

    fn write_register(&mut self, _register: u8, _value: u8) -> Result<(), SensorError> {
        Err(SensorError::KindMsg(SensorErrorKind::Io, "remote I/O error"))
    }
}

/// RegisterBus implementation backed by an in-memory register map. Reads past
/// the last register wrap around to the first like the sensor does. The map is
/// shared so tests can inspect writes after handing the bus to a sensor.
pub(crate) struct MockBus {
    registers: Arc<Mutex<[u8; REGISTER_COUNT]>>,
    failing: Arc<AtomicBool>,
}

impl MockBus {
    pub(crate) fn new() -> Self {
        Self::from_registers([0; REGISTER_COUNT])
    }

    pub(crate) fn from_registers(registers: [u8; REGISTER_COUNT]) -> Self {
        MockBus {
            registers: Arc::new(Mutex::new(registers)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that makes every subsequent read and write fail when set.
    pub(crate) fn failure_switch(&self) -> Arc<AtomicBool> {
        self.failing.clone()
    }

    fn check(&self) -> Result<(), SensorError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SensorError::KindMsg(SensorErrorKind::Io, "remote I/O error"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn set(&mut self, register: u8, value: u8) {
        self.registers.lock().unwrap()[register as usize] = value;
    }

    pub(crate) fn registers(&self) -> Arc<Mutex<[u8; REGISTER_COUNT]>> {
        self.registers.clone()
    }
}

impl RegisterBus for MockBus {
    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        self.check()?;
        let registers = self.registers.lock().unwrap();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = registers[(register as usize + i) % REGISTER_COUNT];
        }

        Ok(())
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        self.check()?;
        self.registers.lock().unwrap()[register as usize] = value;
        Ok(())
    }
}

/// Field data registers for a measurement with new data, gas index 0, measurement
/// index 4, valid gas reading with a stable heater, and raw values chosen so that
/// `calibrated_registers` compensates them to round numbers.
pub(crate) fn sample_fields() -> [u8; FIELD_LENGTH] {
    let mut regs = [0; FIELD_LENGTH];
    regs[0] = 0b1000_0000; // new data, gas index 0
    regs[1] = 4; // measurement index
    regs[2] = 0x80; // pressure msb, adc 524288
    regs[5] = 0x7D; // temperature msb, adc 512000
    regs[8] = 0x19; // humidity msb, adc 6400
    regs[13] = 0x80; // gas resistance msb, adc 512
    regs[14] = 0b0011_0000; // gas valid, heat stable, gas range 0
    regs
}

/// Register map of a sensor with the correct chip ID, simple calibration
/// coefficients, and a pending measurement from `sample_fields`.
///
/// The measurement compensates to 25c, 1000hPa, 50% humidity, and 8M ohm gas resistance.
pub(crate) fn calibrated_registers() -> [u8; REGISTER_COUNT] {
    let mut coeff = [0; COEFF_SIZE];
    coeff[1] = 0x00; // t2 lsb
    coeff[2] = 0x10; // t2 msb, 4096
    coeff[5] = 0x00; // p1 lsb
    coeff[6] = 0x80; // p1 msb, 32768
    coeff[25] = 0x80; // h2 msb, 2048

    let mut regs = [0; REGISTER_COUNT];
    regs[CHIP_ID_ADDR as usize] = CHIP_ID;

    let first = COEFF_ADDR1 as usize;
    regs[first..first + COEFF_ADDR1_LEN].copy_from_slice(&coeff[..COEFF_ADDR1_LEN]);
    let second = COEFF_ADDR2 as usize;
    regs[second..second + (COEFF_SIZE - COEFF_ADDR1_LEN)].copy_from_slice(&coeff[COEFF_ADDR1_LEN..]);

    let field = FIELD0_ADDR as usize;
    regs[field..field + FIELD_LENGTH].copy_from_slice(&sample_fields());
    regs
}
