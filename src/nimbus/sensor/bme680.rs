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

use crate::sensor::core::{open_bus, RegisterBus, SensorError, SensorErrorKind, SensorSample};
use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::Duration;

pub const I2C_ADDR_PRIMARY: u8 = 0x76;
pub const I2C_ADDR_SECONDARY: u8 = 0x77;

pub(crate) const CHIP_ID: u8 = 0x61;
pub(crate) const CHIP_ID_ADDR: u8 = 0xD0;
pub(crate) const SOFT_RESET_ADDR: u8 = 0xE0;
pub(crate) const SOFT_RESET_CMD: u8 = 0xB6;

pub(crate) const COEFF_ADDR1: u8 = 0x89;
pub(crate) const COEFF_ADDR1_LEN: usize = 25;
pub(crate) const COEFF_ADDR2: u8 = 0xE1;
pub(crate) const COEFF_ADDR2_LEN: usize = 16;
pub(crate) const COEFF_SIZE: usize = COEFF_ADDR1_LEN + COEFF_ADDR2_LEN;

pub(crate) const RES_HEAT_VAL_ADDR: u8 = 0x00;
pub(crate) const RES_HEAT_RANGE_ADDR: u8 = 0x02;
pub(crate) const RANGE_SW_ERR_ADDR: u8 = 0x04;

pub(crate) const FIELD0_ADDR: u8 = 0x1D;
pub(crate) const FIELD_LENGTH: usize = 15;

pub(crate) const RES_HEAT0_ADDR: u8 = 0x5A;
pub(crate) const GAS_WAIT0_ADDR: u8 = 0x64;
pub(crate) const CONF_HEAT_CTRL_ADDR: u8 = 0x70;
pub(crate) const CONF_ODR_RUN_GAS_NBC_ADDR: u8 = 0x71;
pub(crate) const CONF_OS_H_ADDR: u8 = 0x72;
pub(crate) const CONF_T_P_MODE_ADDR: u8 = 0x74;
pub(crate) const CONF_ODR_FILT_ADDR: u8 = 0x75;

const NEW_DATA_MSK: u8 = 0x80;
const GAS_INDEX_MSK: u8 = 0x0F;
const GAS_RANGE_MSK: u8 = 0x0F;
const GASM_VALID_MSK: u8 = 0x20;
const HEAT_STAB_MSK: u8 = 0x10;

const OS_H_MSK: u8 = 0x07;
const OS_H_POS: u8 = 0;
const OST_MSK: u8 = 0xE0;
const OST_POS: u8 = 5;
const OSP_MSK: u8 = 0x1C;
const OSP_POS: u8 = 2;
const FILTER_MSK: u8 = 0x1C;
const FILTER_POS: u8 = 2;
const MODE_MSK: u8 = 0x03;
const MODE_POS: u8 = 0;
const RUN_GAS_MSK: u8 = 0x10;
const RUN_GAS_POS: u8 = 4;
const NBCONV_MSK: u8 = 0x0F;
const NBCONV_POS: u8 = 0;
const HEAT_OFF_MSK: u8 = 0x08;
const HEAT_OFF_POS: u8 = 3;

const MAX_HEATER_TEMPERATURE: u16 = 400;
const MAX_HEATER_PROFILE: u8 = 9;
const DEFAULT_AMBIENT_TEMPERATURE: f64 = 25.0;

const POLL_ATTEMPTS: usize = 10;
const POLL_DELAY: Duration = Duration::from_millis(10);

// Gas range correction factors from the BME680 datasheet
const GAS_RANGE_K1: [f64; 16] = [
    0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, -0.8, 0.0, 0.0, -0.2, -0.5, 0.0, -1.0, 0.0, 0.0,
];
const GAS_RANGE_K2: [f64; 16] = [
    0.0, 0.0, 0.0, 0.0, 0.1, 0.7, 0.0, -0.8, -0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
];

/// Oversampling rate for temperature, pressure, or humidity measurements
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Oversampling {
    Skipped = 0,
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

impl Oversampling {
    fn measurement_cycles(&self) -> u32 {
        match self {
            Oversampling::Skipped => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

/// Coefficient size of the IIR filter applied to temperature and pressure
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterSize {
    Size0 = 0,
    Size1 = 1,
    Size3 = 2,
    Size7 = 3,
    Size15 = 4,
    Size31 = 5,
    Size63 = 6,
    Size127 = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PowerMode {
    Sleep = 0,
    Forced = 1,
}

/// Measurement settings applied to the sensor before it is powered on.
///
/// The configuration flow is documented on p.16 of the BME680 datasheet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorSettings {
    pub humidity_oversampling: Oversampling,
    pub pressure_oversampling: Oversampling,
    pub temperature_oversampling: Oversampling,
    pub filter: FilterSize,
    pub gas_enabled: bool,
    /// Target heater temperature in degrees celsius, at most 400
    pub heater_temperature: u16,
    pub heater_duration: Duration,
    /// Heater set-point to use, from 0 to 9
    pub heater_profile: u8,
}

impl SensorSettings {
    /// Expected time to complete a forced measurement with these settings.
    fn measurement_duration(&self) -> Duration {
        let cycles = self.temperature_oversampling.measurement_cycles()
            + self.pressure_oversampling.measurement_cycles()
            + self.humidity_oversampling.measurement_cycles();

        // Conversion time plus TPH switching, gas measurement, and wake up time (in microseconds)
        let tph = Duration::from_micros(u64::from(cycles) * 1963 + 477 * 4 + 477 * 5 + 500);
        let heater = if self.gas_enabled {
            self.heater_duration
        } else {
            Duration::ZERO
        };

        tph + Duration::from_millis(1) + heater
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            humidity_oversampling: Oversampling::X2,
            pressure_oversampling: Oversampling::X2,
            temperature_oversampling: Oversampling::X2,
            filter: FilterSize::Size3,
            gas_enabled: true,
            heater_temperature: 320,
            heater_duration: Duration::from_millis(150),
            heater_profile: 0,
        }
    }
}

/// Factory calibration coefficients read from the sensor non-volatile memory.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Calibration {
    par_t1: f64,
    par_t2: f64,
    par_t3: f64,
    par_p1: f64,
    par_p2: f64,
    par_p3: f64,
    par_p4: f64,
    par_p5: f64,
    par_p6: f64,
    par_p7: f64,
    par_p8: f64,
    par_p9: f64,
    par_p10: f64,
    par_h1: f64,
    par_h2: f64,
    par_h3: f64,
    par_h4: f64,
    par_h5: f64,
    par_h6: f64,
    par_h7: f64,
    par_gh1: f64,
    par_gh2: f64,
    par_gh3: f64,
    res_heat_range: f64,
    res_heat_val: f64,
    range_sw_err: f64,
}

fn u16_le(lsb: u8, msb: u8) -> f64 {
    f64::from(u16::from_le_bytes([lsb, msb]))
}

fn i16_le(lsb: u8, msb: u8) -> f64 {
    f64::from(i16::from_le_bytes([lsb, msb]))
}

fn i8_of(v: u8) -> f64 {
    f64::from(v as i8)
}

impl Calibration {
    /// Decode calibration from both coefficient register blocks (concatenated) and
    /// the heater and switching error registers.
    pub(crate) fn from_registers(coeff: &[u8; COEFF_SIZE], res_heat_range: u8, res_heat_val: u8, range_sw_err: u8) -> Self {
        Self {
            par_t1: u16_le(coeff[33], coeff[34]),
            par_t2: i16_le(coeff[1], coeff[2]),
            par_t3: i8_of(coeff[3]),
            par_p1: u16_le(coeff[5], coeff[6]),
            par_p2: i16_le(coeff[7], coeff[8]),
            par_p3: i8_of(coeff[9]),
            par_p4: i16_le(coeff[11], coeff[12]),
            par_p5: i16_le(coeff[13], coeff[14]),
            par_p6: i8_of(coeff[16]),
            par_p7: i8_of(coeff[15]),
            par_p8: i16_le(coeff[19], coeff[20]),
            par_p9: i16_le(coeff[21], coeff[22]),
            par_p10: f64::from(coeff[23]),
            // Humidity coefficients one and two share a register, split by nibble
            par_h1: f64::from((u16::from(coeff[27]) << 4) | u16::from(coeff[26] & 0x0F)),
            par_h2: f64::from((u16::from(coeff[25]) << 4) | u16::from(coeff[26] >> 4)),
            par_h3: i8_of(coeff[28]),
            par_h4: i8_of(coeff[29]),
            par_h5: i8_of(coeff[30]),
            par_h6: f64::from(coeff[31]),
            par_h7: i8_of(coeff[32]),
            par_gh1: i8_of(coeff[37]),
            par_gh2: i16_le(coeff[35], coeff[36]),
            par_gh3: i8_of(coeff[38]),
            res_heat_range: f64::from((res_heat_range & 0x30) >> 4),
            res_heat_val: i8_of(res_heat_val),
            // Signed upper nibble
            range_sw_err: f64::from((range_sw_err as i8) >> 4),
        }
    }

    /// Temperature in degrees celsius and the fine resolution temperature used
    /// to compensate pressure and humidity.
    fn temperature(&self, adc: u32) -> (f64, f64) {
        let adc = f64::from(adc);
        let var1 = ((adc / 16384.0) - (self.par_t1 / 1024.0)) * self.par_t2;
        let var2 = ((adc / 131072.0) - (self.par_t1 / 8192.0)).powi(2) * (self.par_t3 * 16.0);
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Pressure in pascals.
    fn pressure(&self, adc: u32, t_fine: f64) -> f64 {
        let mut var1 = (t_fine / 2.0) - 64000.0;
        let mut var2 = var1 * var1 * (self.par_p6 / 131072.0);
        var2 += var1 * self.par_p5 * 2.0;
        var2 = (var2 / 4.0) + (self.par_p4 * 65536.0);
        var1 = (((self.par_p3 * var1 * var1) / 16384.0) + (self.par_p2 * var1)) / 524288.0;
        var1 = (1.0 + (var1 / 32768.0)) * self.par_p1;

        // Avoid division by zero with missing calibration
        if var1 == 0.0 {
            return 0.0;
        }

        let mut pressure = 1048576.0 - f64::from(adc);
        pressure = ((pressure - (var2 / 4096.0)) * 6250.0) / var1;
        let var1 = (self.par_p9 * pressure * pressure) / 2147483648.0;
        let var2 = pressure * (self.par_p8 / 32768.0);
        let var3 = (pressure / 256.0).powi(3) * (self.par_p10 / 131072.0);
        pressure + (var1 + var2 + var3 + (self.par_p7 * 128.0)) / 16.0
    }

    /// Relative humidity, clamped to 0 to 100.
    fn humidity(&self, adc: u16, t_fine: f64) -> f64 {
        let temp = t_fine / 5120.0;
        let var1 = f64::from(adc) - ((self.par_h1 * 16.0) + ((self.par_h3 / 2.0) * temp));
        let var2 = var1
            * ((self.par_h2 / 262144.0)
                * (1.0 + ((self.par_h4 / 16384.0) * temp) + ((self.par_h5 / 1048576.0) * temp * temp)));
        let var3 = self.par_h6 / 16384.0;
        let var4 = self.par_h7 / 2097152.0;
        let humidity = var2 + ((var3 + (var4 * temp)) * var2 * var2);
        humidity.clamp(0.0, 100.0)
    }

    /// Gas resistance in ohms.
    fn gas_resistance(&self, adc: u16, range: u8) -> f64 {
        let range = usize::from(range & GAS_RANGE_MSK);
        let var1 = 1340.0 + (5.0 * self.range_sw_err);
        let var2 = var1 * (1.0 + GAS_RANGE_K1[range] / 100.0);
        let var3 = 1.0 + (GAS_RANGE_K2[range] / 100.0);
        1.0 / (var3 * 0.000000125 * f64::from(1u32 << range) * (((f64::from(adc) - 512.0) / var2) + 1.0))
    }

    /// Register value for the heater resistance needed to reach `target` degrees
    /// celsius at the given ambient temperature.
    fn heater_resistance(&self, target: u16, ambient: f64) -> u8 {
        let target = f64::from(target.min(MAX_HEATER_TEMPERATURE));
        let var1 = (self.par_gh1 / 16.0) + 49.0;
        let var2 = ((self.par_gh2 / 32768.0) * 0.0005) + 0.00235;
        let var3 = self.par_gh3 / 1024.0;
        let var4 = var1 * (1.0 + (var2 * target));
        let var5 = var4 + (var3 * ambient);
        let res = 3.4
            * ((var5 * (4.0 / (4.0 + self.res_heat_range)) * (1.0 / (1.0 + (self.res_heat_val * 0.002)))) - 25.0);

        // Float to int casts saturate so out of range values end up as 0 or 255
        res as u8
    }
}

/// Register value for heating for `duration`, encoded as a 6-bit value and a
/// multiplication factor of 1, 4, 16, or 64.
pub(crate) fn heater_duration_code(duration: Duration) -> u8 {
    let mut ms = duration.as_millis().min(u128::from(u16::MAX)) as u16;
    if ms >= 0xFC0 {
        return 0xFF;
    }

    let mut factor: u8 = 0;
    while ms > 0x3F {
        ms /= 4;
        factor += 1;
    }

    ms as u8 + factor * 64
}

/// Uncompensated values of a measurement, parsed from the field data registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawFields {
    pub(crate) new_data: bool,
    pub(crate) gas_index: u8,
    pub(crate) meas_index: u8,
    pub(crate) pressure: u32,
    pub(crate) temperature: u32,
    pub(crate) humidity: u16,
    pub(crate) gas_resistance: u16,
    pub(crate) gas_range: u8,
    pub(crate) gas_valid: bool,
    pub(crate) heat_stable: bool,
}

impl RawFields {
    pub(crate) fn from_registers(regs: &[u8; FIELD_LENGTH]) -> Self {
        let xlsb = |msb: u8, lsb: u8, xlsb: u8| (u32::from(msb) << 12) | (u32::from(lsb) << 4) | (u32::from(xlsb) >> 4);

        Self {
            new_data: regs[0] & NEW_DATA_MSK > 0,
            gas_index: regs[0] & GAS_INDEX_MSK,
            meas_index: regs[1],
            pressure: xlsb(regs[2], regs[3], regs[4]),
            temperature: xlsb(regs[5], regs[6], regs[7]),
            humidity: (u16::from(regs[8]) << 8) | u16::from(regs[9]),
            gas_resistance: (u16::from(regs[13]) << 2) | (u16::from(regs[14]) >> 6),
            gas_range: regs[14] & GAS_RANGE_MSK,
            gas_valid: regs[14] & GASM_VALID_MSK > 0,
            heat_stable: regs[14] & HEAT_STAB_MSK > 0,
        }
    }
}

/// Read temperature, pressure, humidity, and gas resistance from a BME680 sensor
pub struct Bme680Sensor {
    bus: Box<dyn RegisterBus + Send + 'static>,
    address: u8,
    calibration: Calibration,
    settings: SensorSettings,
}

impl Bme680Sensor {
    /// Open the sensor at the first of `addresses` that responds with the expected
    /// chip ID, usually the primary address followed by the secondary address.
    pub fn open(addresses: &[u8]) -> Result<Self, SensorError> {
        Self::open_with(addresses, open_bus)
    }

    /// Like `open` but the bus for each address is created by `opener`.
    pub fn open_with<F, T>(addresses: &[u8], mut opener: F) -> Result<Self, SensorError>
    where
        F: FnMut(u8) -> Result<T, SensorError>,
        T: RegisterBus + Send + 'static,
    {
        let mut last_err = SensorError::KindMsg(SensorErrorKind::Initialization, "no I2C addresses to try");

        for &address in addresses {
            match opener(address).and_then(|bus| Self::from_bus(bus, address)) {
                Ok(sensor) => return Ok(sensor),
                Err(e) => {
                    tracing::warn!(message = "unable to open sensor", address = address, error = %e);
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    /// Verify the chip ID, reset the device, and load its calibration coefficients.
    pub fn from_bus<T>(bus: T, address: u8) -> Result<Self, SensorError>
    where
        T: RegisterBus + Send + 'static,
    {
        let mut bus = Box::new(bus);

        let chip_id = bus.read_register(CHIP_ID_ADDR)?;
        if chip_id != CHIP_ID {
            return Err(SensorError::ChipId(CHIP_ID, chip_id));
        }

        bus.write_register(SOFT_RESET_ADDR, SOFT_RESET_CMD)?;
        thread::sleep(Duration::from_millis(10));

        let mut coeff = [0; COEFF_SIZE];
        bus.read_registers(COEFF_ADDR1, &mut coeff[..COEFF_ADDR1_LEN])?;
        bus.read_registers(COEFF_ADDR2, &mut coeff[COEFF_ADDR1_LEN..])?;

        let res_heat_range = bus.read_register(RES_HEAT_RANGE_ADDR)?;
        let res_heat_val = bus.read_register(RES_HEAT_VAL_ADDR)?;
        let range_sw_err = bus.read_register(RANGE_SW_ERR_ADDR)?;
        let calibration = Calibration::from_registers(&coeff, res_heat_range, res_heat_val, range_sw_err);

        tracing::debug!(message = "loaded sensor calibration", address = address, calibration = ?calibration);

        Ok(Self {
            bus,
            address,
            calibration,
            settings: SensorSettings::default(),
        })
    }

    fn update_bits(&mut self, register: u8, mask: u8, pos: u8, value: u8) -> Result<(), SensorError> {
        let current = self.bus.read_register(register)?;
        let updated = (current & !mask) | ((value << pos) & mask);
        self.bus.write_register(register, updated)
    }

    fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), SensorError> {
        self.update_bits(CONF_T_P_MODE_ADDR, MODE_MSK, MODE_POS, mode as u8)
    }

    /// Apply oversampling, filter, and gas heater settings. The sensor must be in
    /// sleep mode while settings are changed so it is put to sleep first.
    pub fn configure(&mut self, settings: &SensorSettings) -> Result<(), SensorError> {
        if settings.heater_profile > MAX_HEATER_PROFILE {
            return Err(SensorError::KindMsg(
                SensorErrorKind::Initialization,
                "heater profile must be between 0 and 9",
            ));
        }

        self.set_power_mode(PowerMode::Sleep)?;

        self.update_bits(CONF_OS_H_ADDR, OS_H_MSK, OS_H_POS, settings.humidity_oversampling as u8)?;
        self.update_bits(CONF_T_P_MODE_ADDR, OSP_MSK, OSP_POS, settings.pressure_oversampling as u8)?;
        self.update_bits(CONF_T_P_MODE_ADDR, OST_MSK, OST_POS, settings.temperature_oversampling as u8)?;
        self.update_bits(CONF_ODR_FILT_ADDR, FILTER_MSK, FILTER_POS, settings.filter as u8)?;

        let heater_res = self
            .calibration
            .heater_resistance(settings.heater_temperature, DEFAULT_AMBIENT_TEMPERATURE);
        let heater_dur = heater_duration_code(settings.heater_duration);
        self.bus
            .write_register(RES_HEAT0_ADDR + settings.heater_profile, heater_res)?;
        self.bus
            .write_register(GAS_WAIT0_ADDR + settings.heater_profile, heater_dur)?;

        self.update_bits(CONF_HEAT_CTRL_ADDR, HEAT_OFF_MSK, HEAT_OFF_POS, 0)?;
        self.update_bits(CONF_ODR_RUN_GAS_NBC_ADDR, NBCONV_MSK, NBCONV_POS, settings.heater_profile)?;
        self.update_bits(
            CONF_ODR_RUN_GAS_NBC_ADDR,
            RUN_GAS_MSK,
            RUN_GAS_POS,
            u8::from(settings.gas_enabled),
        )?;

        tracing::debug!(
            message = "configured sensor",
            address = self.address,
            heater_resistance = heater_res,
            heater_duration = heater_dur,
        );

        self.settings = settings.clone();
        Ok(())
    }

    /// Trigger the first measurement.
    pub fn power_on(&mut self) -> Result<(), SensorError> {
        self.set_power_mode(PowerMode::Forced)
    }

    /// Trigger a measurement and read the result, returning `None` if the sensor
    /// did not report new data in time.
    pub fn read_sample(&mut self) -> Result<Option<SensorSample>, SensorError> {
        self.set_power_mode(PowerMode::Forced)?;
        thread::sleep(self.settings.measurement_duration());

        for attempt in 0..POLL_ATTEMPTS {
            let mut regs = [0; FIELD_LENGTH];
            self.bus.read_registers(FIELD0_ADDR, &mut regs)?;
            let raw = RawFields::from_registers(&regs);

            if !raw.new_data {
                tracing::trace!(message = "sensor data not ready", attempt = attempt);
                thread::sleep(POLL_DELAY);
                continue;
            }

            tracing::trace!(message = "read raw sensor fields", raw = ?raw);
            return Ok(Some(self.compensate(&raw)));
        }

        Ok(None)
    }

    fn compensate(&self, raw: &RawFields) -> SensorSample {
        let (temperature, t_fine) = self.calibration.temperature(raw.temperature);
        let pressure = self.calibration.pressure(raw.pressure, t_fine) / 100.0;
        let humidity = self.calibration.humidity(raw.humidity, t_fine);
        let gas_resistance = self.calibration.gas_resistance(raw.gas_resistance, raw.gas_range);

        let sample = SensorSample {
            temperature,
            pressure,
            humidity,
            gas_resistance,
            gas_index: raw.gas_index,
            meas_index: raw.meas_index,
            heat_stable: raw.heat_stable,
        };

        tracing::debug!(message = "parsed sensor data", gas_valid = raw.gas_valid, sample = %sample);
        sample
    }
}

impl Debug for Bme680Sensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bme680Sensor").field("address", &self.address).finish()
    }
}
