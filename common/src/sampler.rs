//! Battery voltage sampling through a calibrated single-shot ADC read.

use thiserror::Error;

use crate::config::SamplerConfig;

pub const ADC_WIDTH_BITS: u8 = 12;
pub const ADC_MAX_RAW: u16 = (1 << ADC_WIDTH_BITS) - 1;

const LIN_COEFF_A_SCALE: u64 = 65_536;
const LIN_COEFF_A_ROUND: u64 = LIN_COEFF_A_SCALE / 2;
const ADC_12_BIT_RES: u64 = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attenuation {
    Db0,
    Db2_5,
    Db6,
    Db11,
}

impl Attenuation {
    // Factory line-fit scale and offset per attenuation.
    fn scale(self) -> u64 {
        match self {
            Self::Db0 => 57_431,
            Self::Db2_5 => 76_236,
            Self::Db6 => 105_481,
            Self::Db11 => 196_602,
        }
    }

    fn offset_mv(self) -> u32 {
        match self {
            Self::Db0 => 75,
            Self::Db2_5 => 78,
            Self::Db6 => 88,
            Self::Db11 => 142,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error("adc read failed: {0}")]
    Read(String),
    #[error("raw sample {0} exceeds {ADC_WIDTH_BITS}-bit range")]
    OutOfRange(u16),
}

/// Maps a raw conversion code to millivolts at the ADC pin.
pub trait Calibration {
    fn raw_to_millivolts(&self, raw: u16) -> u32;
}

impl<F> Calibration for F
where
    F: Fn(u16) -> u32,
{
    fn raw_to_millivolts(&self, raw: u16) -> u32 {
        self(raw)
    }
}

/// Linear characterization derived from a reference voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationProfile {
    coeff_a: u64,
    coeff_b: u32,
}

impl CalibrationProfile {
    pub fn from_vref(vref_mv: u32, attenuation: Attenuation) -> Self {
        Self {
            coeff_a: u64::from(vref_mv) * attenuation.scale() / ADC_12_BIT_RES,
            coeff_b: attenuation.offset_mv(),
        }
    }
}

impl Calibration for CalibrationProfile {
    fn raw_to_millivolts(&self, raw: u16) -> u32 {
        let scaled = (self.coeff_a * u64::from(raw) + LIN_COEFF_A_ROUND) / LIN_COEFF_A_SCALE;
        scaled as u32 + self.coeff_b
    }
}

/// One configured analog input.
pub trait AdcReader {
    type Error: std::fmt::Display;

    fn read_raw(&mut self) -> Result<u16, Self::Error>;
}

pub struct VoltageSampler<R, C> {
    reader: R,
    calibration: C,
    divider_ratio: u32,
}

impl<R: AdcReader> VoltageSampler<R, CalibrationProfile> {
    pub fn from_config(reader: R, config: &SamplerConfig) -> Self {
        Self::new(
            reader,
            CalibrationProfile::from_vref(config.default_vref_mv, Attenuation::Db11),
            config.divider_ratio,
        )
    }
}

impl<R, C> VoltageSampler<R, C>
where
    R: AdcReader,
    C: Calibration,
{
    pub fn new(reader: R, calibration: C, divider_ratio: u32) -> Self {
        Self {
            reader,
            calibration,
            divider_ratio,
        }
    }

    /// Takes exactly one raw sample and returns the battery voltage in mV.
    pub fn sample_battery_voltage(&mut self) -> Result<u32, SampleError> {
        let raw = self
            .reader
            .read_raw()
            .map_err(|err| SampleError::Read(err.to_string()))?;
        if raw > ADC_MAX_RAW {
            return Err(SampleError::OutOfRange(raw));
        }

        let pin_mv = self.calibration.raw_to_millivolts(raw);
        let battery_mv = pin_mv.saturating_mul(self.divider_ratio);
        log::info!("raw: {raw}, voltage: {battery_mv}mV");
        Ok(battery_mv)
    }

    pub fn into_reader(self) -> R {
        self.reader
    }
}
