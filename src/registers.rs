//! Delcos XL register map.
//!
//! Addresses are 0-based protocol addresses of holding registers. The compressor controller
//! exposes many more registers than listed here; only those the CSC reports or writes are named.

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::IntoStaticStr)]
#[repr(u16)]
pub enum Register {
    WaterLevel = 0x1E,
    TargetSpeed = 0x22,
    MotorCurrent = 0x23,
    HeatsinkTemperature = 0x24,
    DclinkVoltage = 0x25,
    MotorSpeedPercentage = 0x26,
    MotorSpeedRpm = 0x27,
    MotorInput = 0x28,
    CompressorPowerConsumption = 0x29,
    CompressorVolumePercentage = 0x2A,
    CompressorVolume = 0x2B,
    GroupVolume = 0x2C,
    Stage1OutputPressure = 0x2D,
    LinePressure = 0x2E,
    Stage1OutputTemperature = 0x2F,
    Status = 0x30,
    Inhibit = 0x32,
    RunningHours = 0x39,
    LoadedHours = 0x3B,
    LowestServiceCounter = 0x3D,
    RunOnTimer = 0x3E,
    LoadedHours50Percent = 0x3F,
    ErrorE400 = 0x63,
    SoftwareVersion = 0xC7,
    SerialNumber = 0xD5,
    RemoteCommand = 0x12B,
    Reset = 0x12D,
}

impl Register {
    pub const fn address(self) -> u16 {
        self as u16
    }
}

pub const STATUS_COUNT: u16 = 3;
pub const ERROR_COUNT: u16 = 16;
pub const SOFTWARE_VERSION_LENGTH: usize = 14;
pub const SERIAL_NUMBER_LENGTH: usize = 9;
pub const INFO_COUNT: u16 = (SOFTWARE_VERSION_LENGTH + SERIAL_NUMBER_LENGTH) as u16;
/// Registers read from [`Register::TargetSpeed`] onwards; the water level is read separately.
pub const ANALOG_COUNT: u16 = 14;
pub const TIMERS_COUNT: u16 = 8;

pub const POWER_ON: u16 = 0xFF01;
pub const POWER_OFF: u16 = 0xFF00;
pub const RESET_ERRORS: u16 = 0xFF01;

pub const fn decode_int16(register: u16) -> i16 {
    register as i16
}

pub const fn decode_uint16(register: u16) -> u16 {
    register
}

/// Big-endian word order: the register at the lower address holds the high word.
pub const fn decode_uint32(high: u16, low: u16) -> u32 {
    (high as u32) << 16 | low as u32
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataType {
    scale: u8,
    signed: bool,
    words: u8,
}

impl DataType {
    pub const U16: Self = Self { scale: 1, signed: false, words: 1 };
    pub const I16: Self = Self { scale: 1, signed: true, words: 1 };
    /// Unsigned tenths.
    pub const DECI: Self = Self { scale: 10, signed: false, words: 1 };
    pub const U32: Self = Self { scale: 1, signed: false, words: 2 };

    pub fn from_words(self, words: &[u16]) -> Option<Value> {
        Some(match *words.get(..usize::from(self.words))? {
            [high, low] => Value::U32(decode_uint32(high, low)),
            [word] if self.signed => Value::I16(decode_int16(word)),
            [word] if self.scale != 1 => Value::Deci(decode_uint16(word)),
            [word] => Value::U16(decode_uint16(word)),
            _ => return None,
        })
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.signed { "INT" } else { "UINT" })?;
        f.write_fmt(format_args!("{}", 16 * u32::from(self.words)))?;
        if self.scale != 1 {
            f.write_fmt(format_args!("/{}", self.scale))?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    U16(u16),
    I16(i16),
    /// This data type contains a value multiplied by 10.
    Deci(u16),
    U32(u32),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::U16(n) => f.write_fmt(format_args!("{}", n)),
            Value::I16(n) => f.write_fmt(format_args!("{}", n)),
            Value::Deci(n) => f.write_fmt(format_args!("{}", f64::from(n) / 10.0)),
            Value::U32(n) => f.write_fmt(format_args!("{}", n)),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::U16(n) => serializer.serialize_u16(n),
            Value::I16(n) => serializer.serialize_i16(n),
            Value::Deci(n) => serializer.serialize_f64(f64::from(n) / 10.0),
            Value::U32(n) => serializer.serialize_u32(n),
        }
    }
}

/// A named value at an offset into a block of registers read in one go.
#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub data_type: DataType,
}

macro_rules! fields {
    ($($name: literal @ $offset: literal: $ty: ident,)*) => {
        [$(Field { name: $name, offset: $offset, data_type: DataType::$ty },)*]
    };
}

/// Fields of `[water level] ++ ANALOG_COUNT registers from target speed`.
///
/// Offset 8 (compressor power consumption) is not available on the compressor.
pub static ANALOG_FIELDS: [Field; 14] = fields![
    "waterLevel" @ 0: I16,
    "targetSpeed" @ 1: U16,
    "motorCurrent" @ 2: DECI,
    "heatsinkTemperature" @ 3: I16,
    "dclinkVoltage" @ 4: U16,
    "motorSpeedPercentage" @ 5: U16,
    "motorSpeedRPM" @ 6: U16,
    "motorInput" @ 7: DECI,
    "compressorVolumePercentage" @ 9: U16,
    "compressorVolume" @ 10: DECI,
    "groupVolume" @ 11: DECI,
    "stage1OutputPressure" @ 12: I16,
    "linePressure" @ 13: I16,
    "stage1OutputTemperature" @ 14: I16,
];

/// Fields of the TIMERS_COUNT registers from running hours.
///
/// Loaded hours 50% (offset 6) is unavailable on the installed model.
pub static TIMER_FIELDS: [Field; 4] = fields![
    "runningHours" @ 0: U32,
    "loadedHours" @ 2: U32,
    "lowestServiceCounter" @ 4: I16,
    "runOnTimer" @ 5: I16,
];

pub fn decode_fields(
    fields: &[Field],
    registers: &[u16],
) -> Option<Vec<(&'static str, Value)>> {
    fields
        .iter()
        .map(|field| {
            let value = field.data_type.from_words(registers.get(field.offset..)?)?;
            Some((field.name, value))
        })
        .collect()
}

/// Bit `i` of the register at `offset` maps to `flags[i]`. `None` marks unused bits.
#[derive(Clone, Copy, Debug)]
pub struct FlagRegister {
    pub offset: usize,
    pub flags: &'static [Option<&'static str>],
}

pub static STATUS_FLAGS: [FlagRegister; 2] = [
    FlagRegister {
        offset: 0,
        flags: &[
            Some("readyToStart"),
            Some("operating"),
            Some("startInhibit"),
            Some("motorStartPhase"),
            Some("offLoad"),
            Some("onLoad"),
            Some("softStop"),
            Some("runOnTimer"),
            Some("fault"),
            Some("warning"),
            Some("serviceRequired"),
            Some("minAllowedSpeedAchieved"),
            Some("maxAllowedSpeedAchieved"),
        ],
    },
    FlagRegister {
        offset: 2,
        flags: &[
            Some("startByRemote"),
            Some("startWithTimerControl"),
            Some("startWithPressureRequirement"),
            Some("startAfterDePressurise"),
            Some("startAfterPowerLoss"),
            Some("startAfterDryerPreRun"),
        ],
    },
];

pub static ERROR_FLAGS: [FlagRegister; 3] = [
    FlagRegister {
        offset: 0,
        flags: &[
            Some("powerSupplyFailureE400"),
            Some("emergencyStopActivatedE401"),
            Some("highMotorTemperatureM1E402"),
            Some("compressorDischargeTemperatureE403"),
            Some("startTemperatureLowE404"),
            Some("dischargeOverPressureE405"),
            Some("linePressureSensorB1E406"),
            Some("dischargePressureSensorB2E407"),
            Some("dischargeTemperatureSensorR2E408"),
            Some("controllerHardwareE409"),
            Some("coolingE410"),
            Some("oilPressureLowE411"),
            Some("externalFaultE412"),
            Some("dryerE413"),
            Some("condensateDrainE414"),
            Some("noPressureBuildUpE415"),
        ],
    },
    FlagRegister { offset: 1, flags: &[Some("heavyStartupE416")] },
    FlagRegister {
        offset: 6,
        flags: &[
            Some("preAdjustmentVSDE500"),
            Some("preAdjustmentE501"),
            Some("lockedVSDE502"),
            Some("writeFaultVSDE503"),
            Some("communicationVSDE504"),
            Some("stopPressedVSDE505"),
            Some("stopInputEMVSDE506"),
            Some("readFaultVSDE507"),
            Some("stopInputVSDEME508"),
            Some("seeVSDDisplayE509"),
            Some("speedBelowMinLimitE510"),
        ],
    },
];

pub static WARNING_FLAGS: [FlagRegister; 3] = [
    FlagRegister {
        offset: 8,
        flags: &[
            Some("serviceDueA600"),
            Some("dischargeOverPressureA601"),
            Some("compressorDischargeTemperatureA602"),
            None,
            None,
            None,
            Some("linePressureHighA606"),
            Some("controllerBatteryEmptyA607"),
            Some("dryerA608"),
            Some("condensateDrainA609"),
            Some("fineSeparatorA610"),
            Some("airFilterA611"),
            Some("oilFilterA612"),
            Some("oilLevelLowA613"),
            Some("oilTemperatureHighA614"),
            Some("externalWarningA615"),
        ],
    },
    FlagRegister {
        offset: 9,
        flags: &[
            Some("motorLuricationSystemA616"),
            Some("input1A617"),
            Some("input2A618"),
            Some("input3A619"),
            Some("input4A620"),
            Some("input5A621"),
            Some("input6A622"),
            Some("fullSDCardA623"),
        ],
    },
    FlagRegister { offset: 14, flags: &[Some("temperatureHighVSDA700")] },
];

pub fn decode_flags(
    table: &[FlagRegister],
    registers: &[u16],
) -> Option<Vec<(&'static str, bool)>> {
    let mut flags = Vec::new();
    for register in table {
        let value = *registers.get(register.offset)?;
        for (bit, name) in register.flags.iter().enumerate() {
            if let Some(name) = name {
                flags.push((*name, value & (1 << bit) != 0));
            }
        }
    }
    Some(flags)
}

/// One character per register. NUL padding and trailing whitespace are dropped.
pub fn decode_ascii(registers: &[u16]) -> String {
    let text: String = registers
        .iter()
        .filter_map(|r| char::from_u32(u32::from(*r)))
        .filter(|c| *c != '\0')
        .collect();
    text.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_decoding() {
        assert_eq!(decode_int16(0xFFFF), -1);
        assert_eq!(decode_int16(0x7FFF), i16::MAX);
        assert_eq!(decode_uint16(0xFFFF), 0xFFFF);
        assert_eq!(decode_uint32(0x0001, 0x0002), 65538);
    }

    #[test]
    fn data_types() {
        assert_eq!(DataType::I16.from_words(&[0xFFFB]), Some(Value::I16(-5)));
        assert_eq!(DataType::DECI.from_words(&[7]), Some(Value::Deci(7)));
        assert_eq!(DataType::U32.from_words(&[1, 0x1170, 9]), Some(Value::U32(70000)));
        assert_eq!(DataType::U32.from_words(&[1]), None);
        assert_eq!(DataType::DECI.to_string(), "UINT16/10");
        assert_eq!(Value::Deci(23).to_string(), "2.3");
    }

    #[test]
    fn analog_fields_skip_power_consumption() {
        let registers: Vec<u16> = (2..17).collect();
        let decoded = decode_fields(&ANALOG_FIELDS, &registers).unwrap();
        assert_eq!(decoded.len(), 14);
        assert_eq!(decoded[0], ("waterLevel", Value::I16(2)));
        assert_eq!(decoded[2], ("motorCurrent", Value::Deci(4)));
        assert_eq!(decoded[8], ("compressorVolumePercentage", Value::U16(11)));
        assert!(decoded.iter().all(|(name, _)| *name != "compressorPowerConsumption"));
        assert!(decode_fields(&ANALOG_FIELDS, &registers[..14]).is_none());
    }

    #[test]
    fn timer_fields() {
        let decoded = decode_fields(&TIMER_FIELDS, &[1, 0x1170, 0, 1234, 0xFFFB, 0, 0, 0]).unwrap();
        assert_eq!(
            decoded,
            vec![
                ("runningHours", Value::U32(70000)),
                ("loadedHours", Value::U32(1234)),
                ("lowestServiceCounter", Value::I16(-5)),
                ("runOnTimer", Value::I16(0)),
            ]
        );
    }

    #[test]
    fn status_flags() {
        let flags = decode_flags(&STATUS_FLAGS, &[0x0001, 0x0000, 0x0001]).unwrap();
        assert_eq!(flags.len(), 19);
        assert_eq!(flags[0], ("readyToStart", true));
        assert_eq!(flags[1], ("operating", false));
        assert_eq!(flags[13], ("startByRemote", true));
        assert!(decode_flags(&STATUS_FLAGS, &[1, 0]).is_none());
    }

    #[test]
    fn warning_flags_skip_unused_bits() {
        let mut registers = [0u16; 16];
        registers[8] = 0b0100_0000;
        registers[14] = 1;
        let flags = decode_flags(&WARNING_FLAGS, &registers).unwrap();
        assert_eq!(flags.len(), 13 + 8 + 1);
        assert!(flags.contains(&("linePressureHighA606", true)));
        assert!(flags.contains(&("temperatureHighVSDA700", true)));
        assert!(flags.contains(&("serviceDueA600", false)));
    }

    #[test]
    fn ascii() {
        let registers: Vec<u16> = "V1.2  ".bytes().map(u16::from).chain([0, 0]).collect();
        assert_eq!(decode_ascii(&registers), "V1.2");
    }

    #[test]
    fn register_addresses() {
        assert_eq!(Register::Stage1OutputTemperature.address(), 0x2F);
        assert_eq!(Register::from_repr(0x12B), Some(Register::RemoteCommand));
        let name: &'static str = Register::Reset.into();
        assert_eq!(name, "Reset");
    }
}
