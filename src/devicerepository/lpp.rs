//! Cayenne Low Power Payload.
//!
//! A payload is a sequence of `channel, type, value` records. Decoded objects name
//! each value `<type>_<channel>`, e.g. `temperature_1`.

use serde_json::{Map, Number, Value};

use super::formatter::FormatterProvider;
use crate::utils::GsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    DigitalInput,
    DigitalOutput,
    AnalogInput,
    AnalogOutput,
    Luminosity,
    Presence,
    Temperature,
    RelativeHumidity,
    Accelerometer,
    BarometricPressure,
    Gyrometer,
    Gps,
}

const KINDS: [Kind; 12] = [
    Kind::DigitalInput,
    Kind::DigitalOutput,
    Kind::AnalogInput,
    Kind::AnalogOutput,
    Kind::Luminosity,
    Kind::Presence,
    Kind::Temperature,
    Kind::RelativeHumidity,
    Kind::Accelerometer,
    Kind::BarometricPressure,
    Kind::Gyrometer,
    Kind::Gps,
];

impl Kind {
    fn code(self) -> u8 {
        match self {
            Kind::DigitalInput => 0,
            Kind::DigitalOutput => 1,
            Kind::AnalogInput => 2,
            Kind::AnalogOutput => 3,
            Kind::Luminosity => 101,
            Kind::Presence => 102,
            Kind::Temperature => 103,
            Kind::RelativeHumidity => 104,
            Kind::Accelerometer => 113,
            Kind::BarometricPressure => 115,
            Kind::Gyrometer => 134,
            Kind::Gps => 136,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Kind::DigitalInput => "digital_in",
            Kind::DigitalOutput => "digital_out",
            Kind::AnalogInput => "analog_in",
            Kind::AnalogOutput => "analog_out",
            Kind::Luminosity => "luminosity",
            Kind::Presence => "presence",
            Kind::Temperature => "temperature",
            Kind::RelativeHumidity => "relative_humidity",
            Kind::Accelerometer => "accelerometer",
            Kind::BarometricPressure => "barometric_pressure",
            Kind::Gyrometer => "gyrometer",
            Kind::Gps => "gps",
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        KINDS.iter().copied().find(|k| k.code() == code)
    }

    fn from_name(name: &str) -> Option<Self> {
        KINDS.iter().copied().find(|k| k.name() == name)
    }

    /// Field layout: per field its width in bytes, signedness and divisor.
    fn fields(self) -> &'static [(&'static str, usize, bool, f64)] {
        match self {
            Kind::DigitalInput | Kind::DigitalOutput | Kind::Presence => &[("", 1, false, 1.0)],
            Kind::AnalogInput | Kind::AnalogOutput => &[("", 2, true, 100.0)],
            Kind::Luminosity => &[("", 2, false, 1.0)],
            Kind::Temperature => &[("", 2, true, 10.0)],
            Kind::RelativeHumidity => &[("", 1, false, 2.0)],
            Kind::BarometricPressure => &[("", 2, false, 10.0)],
            Kind::Accelerometer => &[("x", 2, true, 1000.0), ("y", 2, true, 1000.0), ("z", 2, true, 1000.0)],
            Kind::Gyrometer => &[("x", 2, true, 100.0), ("y", 2, true, 100.0), ("z", 2, true, 100.0)],
            Kind::Gps => &[
                ("latitude", 3, true, 10_000.0),
                ("longitude", 3, true, 10_000.0),
                ("altitude", 3, true, 100.0),
            ],
        }
    }

    fn size(self) -> usize {
        self.fields().iter().map(|(_, width, _, _)| width).sum()
    }
}

fn read_int(bytes: &[u8], signed: bool) -> i64 {
    let raw = bytes.iter().fold(0i64, |acc, b| (acc << 8) | i64::from(*b));
    let bits = bytes.len() * 8;
    if signed && raw & (1 << (bits - 1)) != 0 {
        raw - (1 << bits)
    } else {
        raw
    }
}

fn write_int(out: &mut Vec<u8>, value: i64, width: usize, signed: bool) -> Result<(), GsError> {
    let bits = width * 8;
    let (min, max) = if signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    } else {
        (0, (1i64 << bits) - 1)
    };
    if value < min || value > max {
        return Err(GsError::InvalidArgument(format!("value {} out of range", value)));
    }
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[8 - width..]);
    Ok(())
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Decodes an LPP payload into an object of named values.
pub fn decode(payload: &[u8]) -> Result<Map<String, Value>, GsError> {
    let mut out = Map::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let (channel, code) = match rest {
            [channel, code, ..] => (*channel, *code),
            _ => return Err(GsError::InvalidArgument("truncated LPP record".into())),
        };
        let kind = Kind::from_code(code)
            .ok_or_else(|| GsError::InvalidArgument(format!("unknown LPP type {}", code)))?;
        let end = 2 + kind.size();
        let mut data = rest
            .get(2..end)
            .ok_or_else(|| GsError::InvalidArgument(format!("truncated LPP {}", kind.name())))?;
        let value = match kind.fields() {
            [(_, _, signed, divisor)] => number(read_int(data, *signed) as f64 / divisor),
            fields => {
                let mut object = Map::new();
                for (name, width, signed, divisor) in fields {
                    let (field, tail) = data.split_at(*width);
                    object.insert(name.to_string(), number(read_int(field, *signed) as f64 / divisor));
                    data = tail;
                }
                Value::Object(object)
            }
        };
        out.insert(format!("{}_{}", kind.name(), channel), value);
        rest = &rest[end..];
    }
    Ok(out)
}

fn scaled(value: Option<&Value>, divisor: f64) -> Result<i64, GsError> {
    value
        .and_then(Value::as_f64)
        .map(|v| (v * divisor).round() as i64)
        .ok_or_else(|| GsError::InvalidArgument("LPP value is not a number".into()))
}

/// Encodes an object of `<type>_<channel>` values.
pub fn encode(data: &Value) -> Result<Vec<u8>, GsError> {
    let object = data
        .as_object()
        .ok_or_else(|| GsError::InvalidArgument("LPP data is not an object".into()))?;
    let mut out = Vec::new();
    for (key, value) in object {
        let (name, channel) = key
            .rsplit_once('_')
            .ok_or_else(|| GsError::InvalidArgument(format!("LPP key `{}` has no channel", key)))?;
        let kind = Kind::from_name(name)
            .ok_or_else(|| GsError::InvalidArgument(format!("unknown LPP type `{}`", name)))?;
        let channel: u8 = channel
            .parse()
            .map_err(|_| GsError::InvalidArgument(format!("invalid LPP channel in `{}`", key)))?;
        out.push(channel);
        out.push(kind.code());
        match kind.fields() {
            [(_, width, signed, divisor)] => {
                write_int(&mut out, scaled(Some(value), *divisor)?, *width, *signed)?;
            }
            fields => {
                for (field, width, signed, divisor) in fields {
                    write_int(&mut out, scaled(value.get(field), *divisor)?, *width, *signed)?;
                }
            }
        }
    }
    Ok(out)
}

/// The CayenneLPP formatter; it takes no parameter.
#[derive(Debug, Default)]
pub struct CayenneLpp;

impl FormatterProvider for CayenneLpp {
    fn decode(&self, _parameter: &str, _f_port: u32, payload: &[u8]) -> Result<Value, GsError> {
        decode(payload).map(Value::Object)
    }

    fn encode(&self, _parameter: &str, data: &Value) -> Result<Vec<u8>, GsError> {
        encode(data)
    }
}
