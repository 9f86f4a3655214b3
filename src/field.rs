//! Primitive bit-level field types.
//!
//! Each [`FieldType`] knows its width and how to pack/unpack a [`FieldValue`]
//! against the shared [`BitReader`]/[`BitWriter`] cursor.

use core::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::bits::{BitReader, BitWriter, MAX_FIELD_BITS};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("buffer underrun: needed {needed} bits, {available} available")]
    BufferUnderrun { needed: usize, available: usize },
    #[error("value {value} out of range for {width}-bit field")]
    OutOfRange { value: String, width: u8 },
    #[error("expected {expected} value")]
    TypeMismatch { expected: &'static str },
    #[error("unknown enum variant `{0}`")]
    UnknownVariant(String),
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("field width {0} outside 1..=32")]
    InvalidWidth(u8),
    #[error("payload is {actual} bytes, `{schema}` expects {expected}")]
    LengthMismatch {
        schema: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("field `{field}`: {source}")]
    Field {
        field: &'static str,
        #[source]
        source: Box<CodecError>,
    },
}

impl CodecError {
    pub(crate) fn in_field(self, field: &'static str) -> Self {
        CodecError::Field {
            field,
            source: Box::new(self),
        }
    }
}

/// Problems with a field type declaration, reported at registration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldTypeError {
    #[error("width {0} outside 1..=32")]
    InvalidWidth(u8),
    #[error("enum raw value {raw} does not fit in {width} bits")]
    EnumOverflow { raw: u32, width: u8 },
    #[error("enum raw value {0} mapped twice")]
    DuplicateRaw(u32),
    #[error("enum variant `{0}` declared twice")]
    DuplicateVariant(&'static str),
    #[error("temperature scale {0} must be finite and positive")]
    InvalidScale(f64),
}

/// Raw value to symbolic name table of an enum field, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariants {
    variants: Vec<(u32, &'static str)>,
}

impl EnumVariants {
    pub fn new(variants: &[(u32, &'static str)]) -> Self {
        Self {
            variants: variants.to_vec(),
        }
    }

    pub fn name_of(&self, raw: u32) -> Option<&'static str> {
        self.variants
            .iter()
            .find(|(value, _)| *value == raw)
            .map(|(_, name)| *name)
    }

    pub fn raw_of(&self, name: &str) -> Option<u32> {
        self.variants
            .iter()
            .find(|(_, variant)| *variant == name)
            .map(|(raw, _)| *raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &'static str)> + '_ {
        self.variants.iter().copied()
    }

    fn validate(&self, width: u8) -> Result<(), FieldTypeError> {
        for (index, (raw, name)) in self.variants.iter().enumerate() {
            if u64::from(*raw) > max_raw(width) {
                return Err(FieldTypeError::EnumOverflow { raw: *raw, width });
            }
            let earlier = &self.variants[..index];
            if earlier.iter().any(|(other, _)| other == raw) {
                return Err(FieldTypeError::DuplicateRaw(*raw));
            }
            if earlier.iter().any(|(_, other)| other == name) {
                return Err(FieldTypeError::DuplicateVariant(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    UInt,
    Enum(EnumVariants),
    Bitmap,
    Bool,
    /// Signed two's complement, multiplied by `scale` on decode.
    Temperature { scale: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldType {
    width: u8,
    kind: FieldKind,
}

impl FieldType {
    pub fn uint(width: u8) -> Self {
        Self {
            width,
            kind: FieldKind::UInt,
        }
    }

    pub fn enumeration(width: u8, variants: &[(u32, &'static str)]) -> Self {
        Self {
            width,
            kind: FieldKind::Enum(EnumVariants::new(variants)),
        }
    }

    pub fn bitmap(width: u8) -> Self {
        Self {
            width,
            kind: FieldKind::Bitmap,
        }
    }

    pub fn boolean() -> Self {
        Self {
            width: 1,
            kind: FieldKind::Bool,
        }
    }

    pub fn temperature(width: u8, scale: f64) -> Self {
        Self {
            width,
            kind: FieldKind::Temperature { scale },
        }
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            FieldKind::UInt => "unsigned integer",
            FieldKind::Enum(_) => "enum",
            FieldKind::Bitmap => "bitmap",
            FieldKind::Bool => "boolean",
            FieldKind::Temperature { .. } => "temperature",
        }
    }

    pub fn validate(&self) -> Result<(), FieldTypeError> {
        if self.width == 0 || self.width > MAX_FIELD_BITS {
            return Err(FieldTypeError::InvalidWidth(self.width));
        }
        match &self.kind {
            FieldKind::Enum(variants) => variants.validate(self.width),
            FieldKind::Temperature { scale } if !(scale.is_finite() && *scale > 0.0) => {
                Err(FieldTypeError::InvalidScale(*scale))
            }
            FieldKind::Bool if self.width != 1 => Err(FieldTypeError::InvalidWidth(self.width)),
            _ => Ok(()),
        }
    }

    /// Widths are only fully validated at registration; the codec paths
    /// still refuse widths the bit cursor cannot handle.
    fn check_width(&self) -> Result<(), CodecError> {
        if self.width == 0 || self.width > MAX_FIELD_BITS {
            return Err(CodecError::InvalidWidth(self.width));
        }
        Ok(())
    }

    pub fn decode(&self, reader: &mut BitReader<'_>) -> Result<FieldValue, CodecError> {
        self.check_width()?;
        let raw = reader.read(self.width)?;
        let value = match &self.kind {
            FieldKind::UInt => FieldValue::UInt(raw),
            // Unmapped raw values are kept, not rejected
            FieldKind::Enum(variants) => FieldValue::Enum(EnumValue {
                raw,
                name: variants.name_of(raw),
            }),
            FieldKind::Bitmap => FieldValue::Bitmap(Bitmap::from_bits(self.width, raw)),
            FieldKind::Bool => FieldValue::Bool(raw != 0),
            FieldKind::Temperature { scale } => {
                FieldValue::Temperature(sign_extend(raw, self.width) as f64 * scale)
            }
        };
        Ok(value)
    }

    pub fn encode(&self, value: &FieldValue, writer: &mut BitWriter) -> Result<(), CodecError> {
        let raw = self.raw_value(value)?;
        writer.write(raw, self.width);
        Ok(())
    }

    /// Type- and range-check `value`, filling in enum names from the mapping.
    pub fn normalize(&self, value: FieldValue) -> Result<FieldValue, CodecError> {
        self.raw_value(&value)?;
        Ok(match (&self.kind, value) {
            (FieldKind::Enum(variants), FieldValue::Enum(value)) => FieldValue::Enum(EnumValue {
                raw: value.raw,
                name: variants.name_of(value.raw),
            }),
            (_, value) => value,
        })
    }

    fn raw_value(&self, value: &FieldValue) -> Result<u32, CodecError> {
        self.check_width()?;
        let mismatch = || CodecError::TypeMismatch {
            expected: self.kind_name(),
        };
        match (&self.kind, value) {
            (FieldKind::UInt, FieldValue::UInt(raw)) => self.check_unsigned(*raw),
            (FieldKind::Enum(_), FieldValue::Enum(value)) => self.check_unsigned(value.raw),
            (FieldKind::Bitmap, FieldValue::Bitmap(bitmap)) => self.check_unsigned(bitmap.bits()),
            (FieldKind::Bool, FieldValue::Bool(flag)) => Ok(u32::from(*flag)),
            (FieldKind::Temperature { scale }, FieldValue::Temperature(degrees)) => {
                self.quantize(*degrees, *scale)
            }
            _ => Err(mismatch()),
        }
    }

    fn check_unsigned(&self, raw: u32) -> Result<u32, CodecError> {
        if u64::from(raw) > max_raw(self.width) {
            return Err(CodecError::OutOfRange {
                value: raw.to_string(),
                width: self.width,
            });
        }
        Ok(raw)
    }

    fn quantize(&self, degrees: f64, scale: f64) -> Result<u32, CodecError> {
        // f64::round rounds half away from zero
        let steps = (degrees / scale).round();
        let limit = (1i64 << (self.width - 1)) as f64;
        if !steps.is_finite() || steps < -limit || steps > limit - 1.0 {
            return Err(CodecError::OutOfRange {
                value: degrees.to_string(),
                width: self.width,
            });
        }
        Ok(((steps as i64) as u64 & max_raw(self.width)) as u32)
    }

    pub fn value_to_json(&self, value: &FieldValue) -> Value {
        match value {
            FieldValue::UInt(raw) => Value::from(*raw),
            FieldValue::Enum(EnumValue { name: Some(name), .. }) => Value::from(*name),
            FieldValue::Enum(EnumValue { raw, name: None }) => Value::from(*raw),
            FieldValue::Bitmap(bitmap) => Value::Array(
                (0..bitmap.width())
                    .map(|index| Value::Bool(bitmap.contains(index)))
                    .collect(),
            ),
            FieldValue::Bool(flag) => Value::Bool(*flag),
            FieldValue::Temperature(degrees) => serde_json::Number::from_f64(*degrees)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }

    pub fn value_from_json(&self, json: &Value) -> Result<FieldValue, CodecError> {
        self.check_width()?;
        let mismatch = || CodecError::TypeMismatch {
            expected: self.kind_name(),
        };
        let value = match (&self.kind, json) {
            (FieldKind::UInt, Value::Number(number)) => {
                FieldValue::UInt(self.json_unsigned(number)?)
            }
            (FieldKind::Enum(variants), Value::String(name)) => {
                let raw = variants
                    .raw_of(name)
                    .ok_or_else(|| CodecError::UnknownVariant(name.clone()))?;
                FieldValue::Enum(EnumValue::raw(raw))
            }
            (FieldKind::Enum(_), Value::Number(number)) => {
                FieldValue::Enum(EnumValue::raw(self.json_unsigned(number)?))
            }
            (FieldKind::Bitmap, Value::Number(number)) => {
                FieldValue::Bitmap(Bitmap::from_bits(self.width, self.json_unsigned(number)?))
            }
            (FieldKind::Bitmap, Value::Array(flags)) => {
                if flags.len() > usize::from(self.width) {
                    return Err(CodecError::OutOfRange {
                        value: format!("{} flags", flags.len()),
                        width: self.width,
                    });
                }
                let mut bitmap = Bitmap::zero(self.width);
                for (index, flag) in flags.iter().enumerate() {
                    if flag.as_bool().ok_or_else(mismatch)? {
                        bitmap.insert(index as u8);
                    }
                }
                FieldValue::Bitmap(bitmap)
            }
            (FieldKind::Bool, Value::Bool(flag)) => FieldValue::Bool(*flag),
            (FieldKind::Temperature { .. }, Value::Number(number)) => {
                FieldValue::Temperature(number.as_f64().ok_or_else(mismatch)?)
            }
            _ => return Err(mismatch()),
        };
        self.normalize(value)
    }

    fn json_unsigned(&self, number: &serde_json::Number) -> Result<u32, CodecError> {
        number
            .as_u64()
            .and_then(|raw| u32::try_from(raw).ok())
            .ok_or_else(|| CodecError::OutOfRange {
                value: number.to_string(),
                width: self.width,
            })
            .and_then(|raw| self.check_unsigned(raw))
    }
}

fn max_raw(width: u8) -> u64 {
    (1u64 << width) - 1
}

fn sign_extend(raw: u32, width: u8) -> i64 {
    let raw = i64::from(raw);
    if raw & (1 << (width - 1)) != 0 {
        raw - (1 << width)
    } else {
        raw
    }
}

/// A decoded enum value. `name` is `None` for raw values the mapping does
/// not know (newer firmware); those are carried through unchanged.
#[derive(Debug, Clone, Copy, Eq)]
pub struct EnumValue {
    pub raw: u32,
    pub name: Option<&'static str>,
}

impl EnumValue {
    pub fn raw(raw: u32) -> Self {
        Self { raw, name: None }
    }

    pub fn is_known(&self) -> bool {
        self.name.is_some()
    }
}

impl PartialEq for EnumValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Fixed-width set of flags. Index `i` is bit `1 << i` of the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bitmap {
    width: u8,
    bits: u32,
}

impl Bitmap {
    /// Widths above 32 are clamped.
    pub fn zero(width: u8) -> Self {
        Self {
            width: width.min(MAX_FIELD_BITS),
            bits: 0,
        }
    }

    /// Bits at or above `width` are dropped.
    pub fn from_bits(width: u8, bits: u32) -> Self {
        let width = width.min(MAX_FIELD_BITS);
        Self {
            width,
            bits: (u64::from(bits) & max_raw(width)) as u32,
        }
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn contains(&self, index: u8) -> bool {
        index < self.width && self.bits & (1 << index) != 0
    }

    /// Returns false when `index` is outside the bitmap.
    pub fn insert(&mut self, index: u8) -> bool {
        if index >= self.width {
            return false;
        }
        self.bits |= 1 << index;
        true
    }

    pub fn remove(&mut self, index: u8) {
        if index < self.width {
            self.bits &= !(1 << index);
        }
    }

    /// Set members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.width).filter(move |index| self.contains(*index))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    UInt(u32),
    Enum(EnumValue),
    Bitmap(Bitmap),
    Bool(bool),
    Temperature(f64),
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::UInt(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Bitmap> for FieldValue {
    fn from(value: Bitmap) -> Self {
        FieldValue::Bitmap(value)
    }
}

impl From<EnumValue> for FieldValue {
    fn from(value: EnumValue) -> Self {
        FieldValue::Enum(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Temperature(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::UInt(raw) => write!(f, "{}", raw),
            FieldValue::Enum(EnumValue { name: Some(name), .. }) => write!(f, "{}", name),
            FieldValue::Enum(EnumValue { raw, name: None }) => write!(f, "raw({})", raw),
            FieldValue::Bitmap(bitmap) => {
                write!(f, "{{")?;
                for (position, index) in bitmap.iter().enumerate() {
                    if position > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", index)?;
                }
                write!(f, "}}")
            }
            FieldValue::Bool(flag) => write!(f, "{}", flag),
            FieldValue::Temperature(degrees) => write!(f, "{}", degrees),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(field: &FieldType, bytes: &[u8]) -> Result<FieldValue, CodecError> {
        field.decode(&mut BitReader::new(bytes))
    }

    fn encode_one(field: &FieldType, value: &FieldValue) -> Result<Vec<u8>, CodecError> {
        let mut writer = BitWriter::new();
        field.encode(value, &mut writer)?;
        Ok(writer.into_bytes())
    }

    #[test]
    fn test_bitmap_membership() {
        let value = decode_one(&FieldType::bitmap(8), &[0b0000_0101]).unwrap();
        let FieldValue::Bitmap(bitmap) = value else {
            panic!("expected bitmap, got {:?}", value);
        };
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0, 2]);
        for index in [1, 3, 4, 5, 6, 7] {
            assert!(!bitmap.contains(index));
        }
        assert_eq!(bitmap.len(), 2);
    }

    #[test]
    fn test_bitmap_insert_remove() {
        let mut bitmap = Bitmap::zero(4);
        assert!(bitmap.insert(3));
        assert!(!bitmap.insert(4));
        assert_eq!(bitmap.bits(), 0b1000);
        bitmap.remove(3);
        assert!(bitmap.is_empty());
    }

    #[test]
    fn test_uint_out_of_range() {
        let err = encode_one(&FieldType::uint(2), &FieldValue::UInt(4)).unwrap_err();
        assert!(matches!(err, CodecError::OutOfRange { width: 2, .. }));
        assert_eq!(encode_one(&FieldType::uint(2), &FieldValue::UInt(3)).unwrap(), vec![0b1100_0000]);
    }

    #[test]
    fn test_enum_preserves_unmapped_raw() {
        let program = FieldType::enumeration(2, &[(0, "No"), (1, "Summer"), (2, "Winter")]);
        let value = decode_one(&program, &[0b1100_0000]).unwrap();
        assert_eq!(value, FieldValue::Enum(EnumValue::raw(3)));
        let FieldValue::Enum(decoded) = value else { unreachable!() };
        assert!(!decoded.is_known());
        // The raw value survives re-encoding
        assert_eq!(encode_one(&program, &value).unwrap(), vec![0b1100_0000]);

        let known = decode_one(&program, &[0b0100_0000]).unwrap();
        assert_eq!(known.to_string(), "Summer");
    }

    #[test]
    fn test_temperature_decode_negative() {
        let field = FieldType::temperature(8, 0.5);
        assert_eq!(decode_one(&field, &[0x2b]).unwrap(), FieldValue::Temperature(21.5));
        assert_eq!(decode_one(&field, &[0xfc]).unwrap(), FieldValue::Temperature(-2.0));
    }

    #[test]
    fn test_temperature_rounds_half_away_from_zero() {
        let field = FieldType::temperature(8, 0.5);
        // 21.25 / 0.5 = 42.5 -> 43
        assert_eq!(encode_one(&field, &FieldValue::Temperature(21.25)).unwrap(), vec![43]);
        // -0.25 / 0.5 = -0.5 -> -1
        assert_eq!(encode_one(&field, &FieldValue::Temperature(-0.25)).unwrap(), vec![0xff]);
    }

    #[test]
    fn test_temperature_range() {
        let field = FieldType::temperature(8, 0.5);
        assert!(encode_one(&field, &FieldValue::Temperature(63.5)).is_ok());
        assert!(encode_one(&field, &FieldValue::Temperature(-64.0)).is_ok());
        assert!(matches!(
            encode_one(&field, &FieldValue::Temperature(64.0)),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(encode_one(&field, &FieldValue::Temperature(f64::NAN)).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let err = encode_one(&FieldType::boolean(), &FieldValue::UInt(1)).unwrap_err();
        assert_eq!(err, CodecError::TypeMismatch { expected: "boolean" });
    }

    #[test]
    fn test_validate_enum_declarations() {
        assert_eq!(
            FieldType::enumeration(1, &[(0, "Off"), (2, "On")]).validate(),
            Err(FieldTypeError::EnumOverflow { raw: 2, width: 1 })
        );
        assert_eq!(
            FieldType::enumeration(2, &[(0, "Off"), (0, "On")]).validate(),
            Err(FieldTypeError::DuplicateRaw(0))
        );
        assert_eq!(FieldType::uint(0).validate(), Err(FieldTypeError::InvalidWidth(0)));
        assert_eq!(
            FieldType::temperature(8, 0.0).validate(),
            Err(FieldTypeError::InvalidScale(0.0))
        );
    }

    #[test]
    fn test_json_conversion() {
        let page = FieldType::enumeration(5, &[(0, "Button_page_1"), (29, "Clock_page")]);
        let value = page.value_from_json(&Value::from("Clock_page")).unwrap();
        assert_eq!(value, FieldValue::Enum(EnumValue::raw(29)));
        assert_eq!(page.value_to_json(&value), Value::from("Clock_page"));
        assert!(matches!(
            page.value_from_json(&Value::from("Nope")),
            Err(CodecError::UnknownVariant(_))
        ));

        let flags = FieldType::bitmap(4);
        let value = flags.value_from_json(&serde_json::json!([true, false, true])).unwrap();
        assert_eq!(value, FieldValue::Bitmap(Bitmap::from_bits(4, 0b0101)));
        assert_eq!(flags.value_to_json(&value), serde_json::json!([true, false, true, false]));

        assert!(FieldType::uint(4).value_from_json(&Value::from(16)).is_err());
        assert!(FieldType::boolean().value_from_json(&Value::from(1)).is_err());
    }

    #[test]
    fn test_bitmap_drops_bits_outside_width() {
        let bitmap = Bitmap::from_bits(4, 0x10);
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.len(), 0);
        assert_eq!(bitmap, Bitmap::zero(4));
        assert_eq!(Bitmap::from_bits(4, 0x1f).bits(), 0x0f);

        let wide = Bitmap::from_bits(40, u32::MAX);
        assert_eq!(wide.width(), 32);
        assert!(wide.contains(31));
    }

    #[test]
    fn test_unregistered_bad_widths_fail_cleanly() {
        let zero = FieldType::temperature(0, 0.5);
        assert_eq!(
            encode_one(&zero, &FieldValue::Temperature(1.0)),
            Err(CodecError::InvalidWidth(0))
        );
        assert_eq!(decode_one(&zero, &[0xff]), Err(CodecError::InvalidWidth(0)));

        let wide = FieldType::uint(40);
        assert_eq!(
            encode_one(&wide, &FieldValue::UInt(1)),
            Err(CodecError::InvalidWidth(40))
        );
        assert_eq!(decode_one(&wide, &[0xff; 8]), Err(CodecError::InvalidWidth(40)));
        assert_eq!(
            wide.value_from_json(&Value::from(1)),
            Err(CodecError::InvalidWidth(40))
        );
        assert_eq!(
            FieldType::uint(0).normalize(FieldValue::UInt(0)),
            Err(CodecError::InvalidWidth(0))
        );
    }
}
