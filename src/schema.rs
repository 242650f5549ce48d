//! Schema Registry (spec.md C1, §4.1).
//!
//! Parses the schema configuration once into an immutable, `Send + Sync`
//! registry. Wire-type strings are resolved to `(width, decode_fn)` pairs
//! at construction time (spec.md §4.1) so the codec never has to match on
//! a string during decode.

use crate::error::SchemaError;
use std::collections::HashMap;

/// One of the fixed set of wire-level numeric types (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Bool,
}

impl WireType {
    /// Width in bytes on the wire.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            WireType::U8 | WireType::I8 | WireType::Bool => 1,
            WireType::U16 | WireType::I16 => 2,
            WireType::U32 | WireType::I32 | WireType::F32 => 4,
            WireType::U64 | WireType::I64 | WireType::F64 => 8,
        }
    }

    /// Decode a value of this type from a little-endian byte slice of
    /// exactly `width()` bytes, widening to `f64` (spec.md's sample value
    /// is a numeric scalar; see `Sample`).
    ///
    /// # Panics
    /// Panics if `bytes.len() != self.width()`. Callers (the codec) always
    /// slice an exact-width chunk before calling this.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> f64 {
        assert_eq!(bytes.len(), self.width());
        match self {
            WireType::U8 => bytes[0] as f64,
            WireType::I8 => (bytes[0] as i8) as f64,
            WireType::Bool => f64::from(bytes[0] != 0),
            WireType::U16 => u16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            WireType::I16 => i16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            WireType::U32 => u32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            WireType::I32 => i32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            WireType::F32 => f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            WireType::U64 => u64::from_le_bytes(bytes.try_into().unwrap()) as f64,
            WireType::I64 => i64::from_le_bytes(bytes.try_into().unwrap()) as f64,
            WireType::F64 => f64::from_le_bytes(bytes.try_into().unwrap()),
        }
    }

    fn from_str(s: &str) -> Result<Self, SchemaError> {
        match s {
            "u8" => Ok(WireType::U8),
            "i8" => Ok(WireType::I8),
            "u16" => Ok(WireType::U16),
            "i16" => Ok(WireType::I16),
            "u32" => Ok(WireType::U32),
            "i32" => Ok(WireType::I32),
            "u64" => Ok(WireType::U64),
            "i64" => Ok(WireType::I64),
            "f32" => Ok(WireType::F32),
            "f64" => Ok(WireType::F64),
            "bool" => Ok(WireType::Bool),
            other => Err(SchemaError::UnknownWireType(other.to_owned())),
        }
    }
}

/// One field in a PDU descriptor, after resolving its wire type string.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub wire_type: WireType,
}

/// A fully-resolved PDU descriptor (spec.md §3).
#[derive(Debug, Clone)]
pub struct PduDescriptor {
    pub pdu_id: u8,
    pub name: String,
    /// Fields *after* the leading `valid_bitfield`, in wire order.
    pub fields: Vec<FieldDescriptor>,
    /// Sum of wire widths for `fields`, i.e. the length to read after the
    /// bitfield (spec.md §4.2's "Required length").
    pub fixed_length: usize,
    /// Index of a field literally named `epoch` of type `f64`, if any
    /// (spec.md §4.2 "Epoch assignment").
    pub epoch_field_index: Option<usize>,
}

impl PduDescriptor {
    /// Total bytes on the wire after the `[start_byte][pdu_id]` prefix:
    /// 4 bytes for the bitfield plus `fixed_length`.
    #[must_use]
    pub fn body_length(&self) -> usize {
        4 + self.fixed_length
    }
}

/// Sensor metadata (spec.md §3).
#[derive(Debug, Clone)]
pub struct SensorMeta {
    pub group: String,
    pub min: f64,
    pub max: f64,
    pub on_dash: bool,
    pub enable: bool,
}

/// The immutable, process-wide schema (spec.md C1).
#[derive(Debug, Clone)]
pub struct Schema {
    start_byte: u8,
    pdus_by_id: HashMap<u8, PduDescriptor>,
    sensors: HashMap<String, SensorMeta>,
}

/// Raw, pre-validation description of one PDU as it appears in
/// configuration: an ordered list of `(field_name, wire_type_str)`, the
/// first of which must be the validity bitfield.
pub struct RawPdu<'a> {
    pub name: &'a str,
    pub pdu_id: u8,
    pub fields: &'a [(&'a str, &'a str)],
}

impl Schema {
    /// Build the registry from already-parsed configuration pieces. This
    /// is the single validation point (spec.md §3 invariants): unknown
    /// wire types, duplicate `pdu_id`s, `fixed_length > 255`, and PDU
    /// fields with no matching sensor entry all fail construction.
    pub fn build(
        start_byte: u8,
        raw_pdus: &[RawPdu<'_>],
        sensors: HashMap<String, SensorMeta>,
    ) -> Result<Self, SchemaError> {
        let mut pdus_by_id = HashMap::new();

        for raw in raw_pdus {
            if raw.fields.is_empty() {
                return Err(SchemaError::EmptyPdu(raw.name.to_owned()));
            }
            let (bitfield_name, bitfield_type) = raw.fields[0];
            if WireType::from_str(bitfield_type)? != WireType::U32 {
                return Err(SchemaError::MissingValidBitfield(raw.name.to_owned()));
            }
            let _ = bitfield_name;

            let mut fields = Vec::with_capacity(raw.fields.len() - 1);
            let mut fixed_length = 0usize;
            let mut epoch_field_index = None;
            for (i, (field_name, type_str)) in raw.fields[1..].iter().enumerate() {
                let wire_type = WireType::from_str(type_str)?;
                let is_epoch = *field_name == "epoch" && wire_type == WireType::F64;
                if is_epoch {
                    epoch_field_index = Some(i);
                } else if !sensors.contains_key(*field_name) {
                    return Err(SchemaError::UnknownSensorField {
                        pdu: raw.name.to_owned(),
                        field: (*field_name).to_owned(),
                    });
                }
                fixed_length += wire_type.width();
                fields.push(FieldDescriptor {
                    name: (*field_name).to_owned(),
                    wire_type,
                });
            }

            if 4 + fixed_length > 255 {
                return Err(SchemaError::FixedLengthOverflow {
                    pdu: raw.name.to_owned(),
                    len: 4 + fixed_length,
                });
            }

            let descriptor = PduDescriptor {
                pdu_id: raw.pdu_id,
                name: raw.name.to_owned(),
                fields,
                fixed_length,
                epoch_field_index,
            };

            if pdus_by_id.insert(raw.pdu_id, descriptor).is_some() {
                return Err(SchemaError::DuplicatePduId(raw.pdu_id));
            }
        }

        Ok(Schema {
            start_byte,
            pdus_by_id,
            sensors,
        })
    }

    #[must_use]
    pub fn start_byte(&self) -> u8 {
        self.start_byte
    }

    #[must_use]
    pub fn lookup(&self, pdu_id: u8) -> Option<&PduDescriptor> {
        self.pdus_by_id.get(&pdu_id)
    }

    pub fn iter_pdus(&self) -> impl Iterator<Item = &PduDescriptor> {
        self.pdus_by_id.values()
    }

    #[must_use]
    pub fn sensor_meta(&self, name: &str) -> Option<&SensorMeta> {
        self.sensors.get(name)
    }

    pub fn iter_sensors(&self) -> impl Iterator<Item = (&str, &SensorMeta)> {
        self.sensors.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensors(names: &[&str]) -> HashMap<String, SensorMeta> {
        names
            .iter()
            .map(|n| {
                (
                    (*n).to_owned(),
                    SensorMeta {
                        group: "core".to_owned(),
                        min: 0.0,
                        max: 100.0,
                        on_dash: true,
                        enable: true,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn builds_valid_schema() {
        let raw = [RawPdu {
            name: "CORE",
            pdu_id: 0,
            fields: &[
                ("valid_bitfield", "u32"),
                ("rpm", "u16"),
                ("water", "u16"),
            ],
        }];
        let schema = Schema::build(0x01, &raw, sensors(&["rpm", "water"])).unwrap();
        let pdu = schema.lookup(0).unwrap();
        assert_eq!(pdu.name, "CORE");
        assert_eq!(pdu.fixed_length, 4);
        assert_eq!(schema.start_byte(), 0x01);
    }

    #[test]
    fn rejects_unknown_wire_type() {
        let raw = [RawPdu {
            name: "CORE",
            pdu_id: 0,
            fields: &[("valid_bitfield", "u32"), ("rpm", "u24")],
        }];
        let err = Schema::build(0x01, &raw, sensors(&["rpm"])).unwrap_err();
        assert_eq!(err, SchemaError::UnknownWireType("u24".to_owned()));
    }

    #[test]
    fn rejects_duplicate_pdu_id() {
        let raw = [
            RawPdu {
                name: "A",
                pdu_id: 0,
                fields: &[("valid_bitfield", "u32"), ("rpm", "u16")],
            },
            RawPdu {
                name: "B",
                pdu_id: 0,
                fields: &[("valid_bitfield", "u32"), ("water", "u16")],
            },
        ];
        let err = Schema::build(0x01, &raw, sensors(&["rpm", "water"])).unwrap_err();
        assert_eq!(err, SchemaError::DuplicatePduId(0));
    }

    #[test]
    fn rejects_field_without_sensor_entry() {
        let raw = [RawPdu {
            name: "A",
            pdu_id: 0,
            fields: &[("valid_bitfield", "u32"), ("rpm", "u16")],
        }];
        let err = Schema::build(0x01, &raw, sensors(&[])).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownSensorField {
                pdu: "A".to_owned(),
                field: "rpm".to_owned()
            }
        );
    }

    #[test]
    fn rejects_oversized_fixed_length() {
        let fields: Vec<(&str, &str)> = std::iter::once(("valid_bitfield", "u32"))
            .chain((0..40).map(|_| ("rpm", "u64")))
            .collect();
        let raw = [RawPdu {
            name: "BIG",
            pdu_id: 0,
            fields: &fields,
        }];
        let err = Schema::build(0x01, &raw, sensors(&["rpm"])).unwrap_err();
        assert!(matches!(err, SchemaError::FixedLengthOverflow { .. }));
    }
}
