//! Declarative message layouts.
//!
//! A [`MessageSchema`] is an ordered list of fields with defaults. Declaration
//! order is wire order; the field list is a plain `Vec` so nothing reorders it.

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::bits::{BitReader, BitWriter};
use crate::field::{CodecError, FieldType, FieldTypeError, FieldValue};
use crate::protocol::MAX_PAYLOAD_LEN;

pub const PRIORITY_HIGH: u8 = 0;
pub const PRIORITY_LOW: u8 = 3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("`{schema}`: fields total {bits} bits, not a whole number of bytes")]
    Misaligned { schema: &'static str, bits: usize },
    #[error("`{schema}`: payload of {bytes} bytes exceeds the 7 byte maximum")]
    TooLong { schema: &'static str, bytes: usize },
    #[error("`{schema}`: priority {priority} does not fit in 2 bits")]
    InvalidPriority { schema: &'static str, priority: u8 },
    #[error("`{schema}`: field `{field}` declared twice")]
    DuplicateField {
        schema: &'static str,
        field: &'static str,
    },
    #[error("`{schema}`: field `{field}`: {source}")]
    FieldType {
        schema: &'static str,
        field: &'static str,
        #[source]
        source: FieldTypeError,
    },
    #[error("`{schema}`: default of `{field}`: {source}")]
    InvalidDefault {
        schema: &'static str,
        field: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("command 0x{command:02x} with data length {data_len} already taken by `{existing}`, rejecting `{rejected}`")]
    DuplicateKey {
        command: u8,
        data_len: usize,
        existing: &'static str,
        rejected: &'static str,
    },
    #[error("schema name `{0}` registered twice")]
    DuplicateName(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub default: FieldValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageSchema {
    name: &'static str,
    priority: u8,
    command: u8,
    fields: Vec<FieldSpec>,
}

#[derive(Debug)]
pub struct SchemaBuilder {
    schema: MessageSchema,
}

impl SchemaBuilder {
    pub fn priority(mut self, priority: u8) -> Self {
        self.schema.priority = priority;
        self
    }

    pub fn field(
        mut self,
        name: &'static str,
        field_type: FieldType,
        default: impl Into<FieldValue>,
    ) -> Self {
        self.schema.fields.push(FieldSpec {
            name,
            field_type,
            default: default.into(),
        });
        self
    }

    /// Consistency is checked when the schema is registered, see
    /// [`MessageSchema::validate`].
    pub fn build(self) -> MessageSchema {
        self.schema
    }
}

impl MessageSchema {
    pub fn builder(name: &'static str, command: u8) -> SchemaBuilder {
        SchemaBuilder {
            schema: MessageSchema {
                name,
                priority: PRIORITY_LOW,
                command,
                fields: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn payload_bits(&self) -> usize {
        self.fields
            .iter()
            .map(|field| usize::from(field.field_type.width()))
            .sum()
    }

    pub fn payload_len(&self) -> usize {
        self.payload_bits() / 8
    }

    /// Bytes on the wire after the header: the command byte plus payload.
    pub fn data_len(&self) -> usize {
        1 + self.payload_len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let schema = self.name;
        if self.priority > PRIORITY_LOW {
            return Err(SchemaError::InvalidPriority {
                schema,
                priority: self.priority,
            });
        }

        for (index, field) in self.fields.iter().enumerate() {
            if self.fields[..index].iter().any(|other| other.name == field.name) {
                return Err(SchemaError::DuplicateField {
                    schema,
                    field: field.name,
                });
            }
            field
                .field_type
                .validate()
                .map_err(|source| SchemaError::FieldType {
                    schema,
                    field: field.name,
                    source,
                })?;
            field
                .field_type
                .normalize(field.default.clone())
                .map_err(|source| SchemaError::InvalidDefault {
                    schema,
                    field: field.name,
                    source,
                })?;
        }

        let bits = self.payload_bits();
        if bits % 8 != 0 {
            return Err(SchemaError::Misaligned { schema, bits });
        }
        if bits / 8 > MAX_PAYLOAD_LEN {
            return Err(SchemaError::TooLong {
                schema,
                bytes: bits / 8,
            });
        }
        Ok(())
    }

    /// Decode a payload (the bytes following the command byte).
    pub fn decode(self: &Arc<Self>, payload: &[u8]) -> Result<Message, CodecError> {
        if payload.len() != self.payload_len() {
            return Err(CodecError::LengthMismatch {
                schema: self.name,
                expected: self.payload_len(),
                actual: payload.len(),
            });
        }

        let mut reader = BitReader::new(payload);
        let values = self
            .fields
            .iter()
            .map(|field| {
                field
                    .field_type
                    .decode(&mut reader)
                    .map_err(|e| e.in_field(field.name))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug_assert_eq!(reader.remaining(), 0);

        Ok(Message {
            schema: Arc::clone(self),
            values,
        })
    }

    pub fn encode_values(&self, values: &[FieldValue]) -> Result<Vec<u8>, CodecError> {
        debug_assert_eq!(values.len(), self.fields.len());

        let mut writer = BitWriter::new();
        for (field, value) in self.fields.iter().zip(values) {
            field
                .field_type
                .encode(value, &mut writer)
                .map_err(|e| e.in_field(field.name))?;
        }
        Ok(writer.into_bytes())
    }

    /// Outbound message carrying every field's declared default.
    pub fn default_message(self: &Arc<Self>) -> Message {
        let values = self
            .fields
            .iter()
            .map(|field| {
                field
                    .field_type
                    .normalize(field.default.clone())
                    .unwrap_or_else(|_| field.default.clone())
            })
            .collect();

        Message {
            schema: Arc::clone(self),
            values,
        }
    }
}

/// A resolved schema with one concrete value per field.
#[derive(Debug, Clone)]
pub struct Message {
    schema: Arc<MessageSchema>,
    values: Vec<FieldValue>,
}

impl Message {
    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    pub fn name(&self) -> &'static str {
        self.schema.name
    }

    pub fn command(&self) -> u8 {
        self.schema.command
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.schema
            .field_index(name)
            .map(|index| &self.values[index])
    }

    /// Replace one field, checking the value against the field type.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<(), CodecError> {
        let index = self
            .schema
            .field_index(name)
            .ok_or_else(|| CodecError::UnknownField(name.to_string()))?;
        let field = &self.schema.fields[index];
        self.values[index] = field
            .field_type
            .normalize(value.into())
            .map_err(|e| e.in_field(field.name))?;
        Ok(())
    }

    /// Like [`Message::set`], taking the value as JSON.
    pub fn set_json(&mut self, name: &str, json: &Value) -> Result<(), CodecError> {
        let index = self
            .schema
            .field_index(name)
            .ok_or_else(|| CodecError::UnknownField(name.to_string()))?;
        let field = &self.schema.fields[index];
        self.values[index] = field
            .field_type
            .value_from_json(json)
            .map_err(|e| e.in_field(field.name))?;
        Ok(())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&FieldSpec, &FieldValue)> {
        self.schema.fields.iter().zip(self.values.iter())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.schema.encode_values(&self.values)
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for (field, value) in self.fields() {
            object.insert(field.name.to_string(), field.field_type.value_to_json(value));
        }
        Value::Object(object)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.schema, &other.schema) || self.schema == other.schema)
            && self.values == other.values
    }
}
