//! `(command, data length) → schema` decision table.
//!
//! Several device classes answer the same command with different layouts that
//! can only be told apart by length. The table is validated while it is built;
//! after [`RegistryBuilder::build`] it is immutable and shared through `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::field::CodecError;
use crate::protocol::{Frame, OutboundFrame, Payload};
use crate::schema::{Message, MessageSchema, SchemaError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// No schema matches; the raw frame is kept for diagnostics.
    #[error("unrecognized frame {frame}")]
    UnknownFrame { frame: Frame },
    #[error("frame {frame} as `{schema}`: {source}")]
    Field {
        schema: &'static str,
        frame: Frame,
        #[source]
        source: CodecError,
    },
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    by_key: BTreeMap<(u8, usize), Arc<MessageSchema>>,
    by_name: HashMap<&'static str, Arc<MessageSchema>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a schema. Ambiguous keys are rejected here so that
    /// resolution never has to guess.
    pub fn register(&mut self, schema: MessageSchema) -> Result<Arc<MessageSchema>, SchemaError> {
        schema.validate()?;

        let key = (schema.command(), schema.data_len());
        if let Some(existing) = self.by_key.get(&key) {
            return Err(SchemaError::DuplicateKey {
                command: key.0,
                data_len: key.1,
                existing: existing.name(),
                rejected: schema.name(),
            });
        }
        if self.by_name.contains_key(schema.name()) {
            return Err(SchemaError::DuplicateName(schema.name()));
        }

        let schema = Arc::new(schema);
        debug!(
            schema = schema.name(),
            command = %format!("0x{:02x}", key.0),
            data_len = key.1,
            "registered message schema"
        );
        self.by_key.insert(key, Arc::clone(&schema));
        self.by_name.insert(schema.name(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn register_all(
        &mut self,
        schemas: impl IntoIterator<Item = MessageSchema>,
    ) -> Result<(), SchemaError> {
        for schema in schemas {
            self.register(schema)?;
        }
        Ok(())
    }

    pub fn build(self) -> MessageRegistry {
        MessageRegistry {
            by_key: self.by_key,
            by_name: self.by_name,
        }
    }
}

#[derive(Debug)]
pub struct MessageRegistry {
    by_key: BTreeMap<(u8, usize), Arc<MessageSchema>>,
    by_name: HashMap<&'static str, Arc<MessageSchema>>,
}

impl MessageRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// `data_len` counts the command byte, as on the wire.
    pub fn resolve(&self, command: u8, data_len: usize) -> Option<&Arc<MessageSchema>> {
        self.by_key.get(&(command, data_len))
    }

    pub fn schema(&self, name: &str) -> Option<&Arc<MessageSchema>> {
        self.by_name.get(name)
    }

    /// All schemas ordered by command, then data length.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<MessageSchema>> {
        self.by_key.values()
    }

    /// Schemas registered for `command`, whatever their length.
    pub fn variants(&self, command: u8) -> impl Iterator<Item = &Arc<MessageSchema>> {
        self.by_key
            .range((command, 0)..=(command, usize::MAX))
            .map(|(_, schema)| schema)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn decode(&self, frame: &Frame) -> Result<Message, DecodeError> {
        let schema = self
            .resolve(frame.command, frame.data_len())
            .ok_or_else(|| DecodeError::UnknownFrame {
                frame: frame.clone(),
            })?;

        schema
            .decode(&frame.payload)
            .map_err(|source| DecodeError::Field {
                schema: schema.name(),
                frame: frame.clone(),
                source,
            })
    }

    pub fn encode(&self, address: u8, message: &Message) -> Result<OutboundFrame, CodecError> {
        let bytes = message.encode()?;
        let payload = Payload::from_slice(&bytes).map_err(|()| CodecError::LengthMismatch {
            schema: message.name(),
            expected: message.schema().payload_len(),
            actual: bytes.len(),
        })?;

        Ok(OutboundFrame {
            address,
            priority: message.schema().priority(),
            command: message.command(),
            payload,
        })
    }
}
