//! JSON-lines protocol spoken by `velgate` to its TCP clients.
//!
//! Every line is one message tagged by `type`. A client first receives the
//! state of every module as `patch` lines, then all later patches and
//! outbound frames as they happen.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::{GatewayStats, StatePatch};
use crate::module::{Reply, ReplyBody, Verb};
use crate::protocol::{Frame, OutboundFrame};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A validated frame from the bus transport
    Frame(Frame),
    Request {
        address: u8,
        path: String,
        #[serde(default)]
        verb: Verb,
        #[serde(default)]
        body: Value,
    },
    Stats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Patch(StatePatch),
    Outbound(OutboundFrame),
    Reply {
        address: u8,
        status: u16,
        body: ReplyBody,
    },
    Stats(GatewayStats),
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn reply(address: u8, reply: Reply) -> Self {
        ServerMessage::Reply {
            address,
            status: reply.status,
            body: reply.body,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
