//! JSON-over-text wire protocol of the push-notification service
//!
//! Outbound and inbound frames are closed enums tagged by their `"type"`
//! field, so every message kind is decoded once at the boundary and matched
//! exhaustively afterwards.

use crate::constants::NONCE_LENGTH;
use crate::errors::{ErrorContext, Result};
use crate::topic::TopicKey;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic list plus the credentials the service checks on (un)subscribe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub topics: Vec<TopicKey>,
    pub auth_token: String,
}

/// Frames this client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum OutboundMessage {
    Ping,
    Listen {
        data: SubscriptionRequest,
        nonce: String,
    },
    Unlisten {
        data: SubscriptionRequest,
        nonce: String,
    },
}

impl OutboundMessage {
    /// Subscribe request carrying a fresh nonce
    pub fn listen(topics: Vec<TopicKey>, auth_token: &str) -> Self {
        OutboundMessage::Listen {
            data: SubscriptionRequest {
                topics,
                auth_token: auth_token.to_string(),
            },
            nonce: create_nonce(NONCE_LENGTH),
        }
    }

    /// Unsubscribe request carrying a fresh nonce
    pub fn unlisten(topics: Vec<TopicKey>, auth_token: &str) -> Self {
        OutboundMessage::Unlisten {
            data: SubscriptionRequest {
                topics,
                auth_token: auth_token.to_string(),
            },
            nonce: create_nonce(NONCE_LENGTH),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Ping => "PING",
            OutboundMessage::Listen { .. } => "LISTEN",
            OutboundMessage::Unlisten { .. } => "UNLISTEN",
        }
    }

    /// Compact JSON text frame
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Body of a `MESSAGE` push
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushData {
    pub topic: TopicKey,
    /// The payload, itself JSON encoded as a string
    pub message: String,
}

impl PushData {
    pub fn decode_payload(&self) -> Result<Value> {
        serde_json::from_str(&self.message).with_protocol_context(&format!(
            "Invalid JSON payload on topic {}",
            self.topic
        ))
    }
}

/// Frames the service sends
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum InboundMessage {
    Pong,
    Response {
        #[serde(default)]
        nonce: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Reconnect,
    Message {
        data: PushData,
    },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).with_protocol_context("Undecodable inbound frame")
    }
}

/// Random ASCII letters and digits, used to correlate control messages
pub fn create_nonce(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
