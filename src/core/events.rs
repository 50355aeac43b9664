use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::status::ReaderStatus;
use crate::core::utils::{encode_atr, hex_bytes, hex_opt};

/// Label carried by card events when none is configured
pub const DEFAULT_CARD_LABEL: &str = "Card Found";

/// Named event channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    ReaderStatus,
    CardEvent,
    /// Never carried by the dispatcher; command results go to the executor callback
    CommandResult,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::ReaderStatus => "reader-status",
            Channel::CardEvent => "card-event",
            Channel::CommandResult => "command-result",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One detected reader/card transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub reader: String,
    pub status: ReaderStatus,
    #[serde(with = "hex_opt")]
    pub atr: Option<Vec<u8>>,
    pub observed_at: DateTime<Utc>,
}

impl StatusChangeEvent {
    pub fn new(reader: impl Into<String>, status: ReaderStatus, atr: Option<Vec<u8>>) -> Self {
        Self {
            reader: reader.into(),
            status,
            atr,
            observed_at: Utc::now(),
        }
    }

    /// A card answered with an ATR
    pub fn card_present(&self) -> bool {
        self.status.implies_card() && self.atr.is_some()
    }

    pub fn atr_hex(&self) -> Option<String> {
        self.atr.as_deref().map(encode_atr)
    }
}

impl fmt::Display for StatusChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reader, self.status)?;
        if let Some(atr) = self.atr_hex() {
            write!(f, " (ATR: {atr})")?;
        }
        Ok(())
    }
}

/// A freshly read ATR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardEvent {
    pub reader: String,
    #[serde(with = "hex_bytes")]
    pub atr: Vec<u8>,
    pub label: String,
}

impl CardEvent {
    pub fn atr_hex(&self) -> String {
        encode_atr(&self.atr)
    }
}

/// Payloads carried by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "kebab-case")]
pub enum Event {
    ReaderStatus(StatusChangeEvent),
    CardEvent(CardEvent),
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Event::ReaderStatus(_) => Channel::ReaderStatus,
            Event::CardEvent(_) => Channel::CardEvent,
        }
    }
}
