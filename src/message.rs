use crate::error::Error;
use log::warn;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// Well-known property keys. Unknown keys pass through untouched.
pub const PROFILE: &str = "Profile";
pub const CLIENT: &str = "client";
pub const REV: &str = "rev";
pub const ERROR_DOMAIN: &str = "Error-Domain";
pub const ERROR_CODE: &str = "Error-Code";
pub const SEQUENCE: &str = "sequence";
pub const ID: &str = "id";
pub const DIGEST: &str = "digest";
pub const DOC_ID: &str = "docID";

// Flag byte layout: the low three bits carry the message kind, the rest are
// flag bits.
pub const KIND_MASK: u8 = 0x07;
pub const COMPRESSED: u8 = 0x08;
pub const URGENT: u8 = 0x10;
pub const NO_REPLY: u8 = 0x20;
pub const MORE_COMING: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
    Error,
    AckRequest,
    AckResponse,
    /// Reserved or future kind codes. Logged on receipt, never an error.
    Unknown,
}

impl MessageType {
    pub fn from_flags(flags: u8) -> Self {
        match flags & KIND_MASK {
            0 => MessageType::Request,
            1 => MessageType::Response,
            2 => MessageType::Error,
            4 => MessageType::AckRequest,
            5 => MessageType::AckResponse,
            _ => MessageType::Unknown,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::Request => 0,
            MessageType::Response => 1,
            MessageType::Error => 2,
            MessageType::AckRequest => 4,
            MessageType::AckResponse => 5,
            MessageType::Unknown => 7,
        }
    }
}

/// Insertion-ordered string properties of a BLIP message.
///
/// Serialized on the wire as a NUL-delimited `k\0v\0k\0v\0` sequence with a
/// trailing NUL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties(Vec<(String, String)>);

impl Properties {
    pub fn new() -> Self {
        Properties(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The wire form. An empty map still carries its trailing NUL.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.0 {
            out.extend_from_slice(key.as_bytes());
            out.push(0);
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
        if out.is_empty() {
            out.push(0);
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let data = match data.last() {
            Some(0) => &data[..data.len() - 1],
            _ => data,
        };
        if data.is_empty() {
            return Ok(Properties::new());
        }
        let tokens: Vec<&[u8]> = data.split(|&byte| byte == 0).collect();
        if tokens.len() % 2 != 0 {
            return Err(Error::MalformedProperties);
        }
        let mut pairs = Vec::with_capacity(tokens.len() / 2);
        for pair in tokens.chunks(2) {
            let key = String::from_utf8(pair[0].to_vec())?;
            let value = String::from_utf8(pair[1].to_vec())?;
            pairs.push((key, value));
        }
        Ok(Properties(pairs))
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Properties {
    fn from(pairs: [(K, V); N]) -> Self {
        Properties(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One BLIP message: a numbered request, response, error or ack, with its
/// flag bits, properties and opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlipMessage {
    pub number: u64,
    pub kind: MessageType,
    pub compressed: bool,
    pub urgent: bool,
    pub no_reply: bool,
    pub more_coming: bool,
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Default for BlipMessage {
    fn default() -> Self {
        BlipMessage {
            number: 0,
            kind: MessageType::Request,
            compressed: false,
            urgent: false,
            no_reply: false,
            more_coming: false,
            properties: Properties::new(),
            body: Vec::new(),
        }
    }
}

impl BlipMessage {
    pub fn new() -> Self {
        BlipMessage::default()
    }

    /// Composes the outbound flag byte from the kind and the flag bits.
    pub fn flags(&self) -> u8 {
        let mut flags = self.kind.as_u8();
        if self.compressed {
            flags |= COMPRESSED;
        }
        if self.urgent {
            flags |= URGENT;
        }
        if self.no_reply {
            flags |= NO_REPLY;
        }
        if self.more_coming {
            flags |= MORE_COMING;
        }
        flags
    }

    pub fn apply_flags(&mut self, flags: u8) {
        self.kind = MessageType::from_flags(flags);
        if self.kind == MessageType::Unknown {
            warn!(
                "message #{}: unknown kind code {}",
                self.number,
                flags & KIND_MASK
            );
        }
        self.compressed = flags & COMPRESSED != 0;
        self.urgent = flags & URGENT != 0;
        self.no_reply = flags & NO_REPLY != 0;
        self.more_coming = flags & MORE_COMING != 0;
    }

    pub fn body_as_string(&self) -> Result<String, Error> {
        Ok(String::from_utf8(self.body.clone())?)
    }
}

/// Monotonic message-number source, shared between the caller and the pump.
///
/// With a set size of `s`, each value is handed out `s` consecutive times
/// before the counter advances, so that multi-part emissions can share one
/// number. Lock-free.
#[derive(Debug)]
pub struct SequenceCounter {
    count: AtomicU64,
    set_size: u32,
    remaining: AtomicU32,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        SequenceCounter::new()
    }
}

impl SequenceCounter {
    pub fn new() -> Self {
        SequenceCounter::with_set_size(1)
    }

    pub fn with_set_size(set_size: u32) -> Self {
        let set_size = set_size.max(1);
        SequenceCounter {
            count: AtomicU64::new(1),
            set_size,
            remaining: AtomicU32::new(set_size),
        }
    }

    pub fn next(&self) -> u64 {
        loop {
            let remaining = self.remaining.load(Ordering::Acquire);
            if remaining == 1 {
                if self
                    .remaining
                    .compare_exchange(1, self.set_size, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return self.count.fetch_add(1, Ordering::AcqRel);
                }
            } else if self
                .remaining
                .compare_exchange(remaining, remaining - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return self.count.load(Ordering::Acquire);
            }
        }
    }

    pub fn reset(&self, value: u64) {
        self.count.store(value, Ordering::Release);
        self.remaining.store(self.set_size, Ordering::Release);
    }
}
