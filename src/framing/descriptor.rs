//! Packet descriptors: identity-comparable matchers over byte windows.

use regex::Regex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Signature of a packet predicate.
pub type PacketEvaluator = dyn Fn(&[u8]) -> bool + Send + Sync;

/// Reasons a descriptor cannot be built.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("A delimited descriptor needs a prefix, a suffix, or both")]
    EmptyDelimiters,

    #[error("Invalid packet pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// How the descriptor was built. Kept for introspection only; matching
/// always goes through the evaluator.
#[derive(Debug, Clone)]
pub enum DescriptorKind {
    /// Packets equal exactly these bytes.
    Fixed(Vec<u8>),
    /// Packets start with `prefix` and end with `suffix`. Either may be empty.
    Delimited { prefix: Vec<u8>, suffix: Vec<u8> },
    /// Packets are UTF-8 text with a match for the pattern at offset 0.
    Pattern(Regex),
    /// Packets are whatever a caller-supplied closure accepts.
    Predicate,
}

/// Describes what a complete packet looks like.
///
/// Descriptors are immutable and compare by identity: two descriptors built
/// from the same arguments are still different descriptors, while clones of
/// one descriptor are equal.
#[derive(Clone)]
pub struct PacketDescriptor {
    id: Uuid,
    maximum_packet_length: usize,
    kind: DescriptorKind,
    user_info: Option<serde_json::Value>,
    evaluator: Arc<PacketEvaluator>,
}

impl PacketDescriptor {
    fn build(
        maximum_packet_length: usize,
        kind: DescriptorKind,
        evaluator: Arc<PacketEvaluator>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            maximum_packet_length,
            kind,
            user_info: None,
            evaluator,
        }
    }

    /// Packets that are exactly `data`. The maximum length is `data.len()`.
    pub fn fixed(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let expected = data.clone();
        Self::build(
            data.len(),
            DescriptorKind::Fixed(data),
            Arc::new(move |window: &[u8]| window == expected.as_slice()),
        )
    }

    /// Packets delimited by `prefix` and/or `suffix`.
    pub fn delimited(
        prefix: impl Into<Vec<u8>>,
        suffix: impl Into<Vec<u8>>,
        maximum_packet_length: usize,
    ) -> Result<Self, DescriptorError> {
        let prefix = prefix.into();
        let suffix = suffix.into();
        if prefix.is_empty() && suffix.is_empty() {
            return Err(DescriptorError::EmptyDelimiters);
        }

        let (p, s) = (prefix.clone(), suffix.clone());
        let evaluator = move |window: &[u8]| {
            !window.is_empty() && window.starts_with(&p) && window.ends_with(&s)
        };
        Ok(Self::build(
            maximum_packet_length,
            DescriptorKind::Delimited { prefix, suffix },
            Arc::new(evaluator),
        ))
    }

    /// [`PacketDescriptor::delimited`] with UTF-8 delimiters.
    pub fn delimited_str(
        prefix: &str,
        suffix: &str,
        maximum_packet_length: usize,
    ) -> Result<Self, DescriptorError> {
        Self::delimited(prefix.as_bytes(), suffix.as_bytes(), maximum_packet_length)
    }

    /// Packets that decode as UTF-8 and have a match for `pattern` starting
    /// at the first character.
    pub fn pattern(pattern: Regex, maximum_packet_length: usize) -> Self {
        let regex = pattern.clone();
        let evaluator = move |window: &[u8]| match std::str::from_utf8(window) {
            Ok(text) => regex.find(text).is_some_and(|m| m.start() == 0),
            Err(_) => false,
        };
        Self::build(
            maximum_packet_length,
            DescriptorKind::Pattern(pattern),
            Arc::new(evaluator),
        )
    }

    /// Compile `pattern` and build a pattern descriptor from it.
    pub fn pattern_str(
        pattern: &str,
        maximum_packet_length: usize,
    ) -> Result<Self, DescriptorError> {
        Ok(Self::pattern(Regex::new(pattern)?, maximum_packet_length))
    }

    /// Packets accepted by an arbitrary predicate.
    pub fn predicate<F>(maximum_packet_length: usize, evaluator: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        Self::build(
            maximum_packet_length,
            DescriptorKind::Predicate,
            Arc::new(evaluator),
        )
    }

    /// Attach an opaque caller value. The descriptor keeps its identity.
    pub fn with_user_info(mut self, user_info: serde_json::Value) -> Self {
        self.user_info = Some(user_info);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn maximum_packet_length(&self) -> usize {
        self.maximum_packet_length
    }

    pub fn kind(&self) -> &DescriptorKind {
        &self.kind
    }

    pub fn user_info(&self) -> Option<&serde_json::Value> {
        self.user_info.as_ref()
    }

    /// The fixed payload, for descriptors built with [`PacketDescriptor::fixed`].
    pub fn packet_data(&self) -> Option<&[u8]> {
        match &self.kind {
            DescriptorKind::Fixed(data) => Some(data),
            _ => None,
        }
    }

    pub fn prefix(&self) -> Option<&[u8]> {
        match &self.kind {
            DescriptorKind::Delimited { prefix, .. } if !prefix.is_empty() => Some(prefix),
            _ => None,
        }
    }

    pub fn suffix(&self) -> Option<&[u8]> {
        match &self.kind {
            DescriptorKind::Delimited { suffix, .. } if !suffix.is_empty() => Some(suffix),
            _ => None,
        }
    }

    pub fn regex(&self) -> Option<&Regex> {
        match &self.kind {
            DescriptorKind::Pattern(regex) => Some(regex),
            _ => None,
        }
    }

    /// Whether `window` is, in its entirety, a valid packet.
    pub fn is_valid_packet(&self, window: &[u8]) -> bool {
        (self.evaluator)(window)
    }

    /// Find the shortest trailing window of `buffer` that is a valid packet.
    pub fn match_trailing<'a>(&self, buffer: &'a [u8]) -> Option<&'a [u8]> {
        (1..=buffer.len())
            .map(|len| &buffer[buffer.len() - len..])
            .find(|window| self.is_valid_packet(window))
    }
}

impl PartialEq for PacketDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PacketDescriptor {}

impl Hash for PacketDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for PacketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketDescriptor")
            .field("id", &self.id)
            .field("maximum_packet_length", &self.maximum_packet_length)
            .field("kind", &self.kind)
            .field("user_info", &self.user_info)
            .finish()
    }
}
