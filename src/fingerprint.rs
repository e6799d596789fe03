//! Request fingerprinting.
//!
//! A request is reduced to a [`CanonicalRequest`] (tool names sorted and
//! de-duplicated, message order kept) and then hashed with SHA-256. Every
//! field is written length-prefixed, so no message content can imitate a
//! field boundary.

use crate::request::{InvocationRequest, Message, SamplingParams};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain tag mixed into every hash; bump when the canonical layout changes.
const FINGERPRINT_DOMAIN: &str = "llm-cache-kit/fingerprint/v1";

/// Fixed-width (256-bit) cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// The semantically relevant part of an [`InvocationRequest`].
///
/// Stored next to each cache entry so a hit can be re-verified against the
/// incoming request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model_id: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// Sorted, de-duplicated tool names.
    pub tools: Vec<String>,
    pub sampling: SamplingParams,
}

impl CanonicalRequest {
    pub fn from_request(request: &InvocationRequest) -> Self {
        let mut tools = request.active_tools.clone();
        tools.sort();
        tools.dedup();

        CanonicalRequest {
            model_id: request.model_id.clone(),
            system: request.system.clone(),
            messages: request.messages.clone(),
            tools,
            sampling: request.sampling.clone(),
        }
    }
}

/// Computes fingerprints for invocation requests.
///
/// An optional namespace separates key spaces (for example two prompt
/// versions that must never share entries).
///
/// ```
/// use llm_cache_kit::fingerprint::Fingerprinter;
/// use llm_cache_kit::request::{InvocationRequest, Message};
///
/// let fingerprinter = Fingerprinter::new();
/// let a = InvocationRequest::new("gpt-4o")
///     .with_message(Message::user("hi"))
///     .with_tools(["b", "a"]);
/// let b = InvocationRequest::new("gpt-4o")
///     .with_message(Message::user("hi"))
///     .with_tools(["a", "b"]);
///
/// assert_eq!(fingerprinter.fingerprint(&a), fingerprinter.fingerprint(&b));
/// ```
#[derive(Clone, Debug, Default)]
pub struct Fingerprinter {
    namespace: Option<String>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Fingerprinter { namespace: None }
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Fingerprinter {
            namespace: Some(namespace.into()),
        }
    }

    /// Fingerprint a request.
    pub fn fingerprint(&self, request: &InvocationRequest) -> Fingerprint {
        self.fingerprint_canonical(&CanonicalRequest::from_request(request))
    }

    /// Fingerprint an already canonicalized request.
    pub fn fingerprint_canonical(&self, canonical: &CanonicalRequest) -> Fingerprint {
        let mut hasher = CanonicalHasher::new();

        hasher.field(FINGERPRINT_DOMAIN);
        hasher.optional(self.namespace.as_deref());
        hasher.field(&canonical.model_id);
        hasher.optional(canonical.system.as_deref());

        hasher.count(canonical.messages.len());
        for message in &canonical.messages {
            hasher.field(&message.role.to_string());
            hasher.field(&message.content);
        }

        hasher.count(canonical.tools.len());
        for tool in &canonical.tools {
            hasher.field(tool);
        }

        let sampling = &canonical.sampling;
        hasher.optional_bytes(sampling.temperature.map(float_bytes));
        hasher.optional_bytes(sampling.top_p.map(float_bytes));
        hasher.optional_bytes(sampling.max_tokens.map(|m| m.to_le_bytes()));
        hasher.optional_bytes(sampling.seed.map(|s| s.to_le_bytes()));
        hasher.count(sampling.stop_sequences.len());
        for stop in &sampling.stop_sequences {
            hasher.field(stop);
        }

        Fingerprint(hasher.finish())
    }
}

/// Bytes of a sampling float, with `-0.0` folded into `0.0` and every NaN
/// into one pattern.
fn float_bytes(value: f32) -> [u8; 4] {
    let value = if value == 0.0 {
        0.0
    } else if value.is_nan() {
        f32::NAN
    } else {
        value
    };
    value.to_bits().to_le_bytes()
}

/// SHA-256 writer with length-prefixed framing.
struct CanonicalHasher(Sha256);

impl CanonicalHasher {
    fn new() -> Self {
        CanonicalHasher(Sha256::new())
    }

    fn count(&mut self, n: usize) {
        self.0.update((n as u64).to_le_bytes());
    }

    fn field(&mut self, value: &str) {
        self.count(value.len());
        self.0.update(value.as_bytes());
    }

    fn optional(&mut self, value: Option<&str>) {
        match value {
            Some(v) => {
                self.0.update([1u8]);
                self.field(v);
            }
            None => self.0.update([0u8]),
        }
    }

    fn optional_bytes<const N: usize>(&mut self, value: Option<[u8; N]>) {
        match value {
            Some(bytes) => {
                self.0.update([1u8]);
                self.0.update(bytes);
            }
            None => self.0.update([0u8]),
        }
    }

    fn finish(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}
