//! Content-addressed identities for configured event sources.
//!
//! A source is identified by a hash over its name and raw configuration, so any
//! edit to the configuration yields a new identity. A separate time identifier is
//! minted once per reconfiguration generation and travels with every lifecycle
//! notification to reject updates from superseded generations.
//!
//! Time identifiers are zero-padded UTC nanoseconds, so they order by mint time
//! across processes and restarts and remain valid label values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of digest bytes kept, hex-encoded into twice as many characters.
const HASH_BYTES: usize = 8;

/// Separates name and configuration so `("ab", "c")` and `("a", "bc")` differ.
const IDENTITY_SEPARATOR: char = '\u{0}';

/// Digits of a minted time identifier.
const TIME_ID_WIDTH: usize = 20;

/// Last value minted by this process.
static LAST_MINTED: AtomicU64 = AtomicU64::new(0);

/// Hashes a value into a short lowercase hex string that is safe to use as a
/// Kubernetes label value.
pub fn hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    digest[..HASH_BYTES]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Computes the stable identifier of a source from its name and raw configuration.
pub fn source_id(name: &str, raw_config: &str) -> String {
    hash(&format!("{name}{IDENTITY_SEPARATOR}{raw_config}"))
}

/// Mints a fresh logical-clock token for one reconfiguration generation.
///
/// Tokens minted by one process strictly increase, even within the same clock
/// tick or when the wall clock steps back.
pub fn mint_time_id() -> String {
    let now = chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or_default();
    let next = |last: u64| now.max(last.saturating_add(1));
    let previous = LAST_MINTED
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
        .unwrap_or_else(|last| last);
    format!("{:0width$}", next(previous), width = TIME_ID_WIDTH)
}

/// Whether `candidate` was minted after `current`.
pub fn is_newer_time_id(candidate: &str, current: &str) -> bool {
    (candidate.len(), candidate) > (current.len(), current)
}

/// Identity of one configured event source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SourceIdentity {
    /// Hash of name and raw configuration.
    pub id: String,
    /// Generation token minted when the source set was last recomputed.
    pub time_id: String,
    /// Source name, the key in the configuration map.
    pub name: String,
    /// Adapter-specific serialized configuration.
    pub raw_config: String,
}

impl SourceIdentity {
    /// Creates an identity for the given source within a generation.
    pub fn new(
        name: impl Into<String>,
        raw_config: impl Into<String>,
        time_id: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let raw_config = raw_config.into();
        Self {
            id: source_id(&name, &raw_config),
            time_id: time_id.into(),
            name,
            raw_config,
        }
    }
}
