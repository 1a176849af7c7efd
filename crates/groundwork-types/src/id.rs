//! Time-ordered binary identifiers.

use std::fmt;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;

/// Random salt shared by all identifiers created in this process.
static PROCESS_SALT: LazyLock<[u8; 4]> = LazyLock::new(|| rand::random::<u32>().to_be_bytes());

/// Rolling 24-bit counter, seeded randomly per process.
static COUNTER: LazyLock<AtomicU32> =
    LazyLock::new(|| AtomicU32::new(rand::random::<u32>() & 0xff_ffff));

/// A 14-byte time-ordered identifier.
///
/// Layout: one kind byte, a 48-bit big-endian millisecond timestamp, a 4-byte
/// per-process random salt, and a 24-bit rolling counter. Identifiers of one
/// kind created within the same millisecond differ only in the counter, so
/// byte order is creation order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier {
    data: [u8; 14],
}

impl Identifier {
    /// Builds an identifier for `kind` at the given millisecond timestamp.
    ///
    /// The timestamp is truncated to its low 48 bits.
    pub fn new(kind: u8, timestamp_ms: u64) -> Self {
        let mut data = [0; 14];
        data[0] = kind;
        data[1..7].copy_from_slice(&timestamp_ms.to_be_bytes()[2..8]);
        data[7..11].copy_from_slice(PROCESS_SALT.as_slice());

        let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0xff_ffff;
        data[11..14].copy_from_slice(&count.to_be_bytes()[1..4]);

        Identifier { data }
    }

    /// Builds an identifier for `kind` at the current time.
    pub fn generate(kind: u8) -> Self {
        Self::new(kind, Utc::now().timestamp_millis() as u64)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 14] {
        &self.data
    }

    /// The kind byte this identifier was created with.
    pub fn kind(&self) -> u8 {
        self.data[0]
    }

    /// The millisecond timestamp embedded in this identifier.
    pub fn timestamp_ms(&self) -> u64 {
        let mut bytes = [0; 8];
        bytes[2..8].copy_from_slice(&self.data[1..7]);
        u64::from_be_bytes(bytes)
    }

    /// Renders the identifier as base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.data)
    }
}

/// Renders the identifier as lowercase hex.
impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.data))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identifier")
            .field(&hex::encode(self.data))
            .finish()
    }
}
