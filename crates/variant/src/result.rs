//! Variant-engine result and error types.

use thiserror::Error;

/// Error type for layout, relocation and cache management.
#[derive(Debug, Error)]
pub enum Error {
    /// The packed layout ran past the end of the cache buffer. The buffer is
    /// a hard capacity constraint, not elastic.
    #[error("code cache capacity exceeded: need 0x{needed:x} bytes, have 0x{capacity:x}")]
    CacheCapacityExceeded { needed: u64, capacity: u64 },

    /// A relocated displacement does not fit the rel32 encoding.
    #[error("displacement {displacement} at 0x{at:x} exceeds the rel32 range")]
    DisplacementOutOfRange { at: u64, displacement: i64 },

    /// A trampoline or branch names a block the layout never placed.
    #[error("no relocated block recorded for original offset 0x{0:x}")]
    MissingBlockLocation(u64),

    /// Two layout entries claim the same byte range.
    #[error("layout ranges overlap at 0x{0:x}")]
    LayoutOverlap(u64),

    /// A conditional branch uses an encoding the template builder does not
    /// re-encode.
    #[error("unsupported conditional branch encoding at 0x{0:x}")]
    UnsupportedBranchEncoding(u64),

    /// A switch-jump block was generated without its dispatch slide.
    #[error("no jump-target zone slide recorded for switch block 0x{0:x}")]
    MissingZoneSlide(u64),

    /// A write would land outside the cache buffer.
    #[error("cache write of {len} bytes at 0x{at:x} is out of bounds")]
    CacheWrite { at: u64, len: usize },

    /// A shared-memory open/stat/map failed. These objects are created by the
    /// kernel side immediately before notification, so there is no retry.
    #[error("shared memory object '{path}': {source}")]
    Shm {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The mapped object has the wrong size for its role.
    #[error("'{path}' maps 0x{mapped:x} bytes, expected 0x{expected:x}")]
    MappedSizeMismatch {
        path: String,
        mapped: u64,
        expected: u64,
    },

    /// A /proc/<pid>/maps row did not parse.
    #[error("malformed maps row: {0}")]
    MapsRow(String),

    /// The process maps carry no code-cache mapping for a module.
    #[error("no code-cache mapping found for module '{0}'")]
    MissingCacheMapping(String),

    /// The process maps carry no executable mapping for a module.
    #[error("no executable mapping found for module '{0}'")]
    MissingImageMapping(String),

    /// A notification record was shorter than the fixed layout.
    #[error("notification record truncated at {0} bytes")]
    TruncatedRecord(usize),

    /// A notification carried an out-of-range message kind.
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u32),

    /// A notification carried an out-of-range shadow-stack mode.
    #[error("unknown shadow-stack mode {0}")]
    UnknownSsMode(u32),

    /// A buffer was consumed while not ready.
    #[error("cache buffer {0} consumed while not ready")]
    NotReady(usize),

    /// The ready poll exceeded its spin budget.
    #[error("ready flag for buffer {buffer} not set within {spins} spins")]
    SpinBoundExceeded { buffer: usize, spins: u64 },

    /// The messaging transport failed.
    #[error("transport: {0}")]
    Transport(String),

    /// The kernel side reported the wrong application.
    #[error("protected process is not the expected application: {0}")]
    WrongApp(String),

    /// Analysis-side failure.
    #[error(transparent)]
    Core(#[from] rondel_core::Error),
}

/// Variant-engine result type.
pub type Result<T> = std::result::Result<T, Error>;
