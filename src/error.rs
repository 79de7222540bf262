use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open the backing file
    #[error("Opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file
    #[error("Synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the backing file
    #[error(
        "Can't resize the backing file. Have 0x{size:x} bytes, wanted to get 0x{requested:x} bytes"
    )]
    Resize {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    /// Couldn't map the backing file
    #[error("Can't map 0x{requested:x} bytes of the backing file")]
    Map {
        requested: usize,
        source: std::io::Error,
    },

    /// Null/empty inputs, bad flag combinations, wrong-kind items
    #[error("Invalid argument: {0}")]
    InvalidArg(&'static str),
    /// No such key or duplicate; also signals end-of-iteration for cursors
    #[error("Key or duplicate not found")]
    NotFound,
    /// Key already present and `NOOVERWRITE` (or dup and `NODUPDATA`) was set
    #[error("Key already exists")]
    Exists,
    /// Every page within the map size is in use
    #[error("No more free pages within the map size")]
    MapFull,
    /// The dirty list cannot grow or spill any further
    #[error("Write transaction has too many dirty pages")]
    TxnFull,
    /// Cursor stack depth exceeded
    #[error("Cursor stack depth exceeded")]
    CursorFull,
    /// A node cannot fit the entry even after splitting
    #[error("Node has no room for the entry")]
    PageFull,
    /// Another process grew the map beyond this process's view
    #[error("The map was resized by another process")]
    MapResized,
    /// Table flags conflict with the requested operation
    #[error("Operation incompatible with the table's flags")]
    Incompatible,
    /// A reader slot was reused while still owned
    #[error("Reader slot is stale or owned by another transaction")]
    BadReaderSlot,
    /// The transaction is poisoned, has a live child, or already ended
    #[error("Transaction cannot be used")]
    BadTxn,
    /// The table handle is stale or out of range
    #[error("Stale or invalid table handle")]
    BadDbi,
    /// Key or value size outside the supported range
    #[error("Key or value size unsupported: {0} bytes")]
    BadValSize(usize),
    /// Mutation attempted on a node that is not a writable copy
    #[error("Node is not a writable copy")]
    NodeReadOnly,
    /// Invalid magic, version, or page layout
    #[error("Data corruption detected: {0}")]
    Corrupted(&'static str),
    /// A previous fatal error poisoned the environment
    #[error("Environment is poisoned by an earlier fatal error")]
    Panic,
    /// On-disk format version not understood
    #[error("File format version mismatch")]
    VersionMismatch,
    /// Exclusive access could not be obtained
    #[error("Environment is busy")]
    Busy,
    /// The reader table is at `max_readers`
    #[error("Reader table is full")]
    ReadersFull,
    /// The durability channel was shut down
    #[error("Durability worker is gone")]
    WorkerGone,
}

impl Error {
    /// True for conditions that poison the environment for all callers.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupted(_) | Error::Panic)
    }
}
