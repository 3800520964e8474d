//! Unified error types for the EcoWatt firmware.
//!
//! Follows embedded best practice: a single `Error` enum that every subsystem
//! can convert into, keeping every task loop's error handling uniform. Most
//! variants are `Copy` so they can be logged and discarded cheaply without
//! allocation on the hot path.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Protocol(ProtocolError),
    Acquisition(AcquisitionError),
    Compression(CompressionError),
    Security(SecurityError),
    Upload(UploadError),
    Ota(OtaError),
    Config(ConfigError),
    Storage(StorageError),
    TaskManager(TaskManagerError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Acquisition(e) => write!(f, "acquisition: {e}"),
            Self::Compression(e) => write!(f, "compression: {e}"),
            Self::Security(e) => write!(f, "security: {e}"),
            Self::Upload(e) => write!(f, "upload: {e}"),
            Self::Ota(e) => write!(f, "ota: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::TaskManager(e) => write!(f, "task manager: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol Adapter errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// CRC16 check failed after the single permitted retry.
    CrcMismatch,
    /// Frame was empty, the wrong length, or not valid hex.
    MalformedFrame,
    /// Inverter returned a Modbus-style exception response.
    Exception(u8),
    /// Transport (HTTP) failed after exhausting retries.
    TransportExhausted,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrcMismatch => write!(f, "CRC mismatch"),
            Self::MalformedFrame => write!(f, "malformed frame"),
            Self::Exception(code) => write!(f, "exception code {code}"),
            Self::TransportExhausted => write!(f, "transport retries exhausted"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Acquisition errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionError {
    /// The underlying protocol read failed or was partial.
    ReadFailed(ProtocolError),
    /// Caller requested more registers than the acquisition window supports.
    WindowTooLarge,
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed(e) => write!(f, "read failed: {e}"),
            Self::WindowTooLarge => write!(f, "register window too large"),
        }
    }
}

impl From<AcquisitionError> for Error {
    fn from(e: AcquisitionError) -> Self {
        Self::Acquisition(e)
    }
}

// ---------------------------------------------------------------------------
// Compression errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionError {
    /// Pipeline mutex could not be acquired within its bounded timeout.
    PipelineLockTimeout,
    /// Compressed output (even raw fallback) does not fit `CompressedPacket`.
    OutputTooLarge,
    /// Batch register layout changed mid-assembly.
    LayoutChanged,
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipelineLockTimeout => write!(f, "pipeline lock timeout"),
            Self::OutputTooLarge => write!(f, "compressed output too large"),
            Self::LayoutChanged => write!(f, "register layout changed mid-batch"),
        }
    }
}

impl From<CompressionError> for Error {
    fn from(e: CompressionError) -> Self {
        Self::Compression(e)
    }
}

// ---------------------------------------------------------------------------
// Security envelope errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityError {
    /// Nonce store could not be fetched/incremented.
    NonceUnavailable,
    /// Plaintext too large for the scratch encryption buffer.
    PlaintextTooLarge,
    /// Received payload is missing `nonce`, `payload`, or `mac`.
    MissingField,
    /// Received `nonce` is not strictly greater than `last_seen_nonce`.
    ReplayedNonce,
    /// MAC did not match on verification.
    MacMismatch,
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonceUnavailable => write!(f, "nonce store unavailable"),
            Self::PlaintextTooLarge => write!(f, "plaintext too large"),
            Self::MissingField => write!(f, "missing field in secured payload"),
            Self::ReplayedNonce => write!(f, "replayed or non-increasing nonce"),
            Self::MacMismatch => write!(f, "MAC mismatch"),
        }
    }
}

impl From<SecurityError> for Error {
    fn from(e: SecurityError) -> Self {
        Self::Security(e)
    }
}

// ---------------------------------------------------------------------------
// Uploader errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    /// `net_mutex` could not be acquired within the bounded timeout.
    NetworkMutexTimeout,
    /// HTTP POST returned a non-2xx status.
    ServerRejected(u16),
    /// Staging buffer is full; the oldest packet was dropped.
    StagingOverflow,
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkMutexTimeout => write!(f, "network mutex timeout"),
            Self::ServerRejected(code) => write!(f, "server rejected ({code})"),
            Self::StagingOverflow => write!(f, "staging buffer overflow"),
        }
    }
}

impl From<UploadError> for Error {
    fn from(e: UploadError) -> Self {
        Self::Upload(e)
    }
}

// ---------------------------------------------------------------------------
// OTA errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    ManifestFetchFailed,
    ChunkFetchFailed,
    SizeMismatch,
    HashMismatch,
    SlotWriteFailed,
    AlreadyUpToDate,
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManifestFetchFailed => write!(f, "manifest fetch failed"),
            Self::ChunkFetchFailed => write!(f, "chunk fetch failed"),
            Self::SizeMismatch => write!(f, "downloaded size mismatch"),
            Self::HashMismatch => write!(f, "SHA-256 hash mismatch"),
            Self::SlotWriteFailed => write!(f, "flash slot write failed"),
            Self::AlreadyUpToDate => write!(f, "manifest version not newer than current"),
        }
    }
}

impl From<OtaError> for Error {
    fn from(e: OtaError) -> Self {
        Self::Ota(e)
    }
}

// ---------------------------------------------------------------------------
// Config / storage errors (kept from teacher's ConfigPort/StoragePort shape)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ValidationFailed(&'static str),
    Corrupted,
    IoError,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            Self::Corrupted => write!(f, "stored config corrupted"),
            Self::IoError => write!(f, "storage I/O error"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    NotFound,
    IoError,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::IoError => write!(f, "storage I/O error"),
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Task Manager errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskManagerError {
    /// A queue, mutex, or semaphore could not be allocated at boot.
    PrimitiveAllocationFailed(&'static str),
}

impl fmt::Display for TaskManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimitiveAllocationFailed(what) => {
                write!(f, "primitive allocation failed: {what}")
            }
        }
    }
}

impl From<TaskManagerError> for Error {
    fn from(e: TaskManagerError) -> Self {
        Self::TaskManager(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
