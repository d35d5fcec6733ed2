// Message types, payload builders and the protocol error type.
//
// Every request is `[u8 type][payload]`; payload layouts are listed on
// each `MessageType` variant. Builders here are shared by the client and
// the tests so both sides agree on the layout.

use crate::binary::{BinaryWriter, ReadError};
use crate::bucket::BucketError;
use crate::entries::EntriesError;
use crate::key::{BucketId, CacheKey, ContentKey};
use crate::store::StoreError;
use crate::table::{ContentTableError, PathTableError};

/// Protocol revision spoken by this build.
pub const PROTOCOL_VERSION: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// `[u32 version][string hint]` -> `[bool accepted][string reason]`
    Connect = 0,
    /// `[varint bucket][path table bytes]`
    StorePathTable = 1,
    /// `[varint bucket][content-key table bytes]`
    StoreContentTable = 2,
    /// `[varint bucket][cmd key][varint inputs][varint outputs][offsets..][log]`
    /// -> varint client offsets of outputs the server lacks
    StoreEntry = 3,
    /// `[varint bucket][cmd key][bool success]`
    StoreEntryDone = 4,
    /// `[varint bucket][u32 have]` -> `[u32 size][bytes]`
    FetchPathTable = 5,
    /// `[varint bucket][u32 have]` -> `[u32 size][bytes]`
    FetchContentTable = 6,
    /// `[varint bucket][cmd key]` -> network form of the record
    FetchEntries = 7,
    /// `[varint bucket][cmd key][varint entry id]` -> log lines
    ReportUsedEntry = 8,
    /// `[string command][string args]` -> utf-8 text
    ExecuteCommand = 9,
    /// `[string reason]` -> `[bool]`
    RequestShutdown = 10,
    /// `[bytes]` -> `[content key]`
    UploadContent = 11,
    /// `[content key]` -> `[bool found][bytes]`
    DownloadContent = 12,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Connect,
            1 => Self::StorePathTable,
            2 => Self::StoreContentTable,
            3 => Self::StoreEntry,
            4 => Self::StoreEntryDone,
            5 => Self::FetchPathTable,
            6 => Self::FetchContentTable,
            7 => Self::FetchEntries,
            8 => Self::ReportUsedEntry,
            9 => Self::ExecuteCommand,
            10 => Self::RequestShutdown,
            11 => Self::UploadContent,
            12 => Self::DownloadContent,
            other => return Err(ProtocolError::UnknownMessage(other)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("client protocol version {client} does not match server version {server}")]
    VersionMismatch { client: u32, server: u32 },
    #[error("unknown message type {0}")]
    UnknownMessage(u8),
    #[error("connection {0} sent a request before connecting")]
    NotConnected(u32),
    #[error("malformed request: {0}")]
    Read(#[from] ReadError),
    #[error("client {direction} offset {offset} is invalid: {reason}")]
    BadClientOffset {
        direction: &'static str,
        offset: u32,
        reason: String,
    },
    #[error("{direction} file {path} appears more than once in one entry")]
    DuplicateFile { direction: &'static str, path: String },
    #[error(transparent)]
    Entries(#[from] EntriesError),
    #[error(transparent)]
    Bucket(#[from] BucketError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PathTableError> for ProtocolError {
    fn from(e: PathTableError) -> Self {
        Self::Bucket(e.into())
    }
}

impl From<ContentTableError> for ProtocolError {
    fn from(e: ContentTableError) -> Self {
        Self::Bucket(e.into())
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

pub fn connect(version: u32, hint: &str) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_u32(version);
    w.write_string(hint);
    w.into_inner()
}

pub fn store_table(bucket: BucketId, bytes: &[u8]) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_varint(bucket.0);
    w.write_bytes(bytes);
    w.into_inner()
}

/// `inputs` and `outputs` are content-key table offsets of the client's
/// own tables.
pub fn store_entry(
    bucket: BucketId,
    cmd: &CacheKey,
    inputs: &[u32],
    outputs: &[u32],
    log_lines: &[u8],
) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_varint(bucket.0);
    cmd.write(&mut w);
    w.write_varint(inputs.len() as u64);
    w.write_varint(outputs.len() as u64);
    for &o in outputs.iter().chain(inputs) {
        w.write_varint(u64::from(o));
    }
    w.write_bytes(log_lines);
    w.into_inner()
}

pub fn store_entry_done(bucket: BucketId, cmd: &CacheKey, success: bool) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_varint(bucket.0);
    cmd.write(&mut w);
    w.write_bool(success);
    w.into_inner()
}

pub fn fetch_table(bucket: BucketId, have: u32) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_varint(bucket.0);
    w.write_u32(have);
    w.into_inner()
}

pub fn fetch_entries(bucket: BucketId, cmd: &CacheKey) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_varint(bucket.0);
    cmd.write(&mut w);
    w.into_inner()
}

pub fn report_used_entry(bucket: BucketId, cmd: &CacheKey, entry_id: u32) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_varint(bucket.0);
    cmd.write(&mut w);
    w.write_varint(u64::from(entry_id));
    w.into_inner()
}

pub fn execute_command(command: &str, args: &str) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_string(command);
    w.write_string(args);
    w.into_inner()
}

pub fn request_shutdown(reason: &str) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_string(reason);
    w.into_inner()
}

pub fn download_content(key: &ContentKey) -> Vec<u8> {
    key.as_bytes().to_vec()
}
