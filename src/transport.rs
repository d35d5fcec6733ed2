//! Length-prefixed TCP framing, the serving loop and the client.
//!
//! Request frame: `[u32 LE payload len][u8 message type][payload]`.
//! Reply frame: `[u32 LE payload len][u8 status][payload]`, status 0 on
//! success and 1 with a UTF-8 message on failure.
//!
//! Connections get one OS thread each; request handling runs on a fixed
//! size rayon pool so at most `request_workers` requests touch the cache
//! at once. A separate thread runs maintenance.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::binary::{BinaryReader, ReadError, varint};
use crate::entries::{CacheEntries, EntriesError};
use crate::key::{BucketId, CacheKey, ContentKey};
use crate::server::protocol::{self, MessageType, PROTOCOL_VERSION};
use crate::server::{CacheServer, ServerError};
use crate::table::{CompactContentKeyTable, CompactPathTable, ContentTableError, PathTableError};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub const DEFAULT_PORT: u16 = 1347;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("unknown reply status {0}")]
    BadStatus(u8),
    #[error("malformed reply: {0}")]
    Read(#[from] ReadError),
    #[error(transparent)]
    Entries(#[from] EntriesError),
    #[error(transparent)]
    Path(#[from] PathTableError),
    #[error(transparent)]
    Content(#[from] ContentTableError),
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub fn write_frame(w: &mut impl Write, tag: u8, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_SIZE}", payload.len()),
        ));
    }
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&[tag])?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one frame, `None` on a clean end of stream.
pub fn read_frame(r: &mut impl Read) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 5];
    match r.read_exact(&mut header[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    r.read_exact(&mut header[1..])?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_SIZE}"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some((header[4], payload)))
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub listen: SocketAddr,
    pub request_workers: usize,
    /// How often the maintenance thread checks whether a pass is due.
    pub maintenance_interval: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            request_workers: thread::available_parallelism().map_or(4, |n| n.get()),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Bind `options.listen` and serve until a shutdown is requested.
pub fn serve(server: Arc<CacheServer>, options: &ServeOptions) -> Result<(), ServerError> {
    let listener = TcpListener::bind(options.listen)?;
    log::info!("listening on {}", listener.local_addr()?);
    serve_listener(server, listener, options)
}

/// Serve connections from `listener`. Returns after a shutdown request,
/// once every client has disconnected and a final maintenance pass and
/// save have run.
pub fn serve_listener(
    server: Arc<CacheServer>,
    listener: TcpListener,
    options: &ServeOptions,
) -> Result<(), ServerError> {
    listener.set_nonblocking(true)?;
    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(options.request_workers.max(1))
            .thread_name(|i| format!("stepcache-req-{i}"))
            .build()?,
    );
    let stop = Arc::new(AtomicBool::new(false));
    let active = Arc::new(AtomicUsize::new(0));
    let next_id = AtomicU32::new(1);

    let maintenance = {
        let server = server.clone();
        let stop = stop.clone();
        let interval = options.maintenance_interval;
        thread::Builder::new()
            .name("stepcache-maintenance".into())
            .spawn(move || maintenance_loop(&server, &stop, interval))?
    };

    while !server.shutdown_requested() {
        match listener.accept() {
            Ok((stream, addr)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                log::debug!("accepted {addr} as connection {id}");
                let server = server.clone();
                let pool = pool.clone();
                let conn_active = active.clone();
                active.fetch_add(1, Ordering::SeqCst);
                let spawned = thread::Builder::new()
                    .name(format!("stepcache-conn-{id}"))
                    .spawn(move || {
                        if let Err(e) = serve_connection(&server, &pool, id, stream) {
                            log::debug!("connection {id} ended: {e}");
                        }
                        server.on_disconnected(id);
                        conn_active.fetch_sub(1, Ordering::SeqCst);
                    });
                if let Err(e) = spawned {
                    active.fetch_sub(1, Ordering::SeqCst);
                    log::error!("failed to spawn connection thread: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }

    log::info!("shutting down, waiting for {} connection(s)", active.load(Ordering::SeqCst));
    drop(listener);
    while active.load(Ordering::SeqCst) > 0 {
        thread::sleep(ACCEPT_POLL);
    }
    stop.store(true, Ordering::SeqCst);
    if maintenance.join().is_err() {
        log::error!("maintenance thread panicked");
    }

    let report = server.run_maintenance(false, &|| false)?;
    if report.ran {
        log::info!("final maintenance: {report}");
    }
    server.save()?;
    Ok(())
}

fn maintenance_loop(server: &CacheServer, stop: &AtomicBool, interval: Duration) {
    let should_stop = || stop.load(Ordering::SeqCst);
    let mut next_check = Instant::now() + interval;
    while !should_stop() {
        thread::sleep(ACCEPT_POLL.min(interval));
        if Instant::now() < next_check {
            continue;
        }
        next_check = Instant::now() + interval;
        if !server.maintenance_due() {
            continue;
        }
        if let Err(e) = server.run_maintenance(false, &should_stop) {
            log::error!("maintenance failed: {e}");
        }
    }
}

fn serve_connection(
    server: &CacheServer,
    pool: &rayon::ThreadPool,
    id: u32,
    stream: TcpStream,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    while let Some((message, payload)) = read_frame(&mut reader)? {
        match pool.install(|| server.handle_message(id, message, &payload)) {
            Ok(reply) => write_frame(&mut writer, STATUS_OK, &reply)?,
            Err(e) => {
                log::warn!("connection {id}: message {message} failed: {e}");
                write_frame(&mut writer, STATUS_ERROR, e.to_string().as_bytes())?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One request/reply exchange with a cache server.
pub trait Channel {
    fn request(&mut self, message: MessageType, payload: &[u8]) -> Result<Vec<u8>, ClientError>;
}

#[derive(Debug)]
pub struct TcpChannel {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl TcpChannel {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }
}

impl Channel for TcpChannel {
    fn request(&mut self, message: MessageType, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        write_frame(&mut self.writer, message as u8, payload)?;
        let Some((status, reply)) = read_frame(&mut self.reader)? else {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        };
        match status {
            STATUS_OK => Ok(reply),
            STATUS_ERROR => Err(ClientError::Server(String::from_utf8_lossy(&reply).into_owned())),
            other => Err(ClientError::BadStatus(other)),
        }
    }
}

/// In-process channel that calls the server directly.
#[derive(Debug)]
pub struct LocalChannel {
    server: Arc<CacheServer>,
    id: u32,
}

static LOCAL_IDS: AtomicU32 = AtomicU32::new(1 << 31);

impl LocalChannel {
    pub fn new(server: Arc<CacheServer>) -> Self {
        Self {
            server,
            id: LOCAL_IDS.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Channel for LocalChannel {
    fn request(&mut self, message: MessageType, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.server
            .handle_message(self.id, message as u8, payload)
            .map_err(|e| ClientError::Server(e.to_string()))
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.server.on_disconnected(self.id);
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A file as the client sees it.
pub type FileRef = (String, ContentKey);

/// One candidate returned by [`CacheClient::fetch_entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedEntry {
    pub id: u32,
    pub inputs: Vec<FileRef>,
    pub outputs: Vec<FileRef>,
}

#[derive(Debug)]
struct ClientBucket {
    paths: CompactPathTable,
    keys: CompactContentKeyTable,
    sent_paths: usize,
    sent_keys: usize,
    /// Copies of the server's tables, grown by fetching.
    server_paths: Vec<u8>,
    server_keys: Vec<u8>,
}

impl ClientBucket {
    fn new(bucket: BucketId) -> Self {
        let paths = CompactPathTable::new(bucket.is_case_insensitive(), bucket.version());
        let sent_paths = paths.memory().len();
        Self {
            paths,
            keys: CompactContentKeyTable::new(),
            sent_paths,
            sent_keys: 0,
            server_paths: Vec::new(),
            server_keys: Vec::new(),
        }
    }
}

pub struct CacheClient<C: Channel> {
    channel: C,
    buckets: FxHashMap<BucketId, ClientBucket>,
}

impl<C: Channel> CacheClient<C> {
    /// Perform the version handshake over `channel`.
    pub fn connect(mut channel: C, hint: &str) -> Result<Self, ClientError> {
        let reply = channel.request(
            MessageType::Connect,
            &protocol::connect(PROTOCOL_VERSION, hint),
        )?;
        let mut r = BinaryReader::new(&reply);
        if !r.read_bool()? {
            return Err(ClientError::Rejected(r.read_string()?));
        }
        Ok(Self {
            channel,
            buckets: FxHashMap::default(),
        })
    }

    fn bucket(&mut self, id: BucketId) -> &mut ClientBucket {
        self.buckets.entry(id).or_insert_with(|| ClientBucket::new(id))
    }

    /// Intern files into the local tables and push any new table bytes.
    fn intern(&mut self, id: BucketId, files: &[(&str, ContentKey)]) -> Result<Vec<u32>, ClientError> {
        let bucket = self.bucket(id);
        let mut offsets = Vec::with_capacity(files.len());
        for (path, key) in files {
            let path = bucket.paths.add(path)?;
            offsets.push(bucket.keys.add(*key, path)?);
        }
        let path_delta = bucket.paths.memory()[bucket.sent_paths..].to_vec();
        let key_delta = bucket.keys.memory()[bucket.sent_keys..].to_vec();
        bucket.sent_paths = bucket.paths.memory().len();
        bucket.sent_keys = bucket.keys.memory().len();

        if !path_delta.is_empty() {
            self.channel
                .request(MessageType::StorePathTable, &protocol::store_table(id, &path_delta))?;
        }
        if !key_delta.is_empty() {
            self.channel.request(
                MessageType::StoreContentTable,
                &protocol::store_table(id, &key_delta),
            )?;
        }
        Ok(offsets)
    }

    /// Send an entry. Returns the indices into `outputs` whose content the
    /// server lacks; upload those and call [`Self::store_entry_done`].
    pub fn store_entry(
        &mut self,
        bucket: BucketId,
        cmd: &CacheKey,
        inputs: &[(&str, ContentKey)],
        outputs: &[(&str, ContentKey)],
        log_lines: &[u8],
    ) -> Result<Vec<usize>, ClientError> {
        let input_offsets = self.intern(bucket, inputs)?;
        let output_offsets = self.intern(bucket, outputs)?;
        let reply = self.channel.request(
            MessageType::StoreEntry,
            &protocol::store_entry(bucket, cmd, &input_offsets, &output_offsets, log_lines),
        )?;
        let missing = varint::decode_all(&reply)
            .map_err(|e| ClientError::Server(format!("malformed missing-output list: {e}")))?;
        Ok(output_offsets
            .iter()
            .enumerate()
            .filter(|(_, o)| missing.contains(o))
            .map(|(i, _)| i)
            .collect())
    }

    pub fn store_entry_done(
        &mut self,
        bucket: BucketId,
        cmd: &CacheKey,
        success: bool,
    ) -> Result<(), ClientError> {
        self.channel.request(
            MessageType::StoreEntryDone,
            &protocol::store_entry_done(bucket, cmd, success),
        )?;
        Ok(())
    }

    /// Store an entry together with whatever output content the server
    /// asks for.
    pub fn store(
        &mut self,
        bucket: BucketId,
        cmd: &CacheKey,
        inputs: &[(&str, ContentKey)],
        outputs: &[(&str, &[u8])],
        log_lines: &[u8],
    ) -> Result<(), ClientError> {
        let output_keys: Vec<(&str, ContentKey)> = outputs
            .iter()
            .map(|(path, data)| (*path, ContentKey::from_content(data)))
            .collect();
        let missing = self.store_entry(bucket, cmd, inputs, &output_keys, log_lines)?;
        if missing.is_empty() {
            return Ok(());
        }
        let mut uploaded = true;
        for i in missing {
            if let Err(e) = self.upload(outputs[i].1) {
                log::warn!("upload of {} failed: {e}", outputs[i].0);
                uploaded = false;
                break;
            }
        }
        self.store_entry_done(bucket, cmd, uploaded)
    }

    /// Grow the local copy of one server table until it is complete.
    fn sync_server_table(&mut self, id: BucketId, path_table: bool) -> Result<(), ClientError> {
        loop {
            let bucket = self.bucket(id);
            let have = if path_table {
                bucket.server_paths.len()
            } else {
                bucket.server_keys.len()
            };
            let message = if path_table {
                MessageType::FetchPathTable
            } else {
                MessageType::FetchContentTable
            };
            let reply = self
                .channel
                .request(message, &protocol::fetch_table(id, have as u32))?;
            let mut r = BinaryReader::new(&reply);
            let size = r.read_u32()? as usize;
            let chunk = r.read_rest();

            let bucket = self.bucket(id);
            let local = if path_table {
                &mut bucket.server_paths
            } else {
                &mut bucket.server_keys
            };
            if size < local.len() {
                // Tables were rebuilt since the last fetch.
                local.clear();
                continue;
            }
            local.extend_from_slice(chunk);
            if local.len() >= size || chunk.is_empty() {
                return Ok(());
            }
        }
    }

    /// Every entry the server holds for `cmd`, resolved to paths and keys.
    pub fn fetch_entries(
        &mut self,
        bucket: BucketId,
        cmd: &CacheKey,
    ) -> Result<Vec<FetchedEntry>, ClientError> {
        let reply = self
            .channel
            .request(MessageType::FetchEntries, &protocol::fetch_entries(bucket, cmd))?;
        let entries = CacheEntries::read_network(&mut BinaryReader::new(&reply))?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        self.sync_server_table(bucket, true)?;
        self.sync_server_table(bucket, false)?;
        let local = self.bucket(bucket);
        let paths = CompactPathTable::from_memory(
            local.server_paths.clone(),
            bucket.is_case_insensitive(),
            bucket.version(),
        )?;
        let keys = CompactContentKeyTable::from_memory(local.server_keys.clone())?;

        let resolve = |offsets: Vec<u32>| -> Result<Vec<FileRef>, ClientError> {
            offsets
                .into_iter()
                .map(|o| Ok(keys.get_path_string_and_key(&paths, o)?))
                .collect()
        };
        entries
            .entries
            .iter()
            .map(|entry| {
                Ok(FetchedEntry {
                    id: entry.id,
                    inputs: resolve(entries.flatten(entry)?)?,
                    outputs: resolve(entry.output_offsets()?)?,
                })
            })
            .collect()
    }

    /// Tell the server `entry_id` was used; returns its log lines.
    pub fn report_used_entry(
        &mut self,
        bucket: BucketId,
        cmd: &CacheKey,
        entry_id: u32,
    ) -> Result<Vec<u8>, ClientError> {
        self.channel.request(
            MessageType::ReportUsedEntry,
            &protocol::report_used_entry(bucket, cmd, entry_id),
        )
    }

    pub fn upload(&mut self, data: &[u8]) -> Result<ContentKey, ClientError> {
        let reply = self.channel.request(MessageType::UploadContent, data)?;
        Ok(ContentKey::read(&mut BinaryReader::new(&reply))?)
    }

    pub fn download(&mut self, key: &ContentKey) -> Result<Option<Vec<u8>>, ClientError> {
        let reply = self
            .channel
            .request(MessageType::DownloadContent, &protocol::download_content(key))?;
        let mut r = BinaryReader::new(&reply);
        if r.read_bool()? {
            Ok(Some(r.read_rest().to_vec()))
        } else {
            Ok(None)
        }
    }

    pub fn execute_command(&mut self, command: &str, args: &str) -> Result<String, ClientError> {
        let reply = self.channel.request(
            MessageType::ExecuteCommand,
            &protocol::execute_command(command, args),
        )?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    pub fn request_shutdown(&mut self, reason: &str) -> Result<(), ClientError> {
        self.channel
            .request(MessageType::RequestShutdown, &protocol::request_shutdown(reason))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 7, b"payload").unwrap();
        write_frame(&mut buf, 0, b"").unwrap();
        assert_eq!(&buf[..5], &[7, 0, 0, 0, 7]);

        let mut r = io::Cursor::new(buf);
        assert_eq!(read_frame(&mut r).unwrap(), Some((7, b"payload".to_vec())));
        assert_eq!(read_frame(&mut r).unwrap(), Some((0, Vec::new())));
        assert_eq!(read_frame(&mut r).unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_le_bytes());
        header.push(3);
        let err = read_frame(&mut io::Cursor::new(header)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, b"abcdef").unwrap();
        buf.truncate(8);
        assert!(read_frame(&mut io::Cursor::new(buf)).is_err());
    }
}
