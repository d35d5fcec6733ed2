// Command-line front end for stepcache.
//
// `serve` runs the cache server, `maintain` runs maintenance offline
// against a database directory, and `command` / `shutdown` talk to a
// running server.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};

use crate::clock::SystemClock;
use crate::server::config::DEFAULT_FETCH_RESPONSE_CAP;
use crate::server::{CacheServer, CacheServerConfig, MaintenanceReport, PROTOCOL_VERSION};
use crate::store::{ContentStore, MemoryContentStore};
use crate::transport::{self, CacheClient, DEFAULT_PORT, ServeOptions, TcpChannel};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_EXPIRATION: &str = "3d";
const DEFAULT_TABLE_CAP: u64 = 32 * 1024 * 1024;
const DEFAULT_ADD_THRESHOLD: u64 = 10_000;
const DEFAULT_MAINTENANCE_INTERVAL: &str = "60s";
const CONTENT_DIR: &str = "content";

// ---------------------------------------------------------------------------
// Byte size and duration parsing
// ---------------------------------------------------------------------------

fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".into());
    }
    let (num_part, multiplier) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };
    let num: u64 = num_part
        .trim()
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflow: '{s}'"))
}

/// Seconds by default; `s`, `m`, `h` and `d` suffixes.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".into());
    }
    let (num_part, unit) = match s.as_bytes().last() {
        Some(b's' | b'S') => (&s[..s.len() - 1], 1u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 60),
        Some(b'h' | b'H') => (&s[..s.len() - 1], 60 * 60),
        Some(b'd' | b'D') => (&s[..s.len() - 1], 24 * 60 * 60),
        _ => (s, 1),
    };
    let num: u64 = num_part
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration '{s}': {e}"))?;
    num.checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration overflow: '{s}'"))
}

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Networked build-step cache server.
#[derive(Parser, Debug)]
#[command(
    name = "stepcache",
    version,
    about = "Networked build-step cache server",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Quiet mode (errors only).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Print reports as JSON.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the cache server.
    Serve(ServeArgs),
    /// Run maintenance against a database directory while no server is running.
    Maintain(MaintainArgs),
    /// Send an admin command to a running server.
    Command(CommandArgs),
    /// Ask a running server to shut down.
    Shutdown(ShutdownArgs),
    /// Print build and default configuration details.
    Config,
}

#[derive(Args, Debug)]
struct CacheArgs {
    /// Database directory (in-memory when omitted).
    #[arg(long, short = 'd', value_hint = ValueHint::DirPath)]
    root: Option<PathBuf>,

    /// Entry expiration (s/m/h/d suffix); 0 disables expiry.
    #[arg(long, value_parser = parse_duration, default_value = DEFAULT_EXPIRATION)]
    expiration: Duration,

    /// Per-bucket content-key table cap (K/M/G suffix); 0 disables.
    #[arg(long = "table-cap", value_parser = parse_byte_size, default_value_t = DEFAULT_TABLE_CAP)]
    table_cap: u64,

    /// Stores between automatic maintenance passes.
    #[arg(long = "add-threshold", default_value_t = DEFAULT_ADD_THRESHOLD)]
    add_threshold: u64,

    /// Largest fetch reply (K/M/G suffix).
    #[arg(long = "fetch-cap", value_parser = parse_byte_size, default_value_t = DEFAULT_FETCH_RESPONSE_CAP as u64)]
    fetch_cap: u64,

    /// Maintenance worker threads (default: cores - 1).
    #[arg(long = "maintenance-workers")]
    maintenance_workers: Option<usize>,

    /// Content store capacity (K/M/G suffix); unbounded when omitted.
    #[arg(long = "content-capacity", value_parser = parse_byte_size)]
    content_capacity: Option<u64>,

    /// Skip input checks against deleted content during maintenance.
    #[arg(long = "skip-input-check")]
    skip_input_check: bool,

    /// Keep the existing entry when a store repeats its inputs with different outputs.
    #[arg(long = "keep-on-mismatch")]
    keep_on_mismatch: bool,

    /// Load buckets without structural validation.
    #[arg(long = "no-validate")]
    no_validate: bool,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    cache: CacheArgs,

    /// Address to listen on.
    #[arg(long, short = 'l', default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    listen: SocketAddr,

    /// Request worker threads (default: cores).
    #[arg(long)]
    workers: Option<usize>,

    /// How often to check whether maintenance is due (s/m/h/d suffix).
    #[arg(long = "maintenance-interval", value_parser = parse_duration, default_value = DEFAULT_MAINTENANCE_INTERVAL)]
    maintenance_interval: Duration,
}

#[derive(Args, Debug)]
struct MaintainArgs {
    #[command(flatten)]
    cache: CacheArgs,

    /// Drop every bucket before maintaining.
    #[arg(long)]
    obliterate: bool,
}

#[derive(Args, Debug)]
struct CommandArgs {
    /// Server address.
    #[arg(long, short = 'a', default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    addr: String,

    /// Command name (status, content, validate, maintenance, ...).
    name: String,

    /// Command arguments.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[derive(Args, Debug)]
struct ShutdownArgs {
    /// Server address.
    #[arg(long, short = 'a', default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    addr: String,

    /// Reason recorded in the server log.
    #[arg(long, default_value = "requested from command line")]
    reason: String,
}

impl CacheArgs {
    fn to_config(&self) -> CacheServerConfig {
        let mut config = match &self.root {
            Some(root) => CacheServerConfig::with_root(root.clone()),
            None => CacheServerConfig::in_memory(),
        };
        config.expiration = (!self.expiration.is_zero()).then_some(self.expiration);
        config.bucket_content_table_max_size = self.table_cap;
        config.maintenance_add_threshold = self.add_threshold;
        config.fetch_response_cap = self.fetch_cap as usize;
        if let Some(workers) = self.maintenance_workers {
            config.maintenance_workers = workers.max(1);
        }
        config.check_inputs_for_deleted_content = !self.skip_input_check;
        config.replace_on_output_mismatch = !self.keep_on_mismatch;
        config.validate_on_load = !self.no_validate;
        config
    }
}

fn init_logging(cli: &Cli) {
    let default = match (&cli.command, cli.quiet, cli.verbose) {
        (_, true, _) => "error",
        (_, _, 2..) => "trace",
        (_, _, 1) => "debug",
        (Cmd::Serve(_) | Cmd::Maintain(_), ..) => "info",
        _ => "warn",
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default));
    if !matches!(cli.command, Cmd::Serve(_)) {
        builder.format_timestamp(None);
    }
    builder.format_target(false).init();
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("stepcache".to_string())
        .chain(args.iter().cloned())
        .collect();
    if let Ok(cli) = Cli::try_parse_from(argv) {
        match cli.command {
            Cmd::Serve(args) => drop(args.cache.to_config()),
            Cmd::Maintain(args) => drop(args.cache.to_config()),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn open_store(root: Option<&Path>, capacity: Option<u64>) -> Result<Arc<dyn ContentStore>, String> {
    #[cfg(feature = "fs-store")]
    if let Some(root) = root {
        let store = crate::store::FsContentStore::open(root.join(CONTENT_DIR), capacity)
            .map_err(|e| format!("content store: {e}"))?;
        return Ok(Arc::new(store));
    }
    #[cfg(not(feature = "fs-store"))]
    let _ = (root, CONTENT_DIR);
    Ok(Arc::new(match capacity {
        Some(bytes) => MemoryContentStore::with_capacity(bytes),
        None => MemoryContentStore::new(),
    }))
}

fn open_server(args: &CacheArgs) -> Result<Arc<CacheServer>, String> {
    let store = open_store(args.root.as_deref(), args.content_capacity)?;
    CacheServer::open(args.to_config(), store, Arc::new(SystemClock))
        .map(Arc::new)
        .map_err(|e| format!("failed to open cache: {e}"))
}

fn cmd_serve(args: &ServeArgs) -> i32 {
    let server = match open_server(&args.cache) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("stepcache: {e}");
            return 1;
        }
    };
    let options = ServeOptions {
        listen: args.listen,
        request_workers: args
            .workers
            .unwrap_or_else(|| ServeOptions::default().request_workers),
        maintenance_interval: args.maintenance_interval,
    };
    match transport::serve(server, &options) {
        Ok(()) => {
            log::info!("server stopped");
            0
        }
        Err(e) => {
            eprintln!("stepcache: {e}");
            1
        }
    }
}

fn report_json(report: &MaintenanceReport) -> serde_json::Value {
    serde_json::json!({
        "ran": report.ran,
        "passes": report.passes,
        "deletedEntries": report.deleted_entries(),
        "overflowed": report.overflowed,
        "expired": report.expired,
        "missingOutputs": report.missing_outputs,
        "missingInputs": report.missing_inputs,
        "corrupt": report.corrupt,
        "droppedContent": report.dropped_content,
        "rebuiltBuckets": report.rebuilt_buckets,
        "removedBuckets": report.removed_buckets,
        "saveFailures": report.save_failures,
        "durationMs": report.duration.as_millis() as u64,
    })
}

fn cmd_maintain(args: &MaintainArgs, json_output: bool) -> i32 {
    if args.cache.root.is_none() {
        eprintln!("stepcache: maintain needs --root");
        return 1;
    }
    let server = match open_server(&args.cache) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("stepcache: {e}");
            return 1;
        }
    };
    if args.obliterate {
        server.request_wipe();
    }
    match server.run_maintenance(true, &|| false) {
        Ok(report) => {
            if json_output {
                println!("{}", report_json(&report));
            } else {
                println!("{report}");
            }
            i32::from(report.save_failures > 0)
        }
        Err(e) => {
            eprintln!("stepcache: maintenance failed: {e}");
            1
        }
    }
}

fn connect(addr: &str) -> Result<CacheClient<TcpChannel>, String> {
    let channel = TcpChannel::connect(addr).map_err(|e| format!("{addr}: {e}"))?;
    CacheClient::connect(channel, "stepcache cli").map_err(|e| format!("{addr}: {e}"))
}

fn cmd_command(args: &CommandArgs) -> i32 {
    let result = connect(&args.addr).and_then(|mut client| {
        client
            .execute_command(&args.name, &args.args.join(" "))
            .map_err(|e| e.to_string())
    });
    match result {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(e) => {
            eprintln!("stepcache: {e}");
            1
        }
    }
}

fn cmd_shutdown(args: &ShutdownArgs) -> i32 {
    let result = connect(&args.addr)
        .and_then(|mut client| client.request_shutdown(&args.reason).map_err(|e| e.to_string()));
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("stepcache: {e}");
            1
        }
    }
}

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    let defaults = CacheServerConfig::default();
    eprintln!("stepcache version {version}");
    eprintln!("PROTOCOL_VERSION={PROTOCOL_VERSION}");
    eprintln!("FS_STORE={}", cfg!(feature = "fs-store") as u8);
    eprintln!("DEFAULT_PORT={DEFAULT_PORT}");
    eprintln!(
        "EXPIRATION_SECS={}",
        defaults.expiration.map_or(0, |d| d.as_secs())
    );
    eprintln!("TABLE_CAP={}", defaults.bucket_content_table_max_size);
    eprintln!("ADD_THRESHOLD={}", defaults.maintenance_add_threshold);
    eprintln!("FETCH_CAP={}", defaults.fetch_response_cap);
    eprintln!("MAINTENANCE_WORKERS={}", defaults.maintenance_workers);
    eprintln!("FRAME_LIMIT={}", transport::MAX_FRAME_SIZE);
    0
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap, dispatches commands.
pub fn run() -> ! {
    let cli = Cli::parse();
    init_logging(&cli);

    let exit_code = match &cli.command {
        Cmd::Serve(args) => cmd_serve(args),
        Cmd::Maintain(args) => cmd_maintain(args, cli.json_output),
        Cmd::Command(args) => cmd_command(args),
        Cmd::Shutdown(args) => cmd_shutdown(args),
        Cmd::Config => cmd_config(),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
