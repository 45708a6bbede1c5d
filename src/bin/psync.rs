//! psync CLI - rsync-style directory synchronization.

use std::path::PathBuf;
use std::process::{Child, Command, ExitCode, Stdio};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use psync::{run_receiver, run_sender, sync_local, SyncError, SyncOptions, Transport};

/// psync - directory synchronization with rolling-hash deltas
#[derive(Parser)]
#[command(name = "psync")]
#[command(version)]
#[command(about = "Synchronize directory trees, transferring only changed bytes")]
struct Cli {
    /// Archive mode: recursive, preserve permissions and times, keep
    /// symlinks as symlinks
    #[arg(short, long)]
    archive: bool,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Compress the wire stream, adapting the level to the link
    #[arg(short = 'z', long)]
    compress: bool,

    /// Recurse into directories
    #[arg(short, long)]
    recursive: bool,

    /// Show what would be transferred without moving file bytes
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Compare whole-file checksums instead of size and mtime
    #[arg(short, long)]
    checksum: bool,

    /// Skip files whose destination copy is newer
    #[arg(short, long)]
    update: bool,

    /// Delete destination files that do not exist in the source
    #[arg(long)]
    delete: bool,

    /// Exclude files matching this glob (repeatable)
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Emit per-file progress records
    #[arg(long)]
    progress: bool,

    /// Print the transfer summary at the end
    #[arg(long)]
    stats: bool,

    /// Run as the receiving peer over stdin/stdout
    #[arg(long)]
    server: bool,

    /// Source path (or destination path in server mode)
    src: PathBuf,

    /// Destination path, `host:path` for remote
    dst: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("psync: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("psync={default}")));
    // In server mode stdout is the wire; logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

fn run(cli: Cli) -> std::result::Result<(), SyncError> {
    let opts = SyncOptions {
        archive: cli.archive,
        verbose: cli.verbose,
        compress: cli.compress,
        recursive: cli.recursive,
        dry_run: cli.dry_run,
        checksum: cli.checksum,
        update: cli.update,
        delete: cli.delete,
        excludes: cli.exclude.clone(),
        progress: cli.progress,
        ..Default::default()
    }
    .normalized();

    if cli.server {
        let stats = run_receiver(Transport::stdio(), &cli.src, &opts)?;
        tracing::info!("server done: {}", stats.summary());
        return Ok(());
    }

    let Some(dst) = cli.dst.as_ref() else {
        return Err(SyncError::Config(
            "destination path required (see --help)".to_string(),
        ));
    };

    if !cli.src.exists() {
        return Err(SyncError::Config(format!(
            "source {} does not exist",
            cli.src.display()
        )));
    }

    let stats = match split_remote(dst) {
        Some((host, remote_path)) => {
            let (transport, child) = spawn_remote(&host, &remote_path)?;
            let result = run_sender(transport, &cli.src, &opts);
            reap(child);
            result?
        }
        None => sync_local(&cli.src, dst, &opts)?,
    };

    if cli.stats || cli.verbose > 0 {
        eprintln!("{}", stats.summary());
        eprintln!(
            "{} bytes on wire in {:.2}s",
            stats.bytes_on_wire,
            stats.elapsed.as_secs_f64()
        );
    }
    Ok(())
}

/// `host:path` destinations select remote mode. A path with no colon, or
/// a colon inside a path component that exists locally, stays local.
fn split_remote(dst: &std::path::Path) -> Option<(String, String)> {
    let text = dst.to_str()?;
    let (host, path) = text.split_once(':')?;
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some((host.to_string(), path.to_string()))
}

/// Bootstrap the receiving peer over a remote shell and hand its
/// stdin/stdout to the session as the transport.
fn spawn_remote(host: &str, remote_path: &str) -> Result<(Transport, Child), SyncError> {
    let mut child = Command::new("ssh")
        .arg("-o")
        .arg("Compression=no")
        .arg(host)
        .arg(format!("psync --server {remote_path}"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| SyncError::Config(format!("cannot spawn ssh: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SyncError::Config("ssh child has no stdout".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SyncError::Config("ssh child has no stdin".to_string()))?;

    Ok((
        Transport::new(Box::new(stdout), Box::new(stdin)),
        child,
    ))
}

fn reap(mut child: Child) {
    match child.wait() {
        Ok(status) if !status.success() => {
            tracing::warn!(%status, "remote peer exited with failure");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to reap remote peer"),
    }
}
