//! coffer: manage encrypted single-file volumes
//!
//! Commands:
//!   create <file>   - create a fresh volume
//!   check <file>    - cross-check bitmaps against the directory tree
//!   info <file>     - free-space and geometry numbers
//!
//! Exit codes: 0 success, 1 usage error, 2 bad passphrase, 3 I/O error,
//! 4 corruption detected.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing::info;

use coffer_fs::{FsError, MountOptions, Volume, VolumeOps};

#[derive(Parser, Debug)]
#[command(
    name = "coffer",
    version,
    about = "Encrypted single-file filesystem volumes",
    long_about = "coffer: create, inspect and verify encrypted volume files. \
                  Mounting is done by a separate filesystem bridge driving the \
                  volume operation surface."
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COFFER_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a fresh volume file
    Create {
        /// Path of the volume file to create
        file: PathBuf,
        /// Volume passphrase
        #[arg(long, env = "COFFER_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
        /// Extra mount options, comma separated (e.g. "cache_capacity=512")
        #[arg(long, short = 'o')]
        options: Option<String>,
    },

    /// Verify bitmap and tree consistency of a volume
    Check {
        /// Path of the volume file
        file: PathBuf,
        #[arg(long, env = "COFFER_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Show geometry and free-space numbers
    Info {
        /// Path of the volume file
        file: PathBuf,
        #[arg(long, env = "COFFER_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log);

    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("coffer: {err:#}");
            exit_code_for(&err)
        }
    }
}

fn run(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Create {
            file,
            passphrase,
            options,
        } => {
            let opts = build_options(passphrase, options.as_deref())?;
            let volume = Volume::create(&file, opts)
                .with_context(|| format!("creating volume {}", file.display()))?;
            volume.close()?;
            info!(file = %file.display(), "volume created");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Check { file, passphrase } => {
            let opts = read_only_options(passphrase)?;
            let volume = Volume::open(&file, opts)
                .with_context(|| format!("opening volume {}", file.display()))?;
            let report = volume.check()?;

            println!(
                "{} files, {} directories, {} used blocks, {} free blocks",
                report.files, report.directories, report.used_blocks, report.free_blocks
            );
            for finding in &report.findings {
                println!("  {finding}");
            }
            if report.is_clean() {
                println!("volume is clean");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{} problem(s) found", report.findings.len());
                Ok(ExitCode::from(4))
            }
        }

        Commands::Info { file, passphrase } => {
            let opts = read_only_options(passphrase)?;
            let volume = Volume::open(&file, opts)?;
            let statfs = volume.statfs()?;
            println!("block size:   {} bytes", statfs.block_size);
            println!("total blocks: {}", statfs.total_blocks);
            println!("free blocks:  {}", statfs.free_blocks);
            println!("name max:     {} bytes", statfs.name_max);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_options(passphrase: Option<String>, options: Option<&str>) -> anyhow::Result<MountOptions> {
    let mut opts = match options {
        Some(raw) => MountOptions::parse(raw)?,
        None => MountOptions::default(),
    };
    if let Some(pass) = passphrase {
        opts.passphrase = Some(SecretString::from(pass));
    }
    if opts.passphrase.is_none() {
        anyhow::bail!("a passphrase is required (--passphrase or COFFER_PASSPHRASE)");
    }
    Ok(opts)
}

fn read_only_options(passphrase: Option<String>) -> anyhow::Result<MountOptions> {
    let mut opts = build_options(passphrase, None)?;
    opts.read_only = true;
    Ok(opts)
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let code = match err.downcast_ref::<FsError>() {
        Some(FsError::BadPassphrase) => 2,
        Some(FsError::Io(_) | FsError::ShortRead { .. } | FsError::ShortWrite { .. }) => 3,
        Some(
            FsError::CorruptBlock(_) | FsError::InvalidHeader(_) | FsError::Poisoned,
        ) => 4,
        _ => 1,
    };
    ExitCode::from(code)
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
