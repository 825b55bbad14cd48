use clap::{Parser, Subcommand};
use rayon::ThreadPoolBuilder;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use vbackup::backup::backup_config::BackupConfig;
use vbackup::backup::result_error::result::Result;
use vbackup::backup::run::{restore, Orchestrator, EXIT_FATAL};

/// Verified local backups with encrypted sensitive directories
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one backup
    Backup {
        /// Location of config file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Decrypt and unpack an encrypted archive
    Restore {
        /// Location of config file
        #[arg(short, long)]
        config: PathBuf,
        /// Encrypted archive (`<name>.tar.enc`)
        #[arg(short, long)]
        archive: PathBuf,
        /// Directory to unpack into
        #[arg(short, long)]
        into: PathBuf,
    },
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    match log_file {
        Some(path) => {
            let file: File = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => tracing_subscriber::fmt::init(),
    }
    Ok(())
}

fn backup(config: &Path) -> Result<u8> {
    let config = BackupConfig::from_yaml_file(config)?;

    let mut pool = ThreadPoolBuilder::new();
    if let Some(threads) = config.threads() {
        pool = pool.num_threads(threads);
    }
    let pool = Arc::new(pool.build()?);

    let summary = Orchestrator::builder()
        .config(config)
        .pool(pool)
        .build()
        .run()?;

    println!(
        "{} succeeded, {} failed",
        summary.success_count(),
        summary.fail_count()
    );
    Ok(summary.exit_code())
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(args.log_file.as_deref()) {
        eprintln!("Open log file failed: {e}");
        return ExitCode::from(EXIT_FATAL);
    }

    let res = match &args.command {
        Command::Backup { config } => backup(config),
        Command::Restore {
            config,
            archive,
            into,
        } => BackupConfig::from_yaml_file(config)
            .and_then(|bc| restore(&bc, archive, into))
            .map(|_| {
                info!("Restored {:?} into {:?}", archive, into);
                0
            }),
    };

    match res {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

