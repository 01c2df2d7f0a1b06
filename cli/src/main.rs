/// CLI for the offline signer
use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use offline_signer::api::{self, DeleteParams, Request};
use offline_signer::{pcsc, Config, KeygenParams, Orchestrator, SignParams};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Offline MPC signer backed by a secure element
#[derive(Parser)]
#[command(author, version = option_env ! ("CARGO_PKG_VERSION").unwrap_or("unknown"), about,
long_about = None, propagate_version = true)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "OFFLINE_SIGNER_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Card reader name or part of it, overrides the configuration
    #[arg(long, global = true)]
    reader: Option<String>,
    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run key generation and store the share's wrap key on the secure element
    Keygen {
        #[arg(long)]
        threshold: u16,
        /// Number of parties
        #[arg(long)]
        parties: u16,
        /// This party's index, starting at 1
        #[arg(long)]
        index: u16,
        #[arg(long)]
        user: String,
        /// Share file name inside the temp directory
        #[arg(long)]
        filename: Option<String>,
    },
    /// Sign a message with an encrypted share
    Sign {
        /// Comma separated indices of the signing parties
        #[arg(long)]
        parties: String,
        /// Message to sign, as hex
        #[arg(long)]
        message: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        address: String,
        /// Encrypted share returned by keygen, base64
        #[arg(long)]
        encrypted_key: String,
        /// DER authorization signature, base64
        #[arg(long)]
        signature: String,
        #[arg(long)]
        filename: Option<String>,
    },
    /// Delete the record for a user and address from the secure element
    Delete {
        #[arg(long)]
        user: String,
        #[arg(long)]
        address: String,
        /// DER authorization signature, base64
        #[arg(long)]
        signature: String,
    },
    /// Print the card's Card Production Life Cycle data
    Cplc,
    /// List connected card readers
    Readers,
    /// Answer JSON requests, one per line, on stdin and stdout
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config)?;
    debug!(
        "Log rotation: max size {} MB, {} backups, {} days, compress {}",
        config.log_max_size, config.log_max_backups, config.log_max_age, config.log_compress
    );

    if let Command::Readers = cli.command {
        for reader in pcsc::list_readers()? {
            println!("{reader}");
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let orchestrator = Orchestrator::with_pcsc(config)?;
    let request = match cli.command {
        Command::Keygen {
            threshold,
            parties,
            index,
            user,
            filename,
        } => Request::Keygen(KeygenParams {
            threshold,
            parties,
            index,
            user_name: user,
            filename,
        }),
        Command::Sign {
            parties,
            message,
            user,
            address,
            encrypted_key,
            signature,
            filename,
        } => Request::Sign(SignParams {
            parties,
            message,
            user_name: user,
            address,
            envelope: decode_base64("encrypted key", &encrypted_key)?,
            signature: decode_base64("signature", &signature)?,
            filename,
        }),
        Command::Delete {
            user,
            address,
            signature,
        } => Request::Delete(DeleteParams {
            user_name: user,
            address,
            signature: decode_base64("signature", &signature)?,
        }),
        Command::Cplc => Request::GetCplc,
        Command::Serve => {
            info!("Serving requests on stdin");
            let input = BufReader::new(tokio::io::stdin());
            api::serve(Arc::new(orchestrator), input, tokio::io::stdout(), cancel).await?;
            return Ok(());
        }
        Command::Readers => return Ok(()),
    };

    let response = api::handle(&orchestrator, request, &cancel).await;
    println!("{}", response.to_json());
    if response.is_error() {
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(reader) = &cli.reader {
        config.card_reader_name = reader.clone();
    }
    config.debug |= cli.debug;
    config.validate()?;
    Ok(config)
}

/// Logs go to stderr, or to the configured log file, so stdout stays free for replies.
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.log_path() {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating log directory {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| anyhow!("failed to initialize logging: {e}"))
}

fn decode_base64(field: &str, value: &str) -> anyhow::Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .with_context(|| format!("{field} is not valid base64"))
}
