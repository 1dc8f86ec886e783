//! livestamp command-line entry point.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (bad arguments, unreadable config or packet, etc.)
//!   2 - Packet failed verification

use anyhow::{bail, Context, Result};
use livestamp::cli::{Args, Command, OutputFormat};
use livestamp::config::{positive_secs, Config, DEFAULT_CONFIG_FILE};
use livestamp::identity::IdentityBuilder;
use livestamp::models::ProofPacket;
use livestamp::orchestrator::{wrap_user_data, EncodedPacket, Orchestrator};
use livestamp::report;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // No logging needed to write a file
    if let Command::InitConfig { force } = args.command {
        return handle_init_config(force);
    }

    init_logging(&args);

    info!("livestamp v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Write a default .livestamp.toml.
fn handle_init_config(force: bool) -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() && !force {
        eprintln!(
            "⚠️  {} already exists. Use --force to overwrite it.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    std::fs::write(path, Config::default_toml())
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    Ok(())
}

/// Initialize logging from verbosity flags; `RUST_LOG` takes precedence.
fn init_logging(args: &Args) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(args.log_level()).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    let config = if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        Config::load(config_path)?
    } else {
        match Config::load_default() {
            Ok(Some(config)) => {
                info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
                config
            }
            Ok(None) => {
                debug!("No config file found, using defaults");
                Config::default()
            }
            Err(e) => {
                warn!("Failed to load config: {:#}", e);
                Config::default()
            }
        }
    };

    let mut config = config.sanitized();
    config.merge_with_args(args);
    Ok(config)
}

async fn run(args: Args) -> Result<i32> {
    let config = load_config(&args)?;

    match args.command.clone() {
        Command::Generate { output, user_text } => {
            handle_generate(&config, args.format, output, user_text).await
        }
        Command::Verify { packet, file } => handle_verify(&config, args.format, packet, file).await,
        Command::Live { count, .. } => handle_live(&config, args.format, count).await,
        Command::Status => handle_status(&config, args.format).await,
        Command::AddFile { path, alias } => handle_add_file(&config, &path, alias.as_deref()),
        Command::InitConfig { force } => handle_init_config(force).map(|_| 0),
    }
}

/// Sync time and refresh every chain, waiting for both.
async fn prime(orchestrator: &Orchestrator) {
    let (synced, refreshed) = tokio::join!(
        orchestrator.time().force_sync(),
        orchestrator.chains().force_update(None)
    );
    if !synced {
        warn!("No time source answered, using the local clock");
    }
    if !refreshed {
        warn!("No chain could be refreshed");
    }
}

async fn handle_generate(
    config: &Config,
    format: OutputFormat,
    output: Option<PathBuf>,
    user_text: Option<String>,
) -> Result<i32> {
    let orchestrator = Orchestrator::from_config(config);
    prime(&orchestrator).await;

    let user_data = user_text
        .filter(|text| !text.is_empty())
        .map(|text| wrap_user_data(Value::String(text)));
    let packet = orchestrator.generate_once(user_data).await;
    let encoded = orchestrator.encode(&packet)?;

    if encoded.needs_chunking() {
        warn!(
            "Packet is {} bytes, larger than one frame ({} bytes)",
            encoded.json.len(),
            config.encoder.max_data_size
        );
    }

    match output {
        Some(path) => {
            report::write_output(&encoded.json, &path)?;
            println!("✅ Packet #{} written to {}", packet.sequence_number, path.display());
        }
        None => match format {
            OutputFormat::Json => println!("{}", encoded.json),
            OutputFormat::Text => print!("{}", report::render_packet(&packet)),
        },
    }

    Ok(0)
}

async fn handle_verify(
    config: &Config,
    format: OutputFormat,
    packet: Option<String>,
    file: Option<PathBuf>,
) -> Result<i32> {
    let serialized = match (packet, file) {
        (Some(packet), _) => packet,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read packet file: {}", path.display()))?,
        (None, None) => bail!("No packet given"),
    };

    let orchestrator = Orchestrator::from_config(config);
    prime(&orchestrator).await;

    let verification = orchestrator.verify_packet(serialized.trim());
    match format {
        OutputFormat::Json => println!("{}", report::generate_json(&verification)?),
        OutputFormat::Text => print!("{}", report::render_verification(&verification)),
    }

    if verification.overall_valid() {
        Ok(0)
    } else {
        eprintln!("\n⛔ Packet did not verify (exit code 2).");
        Ok(2)
    }
}

async fn handle_live(config: &Config, format: OutputFormat, count: Option<u64>) -> Result<i32> {
    let orchestrator = Orchestrator::from_config(config);
    orchestrator.warm_up().await;

    let printed = Arc::new(AtomicU64::new(0));
    let done = Arc::new(Notify::new());

    let counter = Arc::clone(&printed);
    let notify = Arc::clone(&done);
    orchestrator.register_observer(move |packet: &ProofPacket, encoded: &EncodedPacket| -> Result<()> {
        match format {
            OutputFormat::Json => println!("{}", encoded.json),
            OutputFormat::Text => println!("{}", report::render_packet(packet)),
        }
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count.is_some_and(|limit| n >= limit) {
            notify.notify_one();
        }
        Ok(())
    });

    let interval = positive_secs(config.general.update_interval_secs)
        .unwrap_or(Duration::from_secs(5));
    orchestrator.start_continuous(Some(interval));
    println!("🔴 Live: one packet every {:.1}s, Ctrl-C to stop", interval.as_secs_f64());

    tokio::select! {
        _ = done.notified() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        }
    }

    orchestrator.stop_and_wait().await;
    println!("\n✅ Stopped after {} packets", printed.load(Ordering::SeqCst));
    Ok(0)
}

async fn handle_status(config: &Config, format: OutputFormat) -> Result<i32> {
    let orchestrator = Orchestrator::from_config(config);
    prime(&orchestrator).await;

    let stats = orchestrator.statistics();
    match format {
        OutputFormat::Json => println!("{}", report::generate_json(&stats)?),
        OutputFormat::Text => print!("{}", report::render_status(&stats)),
    }
    Ok(0)
}

fn handle_add_file(config: &Config, path: &Path, alias: Option<&str>) -> Result<i32> {
    let Some(identity_file) = config.identity.identity_file.as_deref() else {
        bail!("No identity file configured; pass --identity-file or set identity.identity_file");
    };

    let identity = IdentityBuilder::from_config(&config.identity);
    if !identity.add_file(path, alias) {
        bail!("Could not read {}", path.display());
    }
    identity.export(identity_file)?;

    println!(
        "✅ Added {} to identity, saved to {}",
        path.display(),
        identity_file.display()
    );
    println!("   Digest: {}", identity.get_digest());
    Ok(0)
}
