use anyhow::Result;
use clap::Parser;
use facewatch::{FaceExtractor, FacewatchConfig, FacewatchService};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "facewatch")]
#[command(about = "CCTV face recognition system with stream monitoring and watch-list matching")]
#[command(version)]
#[command(long_about = "Watches a set of live video sources and continuously checks incoming \
video against a registry of known-face embeddings, raising detection events when a match \
occurs. Stream registrations, the person watch list, and detection events are persisted as \
flat JSON files.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "facewatch.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the system")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting Facewatch v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match FacewatchConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate()?;

    // The embedding extractor must be ready before the system advertises
    // itself: a backend failure here aborts startup.
    let extractor = build_extractor(&config)?;

    let mut builder = FacewatchService::builder().config(config);
    if let Some(extractor) = extractor {
        builder = builder.extractor(extractor);
    }

    let service = builder.build().map_err(|e| {
        error!("Failed to assemble service: {}", e);
        e
    })?;

    service.init().await?;
    service.start_all();
    service.start_scheduler();

    info!("Facewatch running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    service.shutdown().await;

    Ok(())
}

#[cfg(feature = "onnx")]
fn build_extractor(config: &FacewatchConfig) -> Result<Option<Box<dyn FaceExtractor>>> {
    if !config.detection.enabled {
        return Ok(None);
    }
    let extractor = facewatch::OnnxFaceExtractor::new(
        std::path::Path::new(&config.detection.detector_model_path),
        std::path::Path::new(&config.detection.recognition_model_path),
    )?;
    Ok(Some(Box::new(extractor)))
}

#[cfg(not(feature = "onnx"))]
fn build_extractor(config: &FacewatchConfig) -> Result<Option<Box<dyn FaceExtractor>>> {
    if !config.detection.enabled {
        return Ok(None);
    }
    anyhow::bail!(
        "Detection is enabled but no extractor backend is compiled in; \
         rebuild with --features onnx or set detection.enabled = false"
    )
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("facewatch={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    let default_config = r#"# Facewatch Configuration File
# This is the default configuration with all available options

[stream]
# Frame rate cap applied to every source
max_fps = 15
# Decode resolution (width, height)
resolution = [640, 480]
# Connectivity probe timeout in seconds
probe_timeout_secs = 10
# Consecutive read failures tolerated before a reconnect cycle
error_threshold = 10
# Fixed wait between reconnect attempts in seconds
reconnect_interval_secs = 5
# Reconnect attempts before a stream is marked stopped
max_reconnect_attempts = 5
# Upper bound on concurrently registered streams
max_streams = 16
# Per-worker join timeout during shutdown, in seconds
join_timeout_secs = 5

[detection]
# Whether the detection pipeline is active.
# Requires an extractor backend (build with --features onnx).
enabled = true
# Minimum detection score for a face to be evaluated
quality_threshold = 0.7
# Model paths for the onnx backend
detector_model_path = "./models/face_detector.onnx"
recognition_model_path = "./models/face_recognition.onnx"

[matcher]
# Cosine-similarity threshold for a qualifying match
similarity_threshold = 0.6
# Interval between scheduled detection passes, in seconds
detection_interval_secs = 2
# Font used for annotation labels
label_font_path = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"
label_font_size = 16.0

[persistence]
# Flat-file JSON databases
streams_file = "./data/streams.json"
persons_file = "./data/persons.json"
detections_file = "./data/detections.json"
"#;

    println!("{}", default_config);
}
