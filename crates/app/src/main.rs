use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use facade_core::{
    AppConfig, CameraService, ClientId, DeviceDescriptor, DeviceId, DeviceProperty,
    DevicePropertyKey, Discontinuity, FacadeError, Frame, Host, PropertyUpdate, ProviderProperty,
    ScheduledOutput, SinkClient, SinkSample, VideoFormat,
};
use tracing_subscriber::EnvFilter;

fn main() -> facade_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let service = CameraService::new(config.provider, Arc::new(LoggingHost))?;
    if let Some(path) = cli.state.as_deref().filter(|path| path.exists()) {
        let saved = std::fs::read_to_string(path)?;
        service.with_provider(|provider| provider.restore(&saved))?;
    }
    service.ensure_initialized()?;
    let state = cli.state.as_deref();

    match cli.command {
        Commands::Run {
            seconds,
            devices,
            relay,
        } => run_devices(&service, seconds, devices, relay),
        Commands::Export => run_export(&service),
        Commands::Import { input } => run_import(&service, &input, state),
        Commands::Create {
            name,
            width,
            height,
            frame_rate,
        } => run_create(&service, &name, width, height, frame_rate, state),
        Commands::Edit {
            id,
            dimensions,
            frame_rate,
        } => run_edit(&service, &id, dimensions, frame_rate, state),
        Commands::Delete { id } => run_delete(&service, &id, state),
        Commands::Properties { id, keys, raw } => {
            run_properties(&service, id.as_deref(), &keys, raw)
        }
    }
}

fn run_devices(
    service: &CameraService,
    seconds: u64,
    devices: usize,
    relay: bool,
) -> facade_core::Result<()> {
    tracing::info!(seconds, devices, relay, "streaming");

    let sessions = service.with_provider(|provider| {
        let base = provider.config().default_device_name.clone();
        let wanted = devices.min(provider.config().max_devices);
        while provider.len() < wanted {
            let name = format!("{base} {}", provider.len() + 1);
            provider.create_device(&name)?;
        }

        let mut sessions = Vec::new();
        for (index, device) in provider.devices().enumerate() {
            let received = Arc::new(AtomicU64::new(0));
            let gaps = Arc::new(AtomicU64::new(0));
            let (counter, gap_counter) = (received.clone(), gaps.clone());
            device.attach_consumer(Arc::new(move |frame: &Frame| {
                counter.fetch_add(1, Ordering::Relaxed);
                if frame.discontinuity().contains(Discontinuity::SAMPLE_DROPPED) {
                    gap_counter.fetch_add(1, Ordering::Relaxed);
                }
            }))?;

            let producer = if relay {
                let client = Arc::new(PatternClient::new(ClientId(index as u64 + 1), device.format()?));
                if device.authorize_sink(client.clone())? {
                    device.start_sink()?;
                }
                Some(client)
            } else {
                None
            };

            device.start_source()?;
            sessions.push(Session {
                id: device.id(),
                received,
                gaps,
                producer,
            });
        }
        Ok(sessions)
    })?;

    thread::sleep(Duration::from_secs(seconds));

    service.with_provider(|provider| {
        for session in &sessions {
            let device = provider.device(session.id)?;
            device.stop_source()?;
            if session.producer.is_some() {
                device.stop_sink()?;
            }

            let stats = device.stats()?;
            let acknowledged = session
                .producer
                .as_ref()
                .map(|client| client.acknowledged.load(Ordering::Relaxed));
            println!(
                "{} {:<12} received={} gaps={} stats={} acknowledged={}",
                session.id,
                device.name(),
                session.received.load(Ordering::Relaxed),
                session.gaps.load(Ordering::Relaxed),
                serde_json::to_string(&stats)?,
                acknowledged.map_or_else(|| "-".to_string(), |count| count.to_string()),
            );
        }
        Ok(())
    })
}

fn run_export(service: &CameraService) -> facade_core::Result<()> {
    let document = service.with_provider(|provider| provider.export())?;
    println!("{document}");
    Ok(())
}

fn run_import(service: &CameraService, input: &Path, state: Option<&Path>) -> facade_core::Result<()> {
    tracing::info!(?input, "importing desired state");
    let document = std::fs::read_to_string(input)?;

    let (report, exported) = service.with_provider(|provider| {
        let report = provider.import(&document)?;
        Ok((report, provider.export()?))
    })?;

    println!("{report}");
    for warning in &report.warnings {
        println!("  entry {}: {}", warning.index, warning.reason);
    }
    for failure in &report.failures {
        println!("  failed: {failure}");
    }
    finish(&exported, state)
}

fn run_create(
    service: &CameraService,
    name: &str,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<u32>,
    state: Option<&Path>,
) -> facade_core::Result<()> {
    let exported = service.with_provider(|provider| {
        let default = provider.config().default_format;
        let format = VideoFormat::new(
            width.unwrap_or(default.width),
            height.unwrap_or(default.height),
            frame_rate.unwrap_or(default.frame_rate),
        );
        let id = provider.create_device_with_format(name, format)?;
        println!("created {id}");
        provider.export()
    })?;
    finish(&exported, state)
}

fn run_edit(
    service: &CameraService,
    id: &str,
    dimensions: Option<String>,
    frame_rate: Option<u32>,
    state: Option<&Path>,
) -> facade_core::Result<()> {
    let id = parse_id(id)?;
    let updates: Vec<PropertyUpdate> = dimensions
        .map(PropertyUpdate::Dimensions)
        .into_iter()
        .chain(frame_rate.map(PropertyUpdate::FrameRate))
        .collect();
    if updates.is_empty() {
        return Err(FacadeError::msg("nothing to edit; pass --dimensions or --frame-rate"));
    }

    let exported = service.with_provider(|provider| {
        let changed = provider.set_properties(id, &updates)?;
        println!("{id} {}", if changed { "updated" } else { "unchanged" });
        provider.export()
    })?;
    finish(&exported, state)
}

fn run_delete(service: &CameraService, id: &str, state: Option<&Path>) -> facade_core::Result<()> {
    let id = parse_id(id)?;
    let exported = service.with_provider(|provider| {
        provider.destroy_device(id)?;
        println!("deleted {id}");
        provider.export()
    })?;
    finish(&exported, state)
}

fn run_properties(
    service: &CameraService,
    id: Option<&str>,
    codes: &[String],
    raw: bool,
) -> facade_core::Result<()> {
    let filter = id.map(parse_id).transpose()?;
    let keys = if codes.is_empty() {
        DevicePropertyKey::ALL.to_vec()
    } else {
        codes
            .iter()
            .map(|code| {
                DevicePropertyKey::from_code(code)
                    .ok_or_else(|| FacadeError::msg(format!("unknown property code `{code}`")))
            })
            .collect::<facade_core::Result<Vec<_>>>()?
    };

    service.with_provider(|provider| {
        let ids = match filter {
            Some(id) => vec![provider.device(id)?.id()],
            None => provider.device_ids(),
        };
        for id in ids {
            println!("{id}");
            for property in provider.get_properties(id, &keys)? {
                if raw {
                    let bytes: Vec<String> = property
                        .to_bytes()
                        .iter()
                        .map(|byte| format!("{byte:02x}"))
                        .collect();
                    println!("  {} {}", property.key().code(), bytes.join(" "));
                } else {
                    println!("  {} {property}", property.key().code());
                }
            }
        }
        Ok(())
    })
}

fn parse_id(text: &str) -> facade_core::Result<DeviceId> {
    text.parse::<DeviceId>()
        .map_err(|err| FacadeError::msg(format!("invalid device id `{text}`: {err}")))
}

/// Prints the resulting device set and saves it when a state file is in use.
fn finish(exported: &str, state: Option<&Path>) -> facade_core::Result<()> {
    println!("{exported}");
    if let Some(path) = state {
        std::fs::write(path, exported)?;
        tracing::info!(?path, "device set saved");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

struct Session {
    id: DeviceId,
    received: Arc<AtomicU64>,
    gaps: Arc<AtomicU64>,
    producer: Option<Arc<PatternClient>>,
}

/// Stand-in for an external producer: pushes one solid colour per client.
struct PatternClient {
    id: ClientId,
    frame: Bytes,
    acknowledged: AtomicU64,
}

impl PatternClient {
    fn new(id: ClientId, format: VideoFormat) -> Self {
        let shade = (id.0 as u8).wrapping_mul(64);
        let pixel = [shade, 255 - shade, 128, 255];
        let pixels = (format.width * format.height) as usize;
        Self {
            id,
            frame: Bytes::from(pixel.repeat(pixels)),
            acknowledged: AtomicU64::new(0),
        }
    }
}

impl SinkClient for PatternClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn consume_sample(&self) -> Option<SinkSample> {
        Some(SinkSample::new(self.frame.clone()))
    }

    fn scheduled_output(&self, output: ScheduledOutput) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(client = %self.id, sequence = output.sequence_number, "sample scheduled");
    }
}

/// Host that only logs what the provider tells it.
struct LoggingHost;

impl Host for LoggingHost {
    fn add_device(&self, device: &DeviceDescriptor) -> facade_core::Result<()> {
        tracing::info!(device = %device.id, name = %device.name, "host: device added");
        Ok(())
    }

    fn remove_device(&self, id: DeviceId) {
        tracing::info!(device = %id, "host: device removed");
    }

    fn device_properties_changed(&self, id: DeviceId, changed: &[DeviceProperty]) {
        for property in changed {
            tracing::info!(
                device = %id,
                property = property.key().code(),
                value = %property,
                "host: property changed"
            );
        }
    }

    fn provider_properties_changed(&self, changed: &[ProviderProperty]) {
        let keys: Vec<_> = changed.iter().map(ProviderProperty::key).collect();
        tracing::info!(?keys, "host: provider properties changed");
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Facade virtual camera provider", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Device set saved between runs; restored on start and rewritten by
    /// commands that change it.
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream from every device for a while and print per-device statistics.
    Run {
        /// How long to stream for.
        #[arg(short, long, default_value_t = 3)]
        seconds: u64,
        /// Create devices until at least this many exist.
        #[arg(short, long, default_value_t = 1)]
        devices: usize,
        /// Feed each device from an in-process sink client instead of the
        /// built-in animation.
        #[arg(short, long)]
        relay: bool,
    },
    /// Print the current device set as a desired-state document.
    Export,
    /// Reconcile the device set with a desired-state document.
    Import {
        /// Path to the desired-state document.
        input: PathBuf,
    },
    /// Create a device; unspecified format fields use the configured default.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        frame_rate: Option<u32>,
    },
    /// Change a device's format. Invalid values are ignored with a warning.
    Edit {
        #[arg(long)]
        id: String,
        /// New size as `WIDTHxHEIGHT`.
        #[arg(long)]
        dimensions: Option<String>,
        #[arg(long)]
        frame_rate: Option<u32>,
    },
    /// Destroy a device.
    Delete {
        #[arg(long)]
        id: String,
    },
    /// Print device properties.
    Properties {
        /// Only show this device.
        #[arg(long)]
        id: Option<String>,
        /// Only show these properties, by four-character code.
        #[arg(long = "key")]
        keys: Vec<String>,
        /// Print the encoded bytes handed to the host instead of the value.
        #[arg(long)]
        raw: bool,
    },
}
