use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use usbwire::backend::sim::{demo_device, SimBackend};
use usbwire::backend::UsbBackend;
use usbwire::bindings::BindingStore;
use usbwire::config::{ConfigStore, JsonFileStore, ServerConfig};
use usbwire::device::{Busid, UsbDevice};
use usbwire::proto::{self, DeviceRecord, OpHeader};
use usbwire::server::Server;

const EXIT_GENERIC: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_NOT_FOUND: u8 = 3;
const EXIT_PERMISSION: u8 = 4;

#[derive(Parser)]
#[command(name = "usbwired", about = "USB/IP server: export local USB devices over TCP")]
struct Cli {
    /// JSON config file holding port, bindings, and knobs.
    #[arg(long, global = true, default_value = "/etc/usbwire/config.json")]
    config: PathBuf,

    /// Which device backend to drive (defaults to usbfs on Linux, sim
    /// elsewhere).
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Real devices via /dev/bus/usb (Linux only).
    #[cfg(target_os = "linux")]
    Usbfs,
    /// Simulated devices, for demos and tests.
    Sim,
}

impl Default for BackendKind {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        {
            BackendKind::Usbfs
        }
        #[cfg(not(target_os = "linux"))]
        {
            BackendKind::Sim
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the server until interrupted (the default).
    Serve,
    /// List exportable devices.
    List {
        /// List locally attached devices instead of asking the daemon.
        #[arg(short, long)]
        local: bool,
    },
    /// Export a device by busid.
    Bind { busid: String },
    /// Stop exporting a device.
    Unbind { busid: String },
    /// Report the state of a running server.
    Status,
}

fn make_backend(kind: BackendKind) -> Arc<dyn UsbBackend> {
    match kind {
        #[cfg(target_os = "linux")]
        BackendKind::Usbfs => Arc::new(usbwire::backend::usbfs::UsbfsBackend::new()),
        BackendKind::Sim => {
            let sim = SimBackend::new();
            sim.plug(demo_device(Busid::new(1, 1)));
            Arc::new(sim)
        }
    }
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let code = if is_permission_error(&e) {
                EXIT_PERMISSION
            } else {
                EXIT_GENERIC
            };
            eprintln!("usbwired: {e:#}");
            ExitCode::from(code)
        }
    }
}

fn is_permission_error(e: &anyhow::Error) -> bool {
    for cause in e.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::PermissionDenied {
                return true;
            }
        }
        if matches!(
            cause.downcast_ref::<usbwire::backend::BackendError>(),
            Some(usbwire::backend::BackendError::AccessDenied(_))
        ) {
            return true;
        }
    }
    false
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let store = Arc::new(JsonFileStore::new(&cli.config));
    let backend = cli.backend.unwrap_or_default();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(store, backend).await,
        Command::List { local } => list(store, backend, local).await,
        Command::Bind { busid } => bind(store, backend, &busid, true).await,
        Command::Unbind { busid } => bind(store, backend, &busid, false).await,
        Command::Status => status(store).await,
    }
}

async fn serve(store: Arc<JsonFileStore>, backend: BackendKind) -> Result<ExitCode> {
    let config = store.load().context("loading config")?;
    init_tracing(&config);

    let backend = make_backend(backend);
    let server = Server::new(backend, store).context("initializing server")?;
    if let Err(e) = server.start().await {
        error!(error = %e, "server failed to start");
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupted, shutting down");
    server.stop().await;
    Ok(ExitCode::SUCCESS)
}

async fn list(store: Arc<JsonFileStore>, backend: BackendKind, local: bool) -> Result<ExitCode> {
    let bindings = BindingStore::open(store).context("loading config")?;
    if local {
        let backend = make_backend(backend);
        let mut devices = backend
            .enumerate()
            .await
            .context("enumerating local devices")?;
        devices.sort_by_key(|d| d.busid);
        if devices.is_empty() {
            println!("no local devices");
            return Ok(ExitCode::SUCCESS);
        }
        for dev in devices {
            let mark = if bindings.is_bound(&dev.busid) { "*" } else { " " };
            println!("{mark} {}", describe(&dev));
        }
        println!("(* = bound)");
    } else {
        let port = bindings.config().port;
        let devices = fetch_devlist(port)
            .await
            .with_context(|| format!("querying server on port {port}"))?;
        if devices.is_empty() {
            println!("no exported devices");
            return Ok(ExitCode::SUCCESS);
        }
        for record in devices {
            println!(
                "  {:<12} {:04x}:{:04x}",
                proto::trim_padded(&record.busid),
                record.id_vendor.get(),
                record.id_product.get()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(dev: &UsbDevice) -> String {
    let name = match (&dev.manufacturer, &dev.product) {
        (Some(m), Some(p)) => format!("{m} {p}"),
        (_, Some(p)) => p.clone(),
        _ => "unknown device".to_string(),
    };
    format!(
        "{:<12} {:04x}:{:04x}  {}",
        dev.busid.to_string(),
        dev.vendor_id,
        dev.product_id,
        name
    )
}

async fn bind(
    store: Arc<JsonFileStore>,
    backend: BackendKind,
    raw_busid: &str,
    bind: bool,
) -> Result<ExitCode> {
    let Ok(busid) = raw_busid.parse::<Busid>() else {
        eprintln!("usbwired: invalid busid {raw_busid:?} (expected e.g. \"1-2\")");
        return Ok(ExitCode::from(EXIT_USAGE));
    };
    let bindings = BindingStore::open(store).context("loading config")?;

    if bind {
        let present = make_backend(backend)
            .enumerate()
            .await
            .map(|devs| devs.iter().any(|d| d.busid == busid))
            .unwrap_or(false);
        bindings.bind(busid).context("persisting binding")?;
        if present {
            println!("bound {busid}");
        } else {
            println!("bound {busid} (device not currently attached)");
        }
    } else {
        if !bindings.unbind(&busid).context("persisting binding")? {
            eprintln!("usbwired: {busid} is not bound");
            return Ok(ExitCode::from(EXIT_NOT_FOUND));
        }
        println!("unbound {busid}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(store: Arc<JsonFileStore>) -> Result<ExitCode> {
    let config = store.load().context("loading config")?;
    match fetch_devlist(config.port).await {
        Ok(devices) => {
            println!("server: running on port {}", config.port);
            println!("exported devices: {}", devices.len());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("server: not reachable on port {} ({e})", config.port);
            Ok(ExitCode::from(EXIT_GENERIC))
        }
    }
}

/// Speak OP_REQ_DEVLIST to a running server; the wire protocol is the
/// only control surface.
async fn fetch_devlist(port: u16) -> Result<Vec<DeviceRecord>> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .context("connecting")?;
    stream
        .write_all(bytemuck::bytes_of(&OpHeader::new(proto::OP_REQ_DEVLIST, 0)))
        .await?;

    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    let header: OpHeader = *bytemuck::from_bytes(&header);
    anyhow::ensure!(
        header.version.get() == proto::USBIP_VERSION && header.code.get() == proto::OP_REP_DEVLIST,
        "unexpected reply {:#06x}/{:#06x}",
        header.version.get(),
        header.code.get()
    );
    anyhow::ensure!(header.status.get() == 0, "server reported status {}", header.status.get());

    let mut count = [0u8; 4];
    stream.read_exact(&mut count).await?;
    let count = u32::from_be_bytes(count);
    anyhow::ensure!(count <= 1024, "implausible device count {count}");

    let mut devices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut record = [0u8; 312];
        stream.read_exact(&mut record).await?;
        let record: DeviceRecord = *bytemuck::from_bytes(&record);
        let mut ifaces = vec![0u8; record.b_num_interfaces as usize * 4];
        stream.read_exact(&mut ifaces).await?;
        devices.push(record);
    }
    Ok(devices)
}
