use anyhow::{Context, Result};
use device_provisioner::{
    Callbacks, Provisioner,
    config::AppConfig,
    config_store::FileSectorStore,
    host::{HostPlatform, SimulatedWifi, TcpTransport},
    services::provisioning::Broker,
    timer::SystemClock,
};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use std::{future, io::Write};
use tokio::{
    signal::unix::{Signal, SignalKind, signal},
    sync::{broadcast, mpsc},
    time::{Instant, sleep_until},
};

enum ShutdownReason {
    Restart,
    Shutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Restart => write!(f, "restarting device"),
            ShutdownReason::Shutdown => write!(f, "shutting down"),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let (restart_tx, mut restart_rx) = broadcast::channel(1);
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    while let ShutdownReason::Restart =
        run_until_shutdown(&restart_tx, &mut restart_rx, &mut sigterm).await?
    {}

    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

async fn run_until_shutdown(
    restart_tx: &broadcast::Sender<()>,
    restart_rx: &mut broadcast::Receiver<()>,
    sigterm: &mut Signal,
) -> Result<ShutdownReason> {
    let config = AppConfig::get();
    info!("booting from {:?}", config.flash.image);

    let (wifi_tx, mut wifi_rx) = mpsc::unbounded_channel();
    let (net_tx, mut net_rx) = mpsc::unbounded_channel();
    let clock = SystemClock::new();

    let sectors = FileSectorStore::open(&config.flash.image).context("failed to open flash")?;
    let wifi = SimulatedWifi::new(
        wifi_tx,
        config.simulation.connect_ok,
        config.simulation.station_ip,
    )
    .with_station_file(&config.flash.station)
    .context("failed to open radio")?;

    let mut provisioner = Provisioner::new(
        sectors,
        wifi,
        HostPlatform::new(restart_tx.clone()),
        TcpTransport::new(net_tx),
        Box::new(clock),
    );

    let callbacks = Callbacks {
        on_ready: Some(Box::new(|broker: &Broker| {
            info!("operational, broker {}:{} as {}", broker.ip, broker.port, broker.user)
        })),
        on_disconnect: Some(Box::new(|| warn!("network lost"))),
    };

    provisioner
        .start(config.provision.options(), callbacks)
        .context("failed to start provisioning")?;

    let reason = loop {
        provisioner.poll();

        let deadline = provisioner
            .next_deadline()
            .map(|at| Instant::from_std(clock.instant_at(at)));
        let timer = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            _ = timer => {},
            Some(event) = wifi_rx.recv() => provisioner.handle_wifi_event(event),
            Some(event) = net_rx.recv() => provisioner.handle_transport_event(event),
            _ = restart_rx.recv() => {
                debug!("restart requested");
                break ShutdownReason::Restart;
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("ctrl-c received");
                break ShutdownReason::Shutdown;
            },
            _ = sigterm.recv() => {
                debug!("SIGTERM received");
                break ShutdownReason::Shutdown;
            },
        }
    };

    info!("{reason}");
    provisioner.stop();

    Ok(reason)
}
