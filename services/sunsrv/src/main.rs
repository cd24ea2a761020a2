//! SunSpec polling service (`sunsrv`)

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::wait_for_shutdown;
use sunsrv::core::bootstrap::Args;
use sunsrv::core::config::AppConfig;
use sunsrv::core::transport::{ModbusSession, TcpTransport};
use sunsrv::device::{DeviceCache, ModelResolver};
use sunsrv::runtime::{
    connect_with_backoff, spawn_background_reconnect, PingProbe, Poller, ReachabilityProbe,
    ReconnectError, RuntimeMonitor, SharedSession, SleepController, StatusReporter,
};
use sunsrv::sink::{MeasurementSink, TracingSink};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.init_logging(&config)
        .context("Failed to initialize logging")?;

    if args.validate {
        info!("Configuration valid");
        return Ok(());
    }

    let poller_config = args.poller_config(&config);
    if poller_config.inverters.is_empty() && poller_config.meters.is_empty() {
        bail!("Device filter {:?} leaves nothing to poll", args.device);
    }

    info!(
        "sunsrv {} starting, Modbus {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.modbus.host,
        config.modbus.port
    );

    let token = CancellationToken::new();
    let signal_task = {
        let token = token.clone();
        tokio::spawn(async move {
            let signal = wait_for_shutdown().await;
            info!("{signal} received, shutting down");
            token.cancel();
        })
    };

    let transport = TcpTransport::new(config.tcp_config()).context("Invalid Modbus transport")?;
    let session = ModbusSession::new(Box::new(transport), config.session_config());
    let modbus_connected = session.connection_flag();
    let session: SharedSession = Arc::new(Mutex::new(session));

    let mut tasks = Vec::new();
    match connect_with_backoff(&session, config.reconnect_policy(), &token).await {
        Ok(()) => info!("Connected to {}:{}", config.modbus.host, config.modbus.port),
        Err(ReconnectError::Cancelled) => {},
        Err(e) => {
            warn!("Modbus unavailable ({e}), continuing degraded");
            tasks.push(spawn_background_reconnect(
                Arc::clone(&session),
                config.reconnect_period(),
                token.clone(),
            ));
        },
    }

    let cache = DeviceCache::load(config.general.cache_path.clone()).await;
    info!("Device cache: {} entries", cache.len());

    let probe = config.modbus.ping_check_enabled.then(|| {
        Box::new(PingProbe::new(config.modbus.host.clone(), config.ping_timeout()))
            as Box<dyn ReachabilityProbe>
    });
    let sleep = Arc::new(SleepController::new(config.sleep_config(), probe));
    let monitor = Arc::new(RuntimeMonitor::new(config.monitor_config()));
    let sink: Arc<dyn MeasurementSink> = Arc::new(TracingSink::new(config.general.publish_mode));

    tasks.push(
        StatusReporter::new(
            Arc::clone(&monitor),
            Arc::clone(&sleep),
            Arc::clone(&sink),
            modbus_connected,
            config.general.health_file.clone(),
            config.status_interval(),
        )
        .spawn(token.clone()),
    );

    let mut poller = Poller::new(
        poller_config,
        Arc::clone(&session),
        ModelResolver::new(config.resolver_config()),
        cache,
        monitor,
        sleep,
        sink,
    );
    poller.run(token.clone()).await;

    token.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {e}");
        }
    }
    signal_task.abort();

    info!("sunsrv stopped");
    Ok(())
}
