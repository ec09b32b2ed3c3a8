use std::net::SocketAddr;
use std::sync::Arc;

use securewatch::config::{AppConfig, MonitorConfig};
use securewatch::shutdown::shutdown_signal;
use securewatch::utils::logging::init_logging;
use securewatch::{app, AppState, Monitor};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // 1. Environment
    dotenvy::dotenv().ok();

    // 2. Configuration (logging is not up yet, report on stderr)
    let (app_config, monitor_config) = match load_config() {
        Ok(configs) => configs,
        Err(e) => {
            eprintln!("securewatch: {}", e);
            std::process::exit(2);
        }
    };

    // 3. Logging
    let _guard = init_logging(&monitor_config.general);
    info!(
        path = %app_config.monitor_config_path.display(),
        servers = monitor_config.identities().len(),
        "Configuration loaded"
    );

    if let Err(e) = run(app_config, monitor_config).await {
        error!(error = %e, "SecureWatch terminated");
        std::process::exit(1);
    }
}

fn load_config() -> Result<(AppConfig, MonitorConfig), Box<dyn std::error::Error>> {
    let app_config = AppConfig::from_env()?;
    let monitor_config = MonitorConfig::load(&app_config.monitor_config_path)?;
    Ok((app_config, monitor_config))
}

async fn run(app_config: AppConfig, monitor_config: MonitorConfig) -> Result<(), Box<dyn std::error::Error>> {
    // 4. Monitor
    let monitor = Monitor::start(&monitor_config, &app_config)?;

    // 5. Command API
    let state = AppState {
        commands: monitor.commands(),
        command_secret: Arc::from(app_config.command_secret.as_str()),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], app_config.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Command API listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Drain
    monitor.shutdown().await;
    Ok(())
}
