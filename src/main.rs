use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use log::{debug, error, info, warn};
use qvantum2mqtt::api::{http_client, ApiClient, Session};
use qvantum2mqtt::auth::Authenticator;
use qvantum2mqtt::config::Config;
use qvantum2mqtt::mqtt::{MqttBridge, COMMAND_SUBSCRIPTION};
use qvantum2mqtt::poller::{fetch_devices, Poller};

#[derive(Parser)]
#[command(name = "qvantum2mqtt")]
#[command(about = "Control your Qvantum heat pump using MQTT", long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Print debug info
    #[arg(short, long)]
    debug: bool,

    /// Be verbose
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the command line flags
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("warn,qvantum2mqtt={}", level)),
    )
    .init();

    info!("Starting qvantum2mqtt");
    let config = Config::load(&cli.config)?;
    debug!("Loaded config from {}", cli.config.display());

    let http = http_client(config.api.request_timeout())?;
    let session = Session::new();
    let api = ApiClient::with_http(&config.api.api_endpoint, session.clone(), http.clone());

    info!(
        "Connecting to MQTT broker {}:{}",
        config.mqtt.server, config.mqtt.port
    );
    let (bridge, mut eventloop) = MqttBridge::new(&config.mqtt);
    if let Err(e) = bridge.wait_for_connection(&mut eventloop).await {
        error!("Couldn't connect to the MQTT broker: {}", e);
        return Err(e.into());
    }
    tokio::spawn(bridge.clone().run(eventloop, api.clone()));

    info!("Authenticating against Qvantum");
    let auth = Authenticator::new(config.api.clone(), session).with_http(http);
    auth.authenticate().await?;

    let user_id = api
        .whoami()
        .await?
        .and_then(|user| user.uid)
        .ok_or(qvantum2mqtt::Error::UnknownUser)?;

    info!("Fetching devices");
    let devices = fetch_devices(&api, &user_id).await;
    if devices.is_empty() {
        warn!("No heat pumps registered on this account");
    }
    info!("Found {} device(s)", devices.len());
    debug!("Fetched devices: {:?}", devices);

    bridge.add_subscription(COMMAND_SUBSCRIPTION).await?;

    let poller = Poller::new(api, auth, bridge, devices, &config);
    poller.configure_devices().await;
    poller.run().await;

    // The poll loop never returns in normal operation
    error!("Poll loop exited unexpectedly");
    Ok(())
}
