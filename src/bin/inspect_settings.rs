// Debug tool to inspect the settings and metrics the Qvantum API reports
// Run with: RUST_LOG=info cargo run --bin inspect_settings -- [config.toml]

use qvantum2mqtt::api::{http_client, ApiClient, Session};
use qvantum2mqtt::auth::Authenticator;
use qvantum2mqtt::config::Config;
use std::env;
use std::error::Error;

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    println!("Authenticating against Qvantum...");
    let http = http_client(config.api.request_timeout())?;
    let session = Session::new();
    let auth = Authenticator::new(config.api.clone(), session.clone()).with_http(http.clone());
    auth.authenticate().await?;
    let api = ApiClient::with_http(&config.api.api_endpoint, session, http);

    let user_id = api
        .whoami()
        .await?
        .and_then(|user| user.uid)
        .ok_or("Could not resolve the account user id")?;

    println!("Fetching devices...");
    let devices = api
        .get_pumps(&user_id)
        .await?
        .ok_or("Device list unavailable")?
        .devices;
    println!("Found {} device(s)\n", devices.len());

    for device in devices {
        println!("Device: {}", device.id);
        println!("  Vendor: {}", device.vendor.as_deref().unwrap_or("-"));
        println!("  Model: {}", device.model.as_deref().unwrap_or("-"));
        println!("  Serial: {}", device.serial.as_deref().unwrap_or("-"));

        println!("\nSettings:");
        let inventory = api.get_settings_inventory(&device.id).await?;
        let current = api.get_settings(&device.id).await?;
        for setting in inventory.map(|i| i.settings).unwrap_or_default() {
            let value = current
                .as_ref()
                .and_then(|c| c.settings.iter().find(|s| s.name == setting.name))
                .and_then(|s| s.value.as_ref())
                .map(|v| serde_json::to_string(v).unwrap_or_default())
                .unwrap_or_else(|| "-".to_string());
            println!("  - Name: {}", setting.name);
            println!("    Type: {}", setting.data_type.as_deref().unwrap_or("-"));
            println!("    Read-only: {}", setting.read_only);
            println!("    Value: {}", value);
            println!();
        }

        println!("Metrics:");
        let metrics = api.get_metrics_inventory(&device.id).await?;
        for metric in metrics.map(|m| m.metrics).unwrap_or_default() {
            println!(
                "  - {} ({})",
                metric.name,
                metric.unit.as_deref().unwrap_or("no unit")
            );
        }
        println!("{}", "=".repeat(60));
    }

    Ok(())
}
