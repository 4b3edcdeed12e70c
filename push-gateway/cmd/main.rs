use anyhow::Result;
use tracing::info;

use push_gateway::{ApplicationBootstrap, GatewayConfig};
use push_gateway_core::load_config;
use push_gateway_core::tracing::init_tracing_from_config;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("PUSH_GATEWAY_CONFIG").ok();
    let app_config = load_config(config_path.as_deref());
    init_tracing_from_config(Some(&app_config.logging));

    let config = GatewayConfig::from_app_config(app_config);
    info!(
        node_id = %config.node_id,
        exchange_async = config.exchange_async,
        "starting push gateway"
    );

    ApplicationBootstrap::run(config).await
}
