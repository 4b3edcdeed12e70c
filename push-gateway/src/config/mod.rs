pub mod settings;

pub use settings::GatewayConfig;
