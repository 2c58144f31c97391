pub mod config;
pub mod error;
mod logging;
pub mod runtime;
pub mod services;

pub use config::AppConfig;
pub use error::AppError;

pub fn run() -> Result<(), AppError> {
    logging::init()?;

    // A missing .env file is fine; real deployments use the environment.
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    tracing::info!(
        db_path = %config.db_path,
        device = ?config.device_source,
        "parksense monitor starting"
    );

    runtime::run(config)
}
