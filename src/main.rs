use std::env;

use gobackup_operator::{config::AppConfig, State, OPERATOR};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    gobackup_operator::telemetry::init();

    // Initialize Kubernetes controller state
    let config_source = config::Config::builder()
        .add_source(
            config::File::with_name(env::var("APP_CONFIG").as_deref().unwrap_or(OPERATOR))
                .required(false),
        )
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;

    let settings = config_source.try_deserialize::<AppConfig>()?;
    info!(image = settings.backup_job_image, "Starting {OPERATOR}");

    let state = State::new(settings);
    gobackup_operator::run(state).await
}
