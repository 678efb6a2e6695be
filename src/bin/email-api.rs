use email_relay::amqp::AmqpPublisher;
use email_relay::api::{self, ApiState};
use email_relay::RelayConfig;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), email_relay::WorkerError> {
    let config = RelayConfig::from_env()?;
    let bind_addr = config.api_bind_addr;

    let state = ApiState::new(Arc::new(AmqpPublisher::new(config)));
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    log::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
