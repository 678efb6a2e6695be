use email_relay::{EmailHandler, Json, RelayConfig, Worker};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(2);
        }
    };

    let handler = Arc::new(Json(EmailHandler::new(config.email_failure_rate)));
    let worker = Worker::new(handler, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl+C received. Finishing the current message before shutting down.");
        }
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    log::info!("Application has shut down.");
}
