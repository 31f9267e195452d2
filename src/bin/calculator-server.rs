use std::sync::Arc;

use anyhow::{Result, bail};
use rpc_conformance::calculator::{CalculatorService, GenericCalculatorService};
use rpc_conformance::rpc::Service;
use rpc_conformance::server::{TestServer, TestServerOptions};
use tracing::info;

const DEFAULT_ADDR: &str = "127.0.0.1:7150";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let addr = std::env::var("CALC_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let kind = std::env::var("CALC_SERVICE").unwrap_or_else(|_| "calculator".to_string());
    let name = std::env::var("CALC_NAME").unwrap_or_else(|_| "calculator-server".to_string());
    let workers = match std::env::var("CALC_WORKERS") {
        Ok(workers) => workers.parse()?,
        Err(_) => 3,
    };

    let service: Arc<dyn Service> = match kind.as_str() {
        "calculator" => Arc::new(CalculatorService::new(name.clone())),
        "generic" => Arc::new(GenericCalculatorService::new()?),
        other => bail!("unknown service kind '{other}', expected 'calculator' or 'generic'"),
    };

    let options = TestServerOptions::builder()
        .endpoint(addr.parse()?)
        .n_worker_threads(workers)
        .build();
    let mut server = TestServer::start(service, options).await?;

    info!(
        name = %name,
        service = %server.service_name(),
        endpoint = %server.bound_endpoint(),
        "Serving, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.shutdown().await?;
    Ok(())
}
