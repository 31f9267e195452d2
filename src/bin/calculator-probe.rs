use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, bail};
use rpc_conformance::calculator::proto::{EchoRequest, ForwardRequest, PingRequest, WhoAmIRequest};
use rpc_conformance::calculator::{
    ADD_METHOD, CALCULATOR_SERVICE_NAME, CalculatorServiceProxy, GENERIC_SERVICE_NAME,
};
use rpc_conformance::driver::{
    client_messenger, do_test_expect_timeout, do_test_sidecar, do_test_sync_call,
};
use rpc_conformance::rpc::{Proxy, RpcController};
use tracing::info;

const DEFAULT_ADDR: &str = "127.0.0.1:7150";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let addr: SocketAddr = std::env::var("CALC_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()?;
    let kind = std::env::var("CALC_SERVICE").unwrap_or_else(|_| "calculator".to_string());

    let service_name = match kind.as_str() {
        "calculator" => CALCULATOR_SERVICE_NAME,
        "generic" => GENERIC_SERVICE_NAME,
        other => bail!("unknown service kind '{other}', expected 'calculator' or 'generic'"),
    };

    let messenger = client_messenger("probe");
    let proxy = Proxy::new(messenger.clone(), addr, service_name);
    info!(remote = %addr, service = %service_name, "Probing server");

    do_test_sync_call(&proxy, ADD_METHOD).await?;
    info!("Sync call ok");

    do_test_sidecar(&proxy, &[], None).await;
    do_test_sidecar(&proxy, &[1, 100, 4096, 1 << 20], None).await;
    info!("Sidecars ok");

    do_test_expect_timeout(&proxy, Duration::from_millis(100)).await;
    info!("Timeout ok");

    if kind == "calculator" {
        let calculator = CalculatorServiceProxy::new(messenger.clone(), addr);
        let mut controller = RpcController::with_timeout(Duration::from_secs(10));

        let echo = calculator
            .echo(&EchoRequest { data: "probe".to_string() }, &mut controller)
            .await?;
        info!(data = %echo.data, "Echo ok");

        let who = calculator.who_am_i(&WhoAmIRequest {}, &mut controller).await?;
        info!(address = %who.address, credentials = ?who.credentials, "WhoAmI ok");

        let ping = calculator.ping(&PingRequest { id: 1 }, &mut controller).await?;
        info!(time = ping.time, "Ping ok");

        let forward = calculator
            .forward(&ForwardRequest::default(), &mut controller)
            .await?;
        info!(name = %forward.name, "Forward ok");
    }

    messenger.shutdown();
    info!("All probes passed");
    Ok(())
}
