//! Client side checks run against a [`TestServer`].
//!
//! The routines assert on what they observe and panic on a mismatch, so they can be used
//! directly inside tests as well as from the probe binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tracing::info;

use crate::calculator::proto::{
    AddRequest, AddResponse, SendStringsRequest, SendStringsResponse, SleepRequest, SleepResponse,
};
use crate::calculator::{
    CalculatorService, GenericCalculatorService, SEND_STRINGS_METHOD, SLEEP_METHOD,
};
use crate::payload::PayloadGenerator;
use crate::rpc::{ErrorKind, Messenger, MessengerConfig, Proxy, RpcController, RpcError};
use crate::server::{TestServer, TestServerOptions};

/// Seed the sidecar check asks the server to generate from.
pub const SIDECAR_SEED: u32 = 12345;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const SLEEP_FOR_TIMEOUT: Duration = Duration::from_millis(500);
const TIMEOUT_SLACK: Duration = Duration::from_millis(10);

/// Messenger for the client side of a test.
pub fn client_messenger(name: &str) -> Arc<Messenger> {
    Messenger::new(name, MessengerConfig::default())
}

/// Call `method` as an `Add` with random operands and check the sum.
pub async fn do_test_sync_call(proxy: &Proxy, method: &str) -> Result<(), RpcError> {
    let request = AddRequest {
        x: rand::random(),
        y: rand::random(),
    };
    let mut controller = RpcController::with_timeout(CALL_TIMEOUT);
    let response: AddResponse = proxy.sync_request(method, &request, &mut controller).await?;

    info!(x = request.x, y = request.y, result = response.result, "Add result");
    assert_eq!(response.result, request.x.wrapping_add(request.y));
    Ok(())
}

/// Ask for one sidecar per size and check the outcome.
///
/// With `expected` set, the call must fail with that kind. Otherwise every sidecar must
/// match, byte for byte and in order, the payloads regenerated locally from the seed.
pub async fn do_test_sidecar(proxy: &Proxy, sizes: &[u64], expected: Option<ErrorKind>) {
    let request = SendStringsRequest {
        random_seed: SIDECAR_SEED,
        sizes: sizes.to_vec(),
    };
    let mut controller = RpcController::with_timeout(CALL_TIMEOUT);
    let result: Result<SendStringsResponse, RpcError> = proxy
        .sync_request(SEND_STRINGS_METHOD, &request, &mut controller)
        .await;

    let response = match (result, expected) {
        (Ok(response), None) => response,
        (Err(e), Some(kind)) => {
            assert_eq!(e.kind(), kind, "Invalid status received: {e}");
            return;
        }
        (Ok(_), Some(kind)) => panic!("expected {kind:?} failure, call succeeded"),
        (Err(e), None) => panic!("Invalid status received: {e}"),
    };

    assert_eq!(response.sidecars.len(), sizes.len());
    let mut generator = PayloadGenerator::new(u64::from(SIDECAR_SEED));
    for (position, (&size, &index)) in sizes.iter().zip(&response.sidecars).enumerate() {
        let sidecar = match controller.sidecar(index as usize) {
            Ok(sidecar) => sidecar,
            Err(e) => panic!("Missing sidecar at {position} position: {e}"),
        };
        let expected = generator.next_payload(size as usize);
        assert_eq!(sidecar.len(), expected.len(), "Invalid sidecar size at {position} position");
        assert!(*sidecar == expected, "Invalid sidecar at {position} position");
    }
}

/// Sleep for 500 ms under a shorter `timeout` and check the call times out close to it.
pub async fn do_test_expect_timeout(proxy: &Proxy, timeout: Duration) {
    let request = SleepRequest {
        sleep_micros: SLEEP_FOR_TIMEOUT.as_micros() as u32,
        ..Default::default()
    };
    let mut controller = RpcController::with_timeout(timeout);

    let started = Instant::now();
    let result: Result<SleepResponse, RpcError> = proxy
        .sync_request(SLEEP_METHOD, &request, &mut controller)
        .await;
    let elapsed = started.elapsed();

    let Err(e) = result else {
        panic!("Sleep of {SLEEP_FOR_TIMEOUT:?} succeeded under a {timeout:?} timeout");
    };
    info!(error = %e, ?elapsed, "Call timed out");

    assert!(
        elapsed + TIMEOUT_SLACK >= timeout,
        "timed out after {elapsed:?}, well before {timeout:?}"
    );
    assert!(elapsed < SLEEP_FOR_TIMEOUT, "waited the full sleep ({elapsed:?})");
    assert!(e.is_timed_out(), "expected a timeout, got {e}");
}

/// Bind a listener that never accepts, so calls to it connect but are never answered.
///
/// The kernel completes handshakes from the backlog; the caller keeps the listener alive
/// for as long as the address should stay silent.
pub async fn start_fake_server() -> Result<(TcpListener, SocketAddr), RpcError> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    info!(endpoint = %addr, "Fake server listening");
    Ok((listener, addr))
}

/// Serve a [`GenericCalculatorService`].
pub async fn start_generic_server(options: TestServerOptions) -> Result<TestServer, RpcError> {
    TestServer::start(Arc::new(GenericCalculatorService::new()?), options).await
}

/// Serve a [`CalculatorService`] named `name`.
pub async fn start_calculator_server(
    name: &str,
    options: TestServerOptions,
) -> Result<TestServer, RpcError> {
    TestServer::start(Arc::new(CalculatorService::new(name)), options).await
}

