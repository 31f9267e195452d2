mod common;

use std::time::Duration;

use bytes::Bytes;
use rpc_conformance::calculator::proto::SleepRequest;
use rpc_conformance::calculator::{
    ADD_METHOD, GENERIC_SERVICE_NAME, SEND_STRINGS_METHOD, SLEEP_METHOD,
};
use rpc_conformance::driver::{
    client_messenger, do_test_expect_timeout, do_test_sidecar, do_test_sync_call,
    start_fake_server, start_generic_server,
};
use rpc_conformance::rpc::{ErrorKind, Proxy, RpcController};
use rpc_conformance::server::TestServerOptions;

use common::{configure_tracing, proxy_for};

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_call() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);

    for _ in 0..10 {
        do_test_sync_call(&proxy, ADD_METHOD).await.unwrap();
    }
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sidecars() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);

    do_test_sidecar(&proxy, &[], None).await;
    do_test_sidecar(&proxy, &[0, 1, 2, 3], None).await;
    do_test_sidecar(&proxy, &[123, 4567, 65536, 1 << 20], None).await;
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_sidecars_are_application_errors() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);

    do_test_sidecar(&proxy, &[9 * 1024 * 1024], Some(ErrorKind::Application)).await;
    let halves = [4 * 1024 * 1024, 4 * 1024 * 1024];
    do_test_sidecar(&proxy, &halves, Some(ErrorKind::Application)).await;
    do_test_sidecar(&proxy, &[u64::MAX], Some(ErrorKind::Application)).await;

    // The failure is per call.
    do_test_sidecar(&proxy, &[10, 20], None).await;
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_timeout() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);

    do_test_expect_timeout(&proxy, Duration::from_millis(50)).await;
    do_test_expect_timeout(&proxy, Duration::from_millis(200)).await;
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_to_silent_server_times_out() {
    configure_tracing();
    let (_listener, addr) = start_fake_server().await.unwrap();
    let proxy = Proxy::new(client_messenger("client"), addr, GENERIC_SERVICE_NAME);

    do_test_expect_timeout(&proxy, Duration::from_millis(100)).await;
    do_test_expect_timeout(&proxy, Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sleep_within_timeout_succeeds() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);

    let request = SleepRequest {
        sleep_micros: 1000,
        ..Default::default()
    };
    let mut controller = RpcController::with_timeout(Duration::from_secs(10));
    let result: Result<rpc_conformance::calculator::proto::SleepResponse, _> =
        proxy.sync_request(SLEEP_METHOD, &request, &mut controller).await;
    assert!(result.is_ok());
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_method_and_service() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);

    let mut controller = RpcController::with_timeout(Duration::from_secs(10));
    let err = proxy
        .call_raw("Multiply", Bytes::new(), &mut controller)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchMethod);

    let unknown = Proxy::new(
        proxy.messenger().clone(),
        server.bound_endpoint(),
        "rpc.NoSuchService",
    );
    let err = unknown
        .call_raw(ADD_METHOD, Bytes::new(), &mut controller)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchService);
    server.shutdown().await.unwrap();
}

// Malformed Add and SendStrings payloads are treated as broken invariants and answered
// with Fatal, while a malformed Sleep is an ordinary invalid request. Both are kept.
#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_payloads() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);
    let garbage = Bytes::from_static(&[0xFF]);
    let mut controller = RpcController::with_timeout(Duration::from_secs(10));

    for method in [ADD_METHOD, SEND_STRINGS_METHOD] {
        let err = proxy
            .call_raw(method, garbage.clone(), &mut controller)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal, "{method}: {err}");
    }

    let err = proxy
        .call_raw(SLEEP_METHOD, garbage, &mut controller)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    // Still serving.
    do_test_sync_call(&proxy, ADD_METHOD).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_calls_after_shutdown_fail() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);
    do_test_sync_call(&proxy, ADD_METHOD).await.unwrap();

    server.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = do_test_sync_call(&proxy, ADD_METHOD).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}
