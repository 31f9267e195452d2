mod common;

use std::time::Duration;

use rpc_conformance::calculator::{ADD_METHOD, GENERIC_SERVICE_NAME};
use rpc_conformance::driver::{do_test_sync_call, start_calculator_server, start_generic_server};
use rpc_conformance::server::TestServerOptions;

use common::{configure_tracing, proxy_for};

#[tokio::test(flavor = "multi_thread")]
async fn test_ephemeral_ports_are_distinct() {
    configure_tracing();
    let mut first = start_generic_server(TestServerOptions::default()).await.unwrap();
    let mut second = start_calculator_server("calc", TestServerOptions::default())
        .await
        .unwrap();

    assert_ne!(first.bound_endpoint().port(), 0);
    assert_ne!(first.bound_endpoint(), second.bound_endpoint());

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_twice_is_safe() {
    configure_tracing();
    let mut server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let proxy = proxy_for(&server, GENERIC_SERVICE_NAME);
    do_test_sync_call(&proxy, ADD_METHOD).await.unwrap();

    server.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
    assert!(server.messenger().services().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drop_without_shutdown_releases_endpoint() {
    configure_tracing();
    let server = start_generic_server(TestServerOptions::default()).await.unwrap();
    let endpoint = server.bound_endpoint();
    let messenger = server.messenger().clone();
    drop(server);

    assert!(messenger.is_shut_down());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tokio::net::TcpStream::connect(endpoint).await.is_err());
}
