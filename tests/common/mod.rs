#![allow(dead_code)]

use std::sync::OnceLock;

use rpc_conformance::driver::client_messenger;
use rpc_conformance::rpc::Proxy;
use rpc_conformance::server::TestServer;

pub fn configure_tracing() {
    static TRACING_INIT: OnceLock<()> = OnceLock::new();
    TRACING_INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Proxy for the service hosted by `server`, on a fresh client messenger.
pub fn proxy_for(server: &TestServer, service_name: &str) -> Proxy {
    Proxy::new(client_messenger("client"), server.bound_endpoint(), service_name)
}
