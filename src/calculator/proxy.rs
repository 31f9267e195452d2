use std::net::SocketAddr;
use std::sync::Arc;

use super::proto::{
    AddRequest, AddResponse, DisconnectRequest, DisconnectResponse, EchoRequest, EchoResponse,
    ForwardRequest, ForwardResponse, PanicRequest, PanicResponse, PingRequest, PingResponse,
    SendStringsRequest, SendStringsResponse, SleepRequest, SleepResponse, WhoAmIRequest,
    WhoAmIResponse,
};
use super::{
    ADD_METHOD, CALCULATOR_SERVICE_NAME, DISCONNECT_METHOD, ECHO_METHOD, FORWARD_METHOD,
    PANIC_METHOD, PING_METHOD, SEND_STRINGS_METHOD, SLEEP_METHOD, WHO_AM_I_METHOD,
};
use crate::rpc::{Messenger, Proxy, RpcController, RpcError, UserCredentials};

/// Typed client for [`CalculatorService`](super::CalculatorService).
#[derive(Debug, Clone)]
pub struct CalculatorServiceProxy {
    proxy: Proxy,
}

impl CalculatorServiceProxy {
    pub fn new(messenger: Arc<Messenger>, remote: SocketAddr) -> Self {
        Self {
            proxy: Proxy::new(messenger, remote, CALCULATOR_SERVICE_NAME),
        }
    }

    pub fn with_credentials(self, credentials: UserCredentials) -> Self {
        Self {
            proxy: self.proxy.with_credentials(credentials),
        }
    }

    /// The untyped proxy underneath, for raw calls against the same service.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub async fn add(
        &self,
        request: &AddRequest,
        controller: &mut RpcController,
    ) -> Result<AddResponse, RpcError> {
        self.proxy.sync_request(ADD_METHOD, request, controller).await
    }

    pub async fn sleep(
        &self,
        request: &SleepRequest,
        controller: &mut RpcController,
    ) -> Result<SleepResponse, RpcError> {
        self.proxy.sync_request(SLEEP_METHOD, request, controller).await
    }

    pub async fn send_strings(
        &self,
        request: &SendStringsRequest,
        controller: &mut RpcController,
    ) -> Result<SendStringsResponse, RpcError> {
        self.proxy.sync_request(SEND_STRINGS_METHOD, request, controller).await
    }

    pub async fn echo(
        &self,
        request: &EchoRequest,
        controller: &mut RpcController,
    ) -> Result<EchoResponse, RpcError> {
        self.proxy.sync_request(ECHO_METHOD, request, controller).await
    }

    pub async fn who_am_i(
        &self,
        request: &WhoAmIRequest,
        controller: &mut RpcController,
    ) -> Result<WhoAmIResponse, RpcError> {
        self.proxy.sync_request(WHO_AM_I_METHOD, request, controller).await
    }

    pub async fn panic(
        &self,
        request: &PanicRequest,
        controller: &mut RpcController,
    ) -> Result<PanicResponse, RpcError> {
        self.proxy.sync_request(PANIC_METHOD, request, controller).await
    }

    pub async fn ping(
        &self,
        request: &PingRequest,
        controller: &mut RpcController,
    ) -> Result<PingResponse, RpcError> {
        self.proxy.sync_request(PING_METHOD, request, controller).await
    }

    pub async fn disconnect(
        &self,
        request: &DisconnectRequest,
        controller: &mut RpcController,
    ) -> Result<DisconnectResponse, RpcError> {
        self.proxy.sync_request(DISCONNECT_METHOD, request, controller).await
    }

    pub async fn forward(
        &self,
        request: &ForwardRequest,
        controller: &mut RpcController,
    ) -> Result<ForwardResponse, RpcError> {
        self.proxy.sync_request(FORWARD_METHOD, request, controller).await
    }
}
