use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::proto::{
    AddRequest, AddResponse, CalculatorError, DisconnectRequest, DisconnectResponse, EchoRequest,
    EchoResponse, ForwardRequest, ForwardResponse, PanicRequest, PanicResponse, PingRequest,
    PingResponse, SendStringsRequest, SendStringsResponse, SleepRequest, SleepResponse,
    WhoAmIRequest, WhoAmIResponse,
};
use super::{
    ADD_METHOD, CALCULATOR_ERROR_EXT, CALCULATOR_SERVICE_NAME, CalculatorServiceProxy,
    DISCONNECT_METHOD, ECHO_METHOD, FORWARD_METHOD, PANIC_METHOD, PING_METHOD,
    SEND_STRINGS_METHOD, SLEEP_METHOD, WHO_AM_I_METHOD, attach_generated_sidecars,
};
use crate::rpc::{
    ErrorCode, InboundCall, Messenger, MessengerRef, RpcContext, RpcController, RpcError, Service,
};

/// Calculator with typed handlers, including the ones that misbehave on purpose.
///
/// `name` identifies the instance in `Forward` responses. The messenger serving the
/// service is held through a [`MessengerRef`] so the service never keeps it alive.
#[derive(Debug)]
pub struct CalculatorService {
    name: String,
    messenger: OnceLock<MessengerRef>,
}

impl CalculatorService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messenger: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, request: AddRequest, context: RpcContext<AddResponse>) {
        context.respond_success(AddResponse {
            result: request.x.wrapping_add(request.y),
        });
    }

    async fn sleep(&self, request: SleepRequest, context: RpcContext<SleepResponse>) {
        if request.return_app_error {
            context.respond_application_error(
                CALCULATOR_ERROR_EXT,
                "Got some error",
                &CalculatorError::new("some application-specific error data"),
            );
            return;
        }

        if request.client_timeout_defined && context.client_deadline().is_none() {
            context.respond_application_error(
                CALCULATOR_ERROR_EXT,
                "Missing required timeout",
                &CalculatorError::new("Timeout not set"),
            );
            return;
        }

        let delay = Duration::from_micros(u64::from(request.sleep_micros));
        if request.deferred {
            debug!(?delay, "Deferring sleep response");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                context.respond_success(SleepResponse {});
            });
            return;
        }

        tokio::time::sleep(delay).await;
        context.respond_success(SleepResponse {});
    }

    async fn echo(&self, request: EchoRequest, context: RpcContext<EchoResponse>) {
        context.respond_success(EchoResponse { data: request.data });
    }

    async fn who_am_i(&self, _request: WhoAmIRequest, context: RpcContext<WhoAmIResponse>) {
        let response = WhoAmIResponse {
            credentials: Some(context.user_credentials().into()),
            address: context.remote_address().to_string(),
        };
        context.respond_success(response);
    }

    async fn panic(&self, _request: PanicRequest, _context: RpcContext<PanicResponse>) {
        info!("Got panic request");
        panic!("Test method panicking!");
    }

    async fn ping(&self, _request: PingRequest, context: RpcContext<PingResponse>) {
        context.respond_success(PingResponse {
            time: micros_since_epoch(SystemTime::now()),
        });
    }

    async fn disconnect(
        &self,
        _request: DisconnectRequest,
        context: RpcContext<DisconnectResponse>,
    ) {
        let connection = context.connection();
        context.respond_success(DisconnectResponse {});
        connection.close();
        info!(connection = %connection.id(), remote = %connection.remote(), "Disconnected caller");
    }

    async fn forward(&self, request: ForwardRequest, context: RpcContext<ForwardResponse>) {
        let (Some(host), Some(port)) = (request.host, request.port) else {
            context.respond_success(ForwardResponse {
                name: self.name.clone(),
            });
            return;
        };

        let target = match self.messenger().and_then(|messenger| {
            let ip = IpAddr::from_str(&host)
                .map_err(|e| RpcError::Network(format!("Invalid host: {e}")))?;
            let port = u16::try_from(port)
                .map_err(|_| RpcError::Network(format!("Invalid port: {port}")))?;
            Ok((messenger, SocketAddr::new(ip, port)))
        }) {
            Ok(target) => target,
            Err(e) => {
                warn!(host = %host, port, error = %e, "Can't forward call");
                context.respond_failure(&e);
                return;
            }
        };

        let (messenger, remote) = target;
        let mut controller = match context.client_deadline() {
            Some(deadline) => {
                RpcController::with_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => RpcController::new(),
        };

        debug!(remote = %remote, "Forwarding call");
        let proxy = CalculatorServiceProxy::new(messenger, remote);
        match proxy.forward(&ForwardRequest::default(), &mut controller).await {
            Ok(response) => context.respond_success(ForwardResponse {
                name: response.name,
            }),
            Err(e) => context.respond_failure(&e),
        }
    }

    async fn send_strings(
        &self,
        request: SendStringsRequest,
        mut context: RpcContext<SendStringsResponse>,
    ) {
        match attach_generated_sidecars(context.call_mut(), &request) {
            Ok(response) => context.respond_success(response),
            Err(e) => context.respond_failure(&e),
        }
    }

    fn messenger(&self) -> Result<Arc<Messenger>, RpcError> {
        self.messenger
            .get()
            .ok_or_else(|| RpcError::MessengerShutdown(self.name.clone()))?
            .get()
    }
}

/// Microseconds since the Unix epoch, saturating at `u64::MAX` and 0 before the epoch.
fn micros_since_epoch(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|since_epoch| u64::try_from(since_epoch.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

impl Service for CalculatorService {
    fn service_name(&self) -> &str {
        CALCULATOR_SERVICE_NAME
    }

    fn handle(&self, call: InboundCall) -> BoxFuture<'_, ()> {
        async move {
            let method = call.method_name().to_string();
            match method.as_str() {
                ADD_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.add(request, context).await;
                    }
                }
                SLEEP_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.sleep(request, context).await;
                    }
                }
                ECHO_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.echo(request, context).await;
                    }
                }
                WHO_AM_I_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.who_am_i(request, context).await;
                    }
                }
                PANIC_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.panic(request, context).await;
                    }
                }
                PING_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.ping(request, context).await;
                    }
                }
                DISCONNECT_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.disconnect(request, context).await;
                    }
                }
                FORWARD_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.forward(request, context).await;
                    }
                }
                SEND_STRINGS_METHOD => {
                    if let Some((request, context)) = RpcContext::decode(call) {
                        self.send_strings(request, context).await;
                    }
                }
                _ => call.respond_failure(ErrorCode::NoSuchMethod, "bad method"),
            }
        }
        .boxed()
    }

    fn bind_messenger(&self, messenger: &Arc<Messenger>) {
        if self.messenger.set(MessengerRef::new(messenger)).is_err() {
            warn!(service = %self.name, "Calculator already bound to a messenger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use prost::Message;
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::rpc::connection::Outbound;
    use crate::rpc::context::ResponseSink;
    use crate::rpc::wire::{RequestFrame, ResponseFrame};
    use crate::rpc::{ConnectionHandle, MessengerConfig, UserCredentials};

    #[test]
    fn test_micros_since_epoch_saturates() {
        let one_second = UNIX_EPOCH + Duration::from_secs(1);
        assert_eq!(micros_since_epoch(one_second), 1_000_000);

        let before_epoch = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(micros_since_epoch(before_epoch), 0);

        if let Some(far_future) = UNIX_EPOCH.checked_add(Duration::from_secs(1 << 50)) {
            assert_eq!(micros_since_epoch(far_future), u64::MAX);
        }
    }

    #[tokio::test]
    async fn test_deferred_sleep_answers_exactly_once() {
        let (connection, mut rx) = ConnectionHandle::new("127.0.0.1:4000".parse().unwrap());
        let request = SleepRequest {
            sleep_micros: 50_000,
            deferred: true,
            ..Default::default()
        };
        let frame = RequestFrame {
            call_id: 7,
            service_name: CALCULATOR_SERVICE_NAME.to_string(),
            method_name: SLEEP_METHOD.to_string(),
            timeout_millis: None,
            payload: request.encode_to_vec().into(),
        };
        let sink = ResponseSink::new(7, connection, 1024 * 1024);
        let call = InboundCall::new(frame, Arc::new(UserCredentials::new("alice")), sink, 1024);

        CalculatorService::new("calc").handle(call).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let Some(Outbound::Frame(mut bytes)) = rx.recv().await else {
            panic!("expected a response frame");
        };
        bytes.advance(4);
        let response = ResponseFrame::decode(bytes).unwrap();
        assert_eq!(response.call_id, 7);
        assert!(response.error.is_none());

        // The context is gone once answered, so the channel closes with nothing more on it.
        let rest = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(rest, Ok(None)));
    }

    #[tokio::test]
    async fn test_unbound_service_has_no_messenger() {
        let service = CalculatorService::new("calc");
        assert!(matches!(
            service.messenger(),
            Err(RpcError::MessengerShutdown(name)) if name == "calc"
        ));
    }

    #[tokio::test]
    async fn test_bound_messenger_is_not_kept_alive() {
        let service = CalculatorService::new("calc");
        let messenger = Messenger::new("TestServer", MessengerConfig::default());
        service.bind_messenger(&messenger);
        assert!(service.messenger().is_ok());

        drop(messenger);
        assert!(service.messenger().is_err());
    }
}
