//! Server side view of a single call.
//!
//! An [`InboundCall`] owns the only [`Responder`] for its call id, so the response is
//! sent at most once no matter which execution context completes it. A call dropped
//! without a response still answers the client with [`ErrorCode::Fatal`].

use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use prost::Message;
use tracing::warn;

use crate::rpc::connection::ConnectionHandle;
use crate::rpc::error::RpcError;
use crate::rpc::wire::{ErrorCode, ErrorStatus, RequestFrame, ResponseFrame, UserCredentialsPb};

/// The identity a client presents when it opens a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserCredentials {
    real_user: String,
    effective_user: Option<String>,
}

impl UserCredentials {
    pub fn new(real_user: impl Into<String>) -> Self {
        Self {
            real_user: real_user.into(),
            effective_user: None,
        }
    }

    pub fn with_effective_user(mut self, effective_user: impl Into<String>) -> Self {
        self.effective_user = Some(effective_user.into());
        self
    }

    /// Credentials of the user running this process.
    pub fn current() -> Self {
        let real_user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self::new(real_user)
    }

    pub fn real_user(&self) -> &str {
        &self.real_user
    }

    pub fn effective_user(&self) -> Option<&str> {
        self.effective_user.as_deref()
    }
}

impl From<UserCredentialsPb> for UserCredentials {
    fn from(pb: UserCredentialsPb) -> Self {
        Self {
            real_user: pb.real_user,
            effective_user: pb.effective_user,
        }
    }
}

impl From<&UserCredentials> for UserCredentialsPb {
    fn from(creds: &UserCredentials) -> Self {
        Self {
            real_user: creds.real_user.clone(),
            effective_user: creds.effective_user.clone(),
        }
    }
}

/// Delivers the response frame for one call id, once.
#[derive(Clone)]
pub(crate) struct ResponseSink {
    call_id: u64,
    connection: ConnectionHandle,
    completed: Arc<AtomicBool>,
    max_message_size: usize,
}

impl ResponseSink {
    pub(crate) fn new(call_id: u64, connection: ConnectionHandle, max_message_size: usize) -> Self {
        Self {
            call_id,
            connection,
            completed: Arc::new(AtomicBool::new(false)),
            max_message_size,
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Send `frame` unless a response already went out. Returns whether it was sent.
    fn send(&self, frame: ResponseFrame) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            warn!(call_id = self.call_id, "Ignoring second response for call");
            return false;
        }
        let bytes = match crate::rpc::wire::encode_frame(&frame, self.max_message_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(call_id = self.call_id, error = %e, "Response does not fit in a frame");
                let status = ErrorStatus {
                    code: ErrorCode::Application.into(),
                    message: e.to_string(),
                    app_error_ext: None,
                    app_error_payload: Bytes::new(),
                };
                match crate::rpc::wire::encode_frame(
                    &failure_frame(self.call_id, status),
                    self.max_message_size,
                ) {
                    Ok(bytes) => bytes,
                    Err(_) => return false,
                }
            }
        };
        self.connection.send_frame(bytes)
    }

    pub(crate) fn succeed(&self, payload: Bytes, sidecars: Vec<Bytes>) -> bool {
        self.send(ResponseFrame {
            call_id: self.call_id,
            error: None,
            payload,
            sidecars,
        })
    }

    pub(crate) fn fail(&self, status: ErrorStatus) -> bool {
        self.send(failure_frame(self.call_id, status))
    }
}

fn failure_frame(call_id: u64, status: ErrorStatus) -> ResponseFrame {
    ResponseFrame {
        call_id,
        error: Some(status),
        payload: Bytes::new(),
        sidecars: Vec::new(),
    }
}

pub(crate) fn status(code: ErrorCode, message: impl Into<String>) -> ErrorStatus {
    ErrorStatus {
        code: code.into(),
        message: message.into(),
        app_error_ext: None,
        app_error_payload: Bytes::new(),
    }
}

/// Single-use completion token for a call.
///
/// Dropping it without responding answers the call with a fatal error, except while
/// unwinding: a panicking handler is reported by the service pool instead.
pub struct Responder {
    sink: ResponseSink,
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.sink.is_completed() || std::thread::panicking() {
            return;
        }
        warn!(call_id = self.sink.call_id, "Responder dropped without sending response");
        self.sink
            .fail(status(ErrorCode::Fatal, "call dropped without a response"));
    }
}

/// A call received by a messenger, not yet answered.
pub struct InboundCall {
    service_name: String,
    method_name: String,
    payload: Bytes,
    deadline: Option<Instant>,
    credentials: Arc<UserCredentials>,
    connection: ConnectionHandle,
    sidecars: Vec<Bytes>,
    sidecar_bytes: usize,
    sidecar_budget: usize,
    responder: Responder,
}

impl InboundCall {
    pub(crate) fn new(
        frame: RequestFrame,
        credentials: Arc<UserCredentials>,
        sink: ResponseSink,
        sidecar_budget: usize,
    ) -> Self {
        let received = Instant::now();
        let deadline = frame
            .timeout_millis
            .and_then(|ms| received.checked_add(Duration::from_millis(ms)));
        Self {
            service_name: frame.service_name,
            method_name: frame.method_name,
            payload: frame.payload,
            deadline,
            credentials,
            connection: sink.connection.clone(),
            sidecars: Vec::new(),
            sidecar_bytes: 0,
            sidecar_budget,
            responder: Responder { sink },
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// The request body exactly as the client encoded it.
    pub fn serialized_request(&self) -> &Bytes {
        &self.payload
    }

    /// The point in time after which the client stops waiting, `None` if unbounded.
    pub fn client_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn user_credentials(&self) -> &UserCredentials {
        &self.credentials
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote()
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection.clone()
    }

    /// Total sidecar bytes the response may carry.
    pub fn sidecar_budget(&self) -> usize {
        self.sidecar_budget
    }

    /// Sidecar bytes that can still be attached to the response.
    pub fn remaining_sidecar_budget(&self) -> usize {
        self.sidecar_budget.saturating_sub(self.sidecar_bytes)
    }

    /// Attach `sidecar` to the response and return its index.
    pub fn add_sidecar(&mut self, sidecar: Bytes) -> Result<usize, RpcError> {
        let total = self.sidecar_bytes + sidecar.len();
        if total > self.sidecar_budget {
            return Err(RpcError::SidecarBudget {
                budget: self.sidecar_budget,
            });
        }
        self.sidecar_bytes = total;
        self.sidecars.push(sidecar);
        Ok(self.sidecars.len() - 1)
    }

    pub fn respond_success<M: Message>(mut self, response: &M) {
        let sidecars = std::mem::take(&mut self.sidecars);
        self.responder
            .sink
            .succeed(Bytes::from(response.encode_to_vec()), sidecars);
    }

    pub fn respond_failure(self, code: ErrorCode, message: impl Into<String>) {
        self.responder.sink.fail(status(code, message));
    }

    /// Relay `err` to the client, keeping its classification.
    pub fn respond_error(self, err: &RpcError) {
        self.responder.sink.fail(err.to_status());
    }

    pub fn respond_application_error<E: Message>(
        self,
        ext: u32,
        message: impl Into<String>,
        error: &E,
    ) {
        self.responder.sink.fail(ErrorStatus {
            code: ErrorCode::Application.into(),
            message: message.into(),
            app_error_ext: Some(ext),
            app_error_payload: Bytes::from(error.encode_to_vec()),
        });
    }

    pub(crate) fn response_sink(&self) -> ResponseSink {
        self.responder.sink.clone()
    }
}

impl fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCall")
            .field("call_id", &self.responder.sink.call_id)
            .field("service_name", &self.service_name)
            .field("method_name", &self.method_name)
            .field("remote", &self.connection.remote())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Typed completion token handed to service handlers.
///
/// Move-only: whoever holds it answers the call, from any task, exactly once.
pub struct RpcContext<Resp> {
    call: InboundCall,
    _response: PhantomData<fn() -> Resp>,
}

impl<Resp: Message> RpcContext<Resp> {
    /// Decode the request of `call`, answering it with `InvalidRequest` on failure.
    pub fn decode<Req: Message + Default>(call: InboundCall) -> Option<(Req, Self)> {
        match Req::decode(call.serialized_request().clone()) {
            Ok(request) => Some((
                request,
                Self {
                    call,
                    _response: PhantomData,
                },
            )),
            Err(e) => {
                warn!(method = %call.method_name(), error = %e, "Couldn't parse request");
                call.respond_failure(
                    ErrorCode::InvalidRequest,
                    format!("couldn't parse request: {e}"),
                );
                None
            }
        }
    }

    pub fn respond_success(self, response: Resp) {
        self.call.respond_success(&response);
    }

    pub fn respond_application_error<E: Message>(
        self,
        ext: u32,
        message: impl Into<String>,
        error: &E,
    ) {
        self.call.respond_application_error(ext, message, error);
    }

    pub fn respond_failure(self, err: &RpcError) {
        self.call.respond_error(err);
    }

    pub fn client_deadline(&self) -> Option<Instant> {
        self.call.client_deadline()
    }

    pub fn user_credentials(&self) -> &UserCredentials {
        self.call.user_credentials()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.call.remote_address()
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.call.connection()
    }

    pub fn add_sidecar(&mut self, sidecar: Bytes) -> Result<usize, RpcError> {
        self.call.add_sidecar(sidecar)
    }

    pub(crate) fn call_mut(&mut self) -> &mut InboundCall {
        &mut self.call
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::proto::AddRequest;
    use crate::rpc::connection::Outbound;
    use bytes::Buf;
    use tokio::sync::mpsc;

    fn read_test_frame(out: Outbound) -> ResponseFrame {
        match out {
            Outbound::Frame(mut bytes) => {
                bytes.advance(4);
                ResponseFrame::decode(bytes).unwrap()
            }
            Outbound::Close => panic!("unexpected close"),
        }
    }

    fn inbound_call(
        timeout_millis: Option<u64>,
        budget: usize,
    ) -> (InboundCall, mpsc::UnboundedReceiver<Outbound>) {
        let (connection, rx) = ConnectionHandle::new("127.0.0.1:4000".parse().unwrap());
        let frame = RequestFrame {
            call_id: 42,
            service_name: "svc".to_string(),
            method_name: "Add".to_string(),
            timeout_millis,
            payload: AddRequest { x: 1, y: 2 }.encode_to_vec().into(),
        };
        let sink = ResponseSink::new(42, connection, 1024 * 1024);
        let call = InboundCall::new(frame, Arc::new(UserCredentials::new("alice")), sink, budget);
        (call, rx)
    }

    #[test]
    fn test_deadline_absent_without_timeout() {
        let (call, _rx) = inbound_call(None, 1024);
        assert!(call.client_deadline().is_none());

        let (call, _rx) = inbound_call(Some(1000), 1024);
        let deadline = call.client_deadline().unwrap();
        assert!(deadline > Instant::now());
        call.respond_failure(ErrorCode::Application, "done");
    }

    #[test]
    fn test_response_is_sent_exactly_once() {
        let (call, mut rx) = inbound_call(None, 1024);
        let sink = call.response_sink();

        call.respond_success(&AddRequest { x: 3, y: 0 });
        assert!(!sink.fail(status(ErrorCode::Fatal, "late")));

        let frame = read_test_frame(rx.try_recv().unwrap());
        assert_eq!(frame.call_id, 42);
        assert!(frame.error.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_call_answers_fatal() {
        let (call, mut rx) = inbound_call(None, 1024);
        drop(call);

        let frame = read_test_frame(rx.try_recv().unwrap());
        let error = frame.error.unwrap();
        assert_eq!(error.code, i32::from(ErrorCode::Fatal));
    }

    #[test]
    fn test_sidecars_respect_budget_and_order() {
        let (mut call, mut rx) = inbound_call(None, 10);

        assert_eq!(call.add_sidecar(Bytes::from_static(b"aaaa")).unwrap(), 0);
        assert_eq!(call.add_sidecar(Bytes::from_static(b"bbbbbb")).unwrap(), 1);
        assert!(matches!(
            call.add_sidecar(Bytes::from_static(b"c")),
            Err(RpcError::SidecarBudget { budget: 10 })
        ));

        call.respond_success(&AddRequest { x: 0, y: 0 });
        let frame = read_test_frame(rx.try_recv().unwrap());
        assert_eq!(
            frame.sidecars,
            vec![Bytes::from_static(b"aaaa"), Bytes::from_static(b"bbbbbb")]
        );
    }

    #[test]
    fn test_typed_decode_failure_is_invalid_request() {
        let (connection, mut rx) = ConnectionHandle::new("127.0.0.1:4000".parse().unwrap());
        let frame = RequestFrame {
            call_id: 5,
            service_name: "svc".to_string(),
            method_name: "Add".to_string(),
            timeout_millis: None,
            payload: Bytes::from_static(&[0xFF]),
        };
        let sink = ResponseSink::new(5, connection, 1024);
        let call = InboundCall::new(frame, Arc::new(UserCredentials::new("bob")), sink, 0);

        assert!(RpcContext::<AddRequest>::decode::<AddRequest>(call).is_none());
        let frame = read_test_frame(rx.try_recv().unwrap());
        assert_eq!(frame.error.unwrap().code, i32::from(ErrorCode::InvalidRequest));
    }
}
