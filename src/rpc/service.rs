use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::rpc::context::{InboundCall, status};
use crate::rpc::error::RpcError;
use crate::rpc::messenger::Messenger;
use crate::rpc::wire::ErrorCode;

/// Number of calls a service pool queues before answering `ServerTooBusy`.
pub const DEFAULT_QUEUE_LENGTH: usize = 50;

/// A service reachable through a messenger.
pub trait Service: Send + Sync + 'static {
    /// Fully qualified name the service is registered under.
    fn service_name(&self) -> &str;

    /// Handle one call. Every path must eventually answer `call`, from this task or
    /// from any task the call is moved to.
    fn handle(&self, call: InboundCall) -> BoxFuture<'_, ()>;

    /// Called once before registration with the messenger that will serve the service.
    fn bind_messenger(&self, _messenger: &Arc<Messenger>) {}
}

pub type MethodHandler = fn(InboundCall) -> BoxFuture<'static, ()>;

/// Routes untyped calls to handler functions by method name.
#[derive(Default)]
pub struct MethodTable {
    handlers: HashMap<&'static str, MethodHandler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        method: &'static str,
        handler: MethodHandler,
    ) -> Result<(), RpcError> {
        if self.handlers.insert(method, handler).is_some() {
            return Err(RpcError::DuplicateMethod(method.to_string()));
        }
        Ok(())
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Run the handler registered for the call's method, or answer `NoSuchMethod`.
    pub async fn dispatch(&self, call: InboundCall) {
        match self.handlers.get(call.method_name()).copied() {
            Some(handler) => handler(call).await,
            None => {
                debug!(method = %call.method_name(), "No handler for method");
                call.respond_failure(ErrorCode::NoSuchMethod, "bad method");
            }
        }
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.handlers.keys().collect();
        methods.sort();
        f.debug_struct("MethodTable").field("methods", &methods).finish()
    }
}

type CallQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<InboundCall>>>;

/// Bounded queue of calls for one service, drained by a fixed set of worker tasks.
///
/// A handler that waits keeps its worker busy for the whole wait. A handler that panics
/// is isolated: the call is answered with [`ErrorCode::Fatal`] and the worker moves on.
pub struct ServicePool {
    service_name: String,
    queue_length: usize,
    queue: Mutex<Option<mpsc::Sender<InboundCall>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServicePool {
    pub fn new(queue_length: usize, n_workers: usize, service: Arc<dyn Service>) -> Arc<Self> {
        let queue_length = queue_length.max(1);
        let (tx, rx) = mpsc::channel(queue_length);
        let rx: CallQueue = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..n_workers.max(1))
            .map(|worker| tokio::spawn(run_worker(worker, Arc::clone(&service), Arc::clone(&rx))))
            .collect();

        Arc::new(Self {
            service_name: service.service_name().to_string(),
            queue_length,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().expect("service pool queue lock poisoned").is_none()
    }

    /// Queue `call` for a worker, answering it directly when the pool cannot take it.
    pub fn queue_inbound_call(&self, call: InboundCall) {
        let sender = self
            .queue
            .lock()
            .expect("service pool queue lock poisoned")
            .clone();
        let Some(sender) = sender else {
            call.respond_failure(
                ErrorCode::ServiceUnavailable,
                format!("service '{}' is shutting down", self.service_name),
            );
            return;
        };

        match sender.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                warn!(
                    service = %self.service_name,
                    queue_length = self.queue_length,
                    "Service queue full, rejecting call"
                );
                call.respond_failure(
                    ErrorCode::ServerTooBusy,
                    format!("service queue is full ({} calls)", self.queue_length),
                );
            }
            Err(TrySendError::Closed(call)) => {
                call.respond_failure(
                    ErrorCode::ServiceUnavailable,
                    format!("service '{}' is shutting down", self.service_name),
                );
            }
        }
    }

    /// Stop taking calls. Queued calls are still handled.
    pub fn close(&self) {
        self.queue.lock().expect("service pool queue lock poisoned").take();
    }

    /// Stop taking calls and wait for the workers to drain the queue. Idempotent.
    pub async fn shutdown(&self) {
        self.close();
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .expect("service pool workers lock poisoned"),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(service = %self.service_name, error = %e, "Service worker failed");
            }
        }
        debug!(service = %self.service_name, "Service pool drained");
    }
}

impl fmt::Debug for ServicePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePool")
            .field("service_name", &self.service_name)
            .field("queue_length", &self.queue_length)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_worker(worker: usize, service: Arc<dyn Service>, queue: CallQueue) {
    loop {
        let call = {
            let mut queue = queue.lock().await;
            queue.recv().await
        };
        let Some(call) = call else {
            break;
        };
        handle_call(service.as_ref(), call).await;
    }
    debug!(worker, service = %service.service_name(), "Service worker stopped");
}

async fn handle_call(service: &dyn Service, call: InboundCall) {
    let sink = call.response_sink();
    let method = call.method_name().to_string();

    // Keep the handler future alive until the panic is reported, so that the failure
    // carries the panic message rather than the generic dropped-call error.
    let mut guarded =
        pin!(AssertUnwindSafe(async move { service.handle(call).await }).catch_unwind());
    if let Err(panic) = guarded.as_mut().await {
        let message = panic_message(panic.as_ref());
        error!(
            service = %service.service_name(),
            method = %method,
            panic = %message,
            "Handler panicked"
        );
        sink.fail(status(ErrorCode::Fatal, format!("handler panicked: {message}")));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::FutureExt;

    struct Stuck;

    impl Service for Stuck {
        fn service_name(&self) -> &str {
            "test.Stuck"
        }

        fn handle(&self, call: InboundCall) -> BoxFuture<'_, ()> {
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                call.respond_failure(ErrorCode::Application, "done");
            }
            .boxed()
        }
    }

    fn noop(call: InboundCall) -> BoxFuture<'static, ()> {
        async move { drop(call) }.boxed()
    }

    #[test]
    fn test_duplicate_method_is_rejected() {
        let mut table = MethodTable::new();
        table.register("Add", noop).unwrap();

        assert!(table.has_method("Add"));
        assert!(!table.has_method("Sub"));
        assert!(matches!(
            table.register("Add", noop),
            Err(RpcError::DuplicateMethod(method)) if method == "Add"
        ));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");

        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = ServicePool::new(DEFAULT_QUEUE_LENGTH, 2, Arc::new(Stuck));
        assert!(!pool.is_closed());

        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool.is_closed());
        assert_eq!(pool.service_name(), "test.Stuck");
    }
}
