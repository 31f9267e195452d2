mod config;
mod messenger_ref;
pub mod registry;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::{DashMap, Entry};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use config::{MessengerConfig, SIDECAR_HEADROOM};
pub use messenger_ref::MessengerRef;

use self::registry::ServiceRegistry;
use crate::rpc::connection::{ConnectionHandle, ConnectionId, OutboundConnection, serve_inbound};
use crate::rpc::context::{InboundCall, ResponseSink, UserCredentials, status};
use crate::rpc::error::RpcError;
use crate::rpc::service::ServicePool;
use crate::rpc::wire::{ErrorCode, RequestFrame};

type OutboundKey = (SocketAddr, UserCredentials);

/// The message bus: services registered by name, an acceptor serving them, and a cache
/// of outbound connections used by proxies.
///
/// A messenger is always handled through an [`Arc`]; services that need to call out keep
/// a [`MessengerRef`] instead so they never own the messenger that serves them.
pub struct Messenger {
    name: String,
    config: MessengerConfig,
    services: ServiceRegistry,
    listener: Mutex<Option<TcpListener>>,
    bound_endpoint: OnceLock<SocketAddr>,
    inbound: DashMap<ConnectionId, ConnectionHandle, ahash::RandomState>,
    outbound: DashMap<OutboundKey, Arc<OutboundConnection>, ahash::RandomState>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl Messenger {
    pub fn new(name: impl Into<String>, config: MessengerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            config,
            services: ServiceRegistry::new(),
            listener: Mutex::new(None),
            bound_endpoint: OnceLock::new(),
            inbound: DashMap::default(),
            outbound: DashMap::default(),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Bind a listening socket and return the concrete address, resolving port 0.
    pub async fn listen_address(&self, endpoint: SocketAddr) -> Result<SocketAddr, RpcError> {
        if self.is_shut_down() {
            return Err(RpcError::MessengerShutdown(self.name.clone()));
        }
        let listener = TcpListener::bind(endpoint).await?;
        let bound = listener.local_addr()?;
        *self.listener.lock().expect("listener lock poisoned") = Some(listener);
        let _ = self.bound_endpoint.set(bound);

        info!(messenger = %self.name, endpoint = %bound, "Listening");
        Ok(bound)
    }

    pub fn bound_endpoint(&self) -> Option<SocketAddr> {
        self.bound_endpoint.get().copied()
    }

    /// Start accepting connections on the address bound by
    /// [`listen_address`](Self::listen_address).
    ///
    /// The acceptor holds only a weak reference and stops on shutdown or when the
    /// messenger is dropped.
    pub fn start_acceptor(self: &Arc<Self>) -> Result<(), RpcError> {
        if self.is_shut_down() {
            return Err(RpcError::MessengerShutdown(self.name.clone()));
        }
        let listener = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take()
            .ok_or_else(|| RpcError::NotListening(self.name.clone()))?;

        let weak_messenger = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let name = self.name.clone();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown_rx.changed() => break,
                };
                let Some(messenger) = weak_messenger.upgrade() else {
                    break;
                };
                match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(async move {
                            if let Err(e) = serve_inbound(messenger, stream, remote).await {
                                debug!(remote = %remote, error = %e, "Inbound connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(messenger = %name, error = %e, "Accept failed"),
                }
            }
            info!(messenger = %name, "Acceptor stopped");
        });

        info!(messenger = %self.name, "Acceptor started");
        Ok(())
    }

    pub fn register_service(
        &self,
        service_name: &str,
        pool: Arc<ServicePool>,
    ) -> Result<(), RpcError> {
        if self.is_shut_down() {
            return Err(RpcError::MessengerShutdown(self.name.clone()));
        }
        self.services.register(service_name, pool)?;
        info!(messenger = %self.name, service = %service_name, "Registered service");
        Ok(())
    }

    /// Remove `service_name`, returning its pool.
    ///
    /// Fails with [`RpcError::Unavailable`] when the service is not registered, including
    /// after the messenger has shut down.
    pub fn unregister_service(&self, service_name: &str) -> Result<Arc<ServicePool>, RpcError> {
        let pool = self.services.unregister(service_name)?;
        info!(messenger = %self.name, service = %service_name, "Unregistered service");
        Ok(pool)
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn inbound_connection_count(&self) -> usize {
        self.inbound.len()
    }

    /// Return an open connection to `remote` for `credentials`, connecting if needed.
    pub(crate) async fn connection_to(
        &self,
        remote: SocketAddr,
        credentials: &UserCredentials,
    ) -> Result<Arc<OutboundConnection>, RpcError> {
        if self.is_shut_down() {
            return Err(RpcError::MessengerShutdown(self.name.clone()));
        }
        let key = (remote, credentials.clone());
        if let Some(connection) = self.outbound.get(&key) {
            if !connection.is_closed() {
                return Ok(Arc::clone(connection.value()));
            }
        }

        let connection = OutboundConnection::connect(remote, credentials, &self.config).await?;
        match self.outbound.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                // Lost a race with another caller; keep the connection already cached.
                connection.close();
                Ok(Arc::clone(entry.get()))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(Arc::clone(&connection));
                Ok(connection)
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&connection));
                Ok(connection)
            }
        }
    }

    /// Forget `connection` if it is still the cached one for `remote` and `credentials`.
    pub(crate) fn evict_connection(
        &self,
        remote: SocketAddr,
        credentials: &UserCredentials,
        connection: &Arc<OutboundConnection>,
    ) {
        connection.close();
        let key = (remote, credentials.clone());
        if self
            .outbound
            .remove_if(&key, |_, cached| {
                Arc::ptr_eq(cached, connection) || cached.is_closed()
            })
            .is_some()
        {
            debug!(messenger = %self.name, remote = %remote, "Evicted closed outbound connection");
        }
    }

    /// Route a decoded request to the pool of the service it names.
    pub(crate) fn dispatch(
        &self,
        request: RequestFrame,
        connection: &ConnectionHandle,
        credentials: &Arc<UserCredentials>,
    ) {
        let sink = ResponseSink::new(
            request.call_id,
            connection.clone(),
            self.config.max_message_size,
        );
        match self.services.get(&request.service_name) {
            Some(pool) => {
                debug!(
                    call_id = request.call_id,
                    service = %request.service_name,
                    method = %request.method_name,
                    "Dispatching call"
                );
                let call = InboundCall::new(
                    request,
                    Arc::clone(credentials),
                    sink,
                    self.config.sidecar_budget(),
                );
                pool.queue_inbound_call(call);
            }
            None => {
                debug!(service = %request.service_name, "Call for unregistered service");
                sink.fail(status(
                    ErrorCode::NoSuchService,
                    format!("service '{}' is not registered", request.service_name),
                ));
            }
        }
    }

    /// Returns false, leaving the connection untracked, once shutdown has begun.
    pub(crate) fn track_inbound(&self, connection: ConnectionHandle) -> bool {
        if self.is_shut_down() {
            return false;
        }
        self.inbound.insert(connection.id().clone(), connection);
        true
    }

    pub(crate) fn untrack_inbound(&self, id: &ConnectionId) {
        self.inbound.remove(id);
    }

    /// Stop accepting, close every connection and forget all services. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(messenger = %self.name, "Shutting down messenger");

        self.shutdown_tx.send_replace(true);
        self.listener.lock().expect("listener lock poisoned").take();

        for entry in self.inbound.iter() {
            entry.value().close();
        }
        self.inbound.clear();

        for entry in self.outbound.iter() {
            entry.value().close();
        }
        self.outbound.clear();

        self.services.clear();
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger")
            .field("name", &self.name)
            .field("bound_endpoint", &self.bound_endpoint())
            .field("services", &self.services.len())
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
