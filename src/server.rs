use std::net::SocketAddr;
use std::sync::Arc;

use bon::Builder;
use tracing::{info, warn};

use crate::rpc::{
    DEFAULT_QUEUE_LENGTH, Messenger, MessengerConfig, RpcError, Service, ServicePool,
};

/// Options for [`TestServer::start`].
#[derive(Debug, Clone, Builder)]
pub struct TestServerOptions {
    /// Address to listen on. Port 0 picks an ephemeral port.
    #[builder(default = SocketAddr::from(([127, 0, 0, 1], 0)))]
    pub endpoint: SocketAddr,

    /// Workers draining the service queue.
    #[builder(default = 3)]
    pub n_worker_threads: usize,

    #[builder(default = DEFAULT_QUEUE_LENGTH)]
    pub queue_length: usize,

    #[builder(default)]
    pub messenger: MessengerConfig,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One service served by its own messenger on a listening endpoint.
#[derive(Debug)]
pub struct TestServer {
    service_name: String,
    messenger: Arc<Messenger>,
    pool: Arc<ServicePool>,
    bound_endpoint: SocketAddr,
    shut_down: bool,
}

impl TestServer {
    pub async fn start(
        service: Arc<dyn Service>,
        options: TestServerOptions,
    ) -> Result<Self, RpcError> {
        let service_name = service.service_name().to_string();
        let messenger = Messenger::new("TestServer", options.messenger);
        service.bind_messenger(&messenger);

        let pool = ServicePool::new(options.queue_length, options.n_worker_threads, service);
        let started = async {
            let bound_endpoint = messenger.listen_address(options.endpoint).await?;
            messenger.register_service(&service_name, Arc::clone(&pool))?;
            messenger.start_acceptor()?;
            Ok::<_, RpcError>(bound_endpoint)
        }
        .await;

        let bound_endpoint = match started {
            Ok(bound_endpoint) => bound_endpoint,
            Err(e) => {
                pool.close();
                messenger.shutdown();
                return Err(e);
            }
        };

        info!(service = %service_name, endpoint = %bound_endpoint, "Test server started");
        Ok(Self {
            service_name,
            messenger,
            pool,
            bound_endpoint,
            shut_down: false,
        })
    }

    pub fn bound_endpoint(&self) -> SocketAddr {
        self.bound_endpoint
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Unregister the service, drain its workers and stop the messenger. Idempotent.
    pub async fn shutdown(&mut self) -> Result<(), RpcError> {
        if self.shut_down {
            return Ok(());
        }

        // Every step runs even when unregistering fails; the failure is reported last.
        let unregistered = self.unregister();
        self.pool.shutdown().await;
        self.messenger.shutdown();
        self.shut_down = true;
        info!(service = %self.service_name, "Test server shut down");
        unregistered
    }

    fn unregister(&self) -> Result<(), RpcError> {
        match self.messenger.unregister_service(&self.service_name) {
            Ok(_) | Err(RpcError::Unavailable(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        if let Err(e) = self.unregister() {
            warn!(service = %self.service_name, error = %e, "Failed to unregister service");
        }
        self.pool.close();
        self.messenger.shutdown();
    }
}
