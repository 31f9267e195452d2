use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use prost::Message;
use tracing::debug;

use crate::rpc::context::UserCredentials;
use crate::rpc::error::RpcError;
use crate::rpc::messenger::Messenger;
use crate::rpc::wire::{RequestFrame, ResponseFrame};

/// Per-call options and results: the timeout going in, the sidecars coming out.
#[derive(Debug, Clone, Default)]
pub struct RpcController {
    timeout: Option<Duration>,
    sidecars: Vec<Bytes>,
}

impl RpcController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            sidecars: Vec::new(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sidecar `index` of the last response received through this controller.
    pub fn sidecar(&self, index: usize) -> Result<&Bytes, RpcError> {
        self.sidecars.get(index).ok_or(RpcError::SidecarNotFound {
            index,
            count: self.sidecars.len(),
        })
    }

    pub fn sidecar_count(&self) -> usize {
        self.sidecars.len()
    }

    /// Forget the sidecars and timeout so the controller can be reused.
    pub fn reset(&mut self) {
        self.timeout = None;
        self.sidecars.clear();
    }
}

/// Client for one service at one remote address.
#[derive(Debug, Clone)]
pub struct Proxy {
    messenger: Arc<Messenger>,
    remote: SocketAddr,
    service_name: String,
    credentials: UserCredentials,
}

impl Proxy {
    /// Proxy presenting the credentials configured on `messenger`.
    pub fn new(
        messenger: Arc<Messenger>,
        remote: SocketAddr,
        service_name: impl Into<String>,
    ) -> Self {
        let credentials = messenger.config().credentials.clone();
        Self {
            messenger,
            remote,
            service_name: service_name.into(),
            credentials,
        }
    }

    pub fn with_credentials(mut self, credentials: UserCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    /// Call `method` and wait for its typed response.
    pub async fn sync_request<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        controller: &mut RpcController,
    ) -> Result<Resp, RpcError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let payload = self
            .call_raw(method, Bytes::from(request.encode_to_vec()), controller)
            .await?;
        Ok(Resp::decode(payload)?)
    }

    /// Call `method` with an already encoded request, returning the encoded response.
    ///
    /// The controller's timeout covers connecting as well as the call itself. A call that
    /// finds its cached connection closed by the remote is sent once more on a new one.
    pub async fn call_raw(
        &self,
        method: &str,
        payload: Bytes,
        controller: &mut RpcController,
    ) -> Result<Bytes, RpcError> {
        controller.sidecars.clear();
        let timeout = controller.timeout;
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        let response = match self.call_once(method, payload.clone(), deadline).await {
            Err(RpcError::ConnectionClosed) => {
                debug!(
                    remote = %self.remote,
                    method = %method,
                    "Connection closed, retrying call"
                );
                self.call_once(method, payload, deadline).await
            }
            other => other,
        }
        .map_err(|e| match e {
            RpcError::TimedOut(_) => RpcError::TimedOut(timeout.unwrap_or_default()),
            other => other,
        })?;

        if let Some(status) = response.error {
            return Err(RpcError::from_status(status));
        }
        controller.sidecars = response.sidecars;
        Ok(response.payload)
    }

    async fn call_once(
        &self,
        method: &str,
        payload: Bytes,
        deadline: Option<Instant>,
    ) -> Result<ResponseFrame, RpcError> {
        let time_left =
            || deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

        let connecting = self.messenger.connection_to(self.remote, &self.credentials);
        let connection = match time_left() {
            Some(remaining) => tokio::time::timeout(remaining, connecting)
                .await
                .map_err(|_| RpcError::TimedOut(remaining))??,
            None => connecting.await?,
        };

        let remaining = time_left();
        let request = RequestFrame {
            call_id: 0,
            service_name: self.service_name.clone(),
            method_name: method.to_string(),
            timeout_millis: remaining
                .map(|remaining| u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX)),
            payload,
        };

        debug!(
            remote = %self.remote,
            service = %self.service_name,
            method = %method,
            timeout = ?remaining,
            "Sending call"
        );
        let result = connection.call(request, remaining).await;
        if matches!(result, Err(RpcError::ConnectionClosed)) {
            self.messenger.evict_connection(self.remote, &self.credentials, &connection);
        }
        result
    }
}
