use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use prost::Message;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rpc::context::UserCredentials;
use crate::rpc::error::RpcError;
use crate::rpc::messenger::{Messenger, MessengerConfig};
use crate::rpc::wire::{ConnectionHeader, RequestFrame, ResponseFrame, encode_frame, read_frame};

#[derive(Clone, Hash, PartialEq, Eq)]
pub struct ConnectionId(Arc<Uuid>);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Arc::new(Uuid::new_v4()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work for a connection's writer task, processed strictly in order.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Bytes),
    Close,
}

/// Cloneable handle to one side of a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub(crate) fn new(remote: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::generate(),
            remote,
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Address of the peer at the other end.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn send_frame(&self, frame: Bytes) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Close the connection once every frame queued before this call has been written.
    pub fn close(&self) {
        if self.tx.send(Outbound::Close).is_ok() {
            debug!(connection = %self.id, remote = %self.remote, "Connection close requested");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drain `rx` into `writer` until asked to close, then shut the write side down and
/// wake the reader through `writer_done`.
pub(crate) async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    writer_done: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(error = %e, "Write failed, closing connection");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    writer_done.notify_one();
}

/// Serve calls arriving on an accepted connection until either side closes it.
pub(crate) async fn serve_inbound(
    messenger: Arc<Messenger>,
    stream: TcpStream,
    remote: SocketAddr,
) -> Result<(), RpcError> {
    stream.set_nodelay(true)?;
    let max_message_size = messenger.config().max_message_size;
    let (mut reader, writer) = stream.into_split();

    let Some(header) = read_frame(&mut reader, max_message_size).await? else {
        return Ok(());
    };
    let header = ConnectionHeader::decode(header)?;
    let credentials = Arc::new(
        header
            .credentials
            .map(UserCredentials::from)
            .unwrap_or_else(|| UserCredentials::new("")),
    );

    let (handle, rx) = ConnectionHandle::new(remote);
    let writer_done = Arc::new(Notify::new());
    tokio::spawn(write_loop(writer, rx, Arc::clone(&writer_done)));

    if !messenger.track_inbound(handle.clone()) {
        handle.close();
        return Ok(());
    }
    info!(
        connection = %handle.id(),
        remote = %remote,
        real_user = %credentials.real_user(),
        "Accepted connection"
    );

    let result = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_message_size) => frame,
            _ = writer_done.notified() => break Ok(()),
        };
        match frame {
            Ok(Some(body)) => match RequestFrame::decode(body) {
                Ok(request) => messenger.dispatch(request, &handle, &credentials),
                Err(e) => break Err(RpcError::from(e)),
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if result.is_err() {
        handle.close();
    }
    messenger.untrack_inbound(handle.id());
    debug!(connection = %handle.id(), remote = %remote, "Inbound connection finished");
    result
}

type PendingCall = oneshot::Sender<Result<ResponseFrame, RpcError>>;

/// A client connection with its calls awaiting responses.
pub(crate) struct OutboundConnection {
    handle: ConnectionHandle,
    pending: DashMap<u64, PendingCall, ahash::RandomState>,
    next_call_id: AtomicU64,
    closed: AtomicBool,
    max_message_size: usize,
}

impl OutboundConnection {
    pub(crate) async fn connect(
        remote: SocketAddr,
        credentials: &UserCredentials,
        config: &MessengerConfig,
    ) -> Result<Arc<Self>, RpcError> {
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(remote))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RpcError::Network(format!(
                    "failed to connect to {remote}: {e}"
                )));
            }
            Err(_) => return Err(RpcError::Network(format!("timed out connecting to {remote}"))),
        };
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let (handle, rx) = ConnectionHandle::new(remote);
        let header = ConnectionHeader {
            credentials: Some(credentials.into()),
        };
        handle.send_frame(encode_frame(&header, config.max_message_size)?);

        let writer_done = Arc::new(Notify::new());
        tokio::spawn(write_loop(writer, rx, Arc::clone(&writer_done)));

        let connection = Arc::new(Self {
            handle,
            pending: DashMap::default(),
            next_call_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            max_message_size: config.max_message_size,
        });
        tokio::spawn(Arc::clone(&connection).read_responses(reader, writer_done));

        debug!(
            connection = %connection.handle.id(),
            remote = %remote,
            "Opened outbound connection"
        );
        Ok(connection)
    }

    /// Send `request` and wait for its response, at most `timeout` if one is given.
    pub(crate) async fn call(
        &self,
        mut request: RequestFrame,
        timeout: Option<Duration>,
    ) -> Result<ResponseFrame, RpcError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        request.call_id = call_id;
        let frame = encode_frame(&request, self.max_message_size)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);
        if self.is_closed() || !self.handle.send_frame(frame) {
            self.pending.remove(&call_id);
            return Err(RpcError::ConnectionClosed);
        }

        let response = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.pending.remove(&call_id);
                    return Err(RpcError::TimedOut(timeout));
                }
            },
            None => rx.await,
        };
        response.map_err(|_| RpcError::ConnectionClosed)?
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.handle.close();
    }

    async fn read_responses(self: Arc<Self>, mut reader: OwnedReadHalf, writer_done: Arc<Notify>) {
        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader, self.max_message_size) => frame,
                _ = writer_done.notified() => break,
            };
            match frame {
                Ok(Some(body)) => match ResponseFrame::decode(body) {
                    Ok(response) => self.complete(response),
                    Err(e) => {
                        warn!(error = %e, "Undecodable response, closing connection");
                        break;
                    }
                },
                Ok(None) => {
                    debug!(remote = %self.handle.remote(), "Connection closed by remote");
                    break;
                }
                Err(e) => {
                    warn!(remote = %self.handle.remote(), error = %e, "Connection read failed");
                    break;
                }
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        self.handle.close();
        self.fail_pending();
    }

    fn complete(&self, response: ResponseFrame) {
        match self.pending.remove(&response.call_id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(response));
            }
            None => debug!(
                call_id = response.call_id,
                "Dropping response for a call that is no longer pending"
            ),
        }
    }

    fn fail_pending(&self) {
        let call_ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for call_id in call_ids {
            if let Some((_, tx)) = self.pending.remove(&call_id) {
                let _ = tx.send(Err(RpcError::ConnectionClosed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_ordered_after_queued_frames() {
        let (handle, rx) = ConnectionHandle::new("127.0.0.1:1".parse().unwrap());
        let (writer, mut reader) = tokio::io::duplex(1024);
        let writer_done = Arc::new(Notify::new());

        assert!(handle.send_frame(Bytes::from_static(b"one")));
        handle.close();
        assert!(handle.send_frame(Bytes::from_static(b"two")));

        write_loop(writer, rx, Arc::clone(&writer_done)).await;
        writer_done.notified().await;

        let mut written = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut written)
            .await
            .unwrap();
        assert_eq!(written, b"one");
        assert!(handle.is_closed());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }
}
