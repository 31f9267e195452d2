//! Frame layout shared by both ends of a messenger connection.
//!
//! Every frame is a big-endian `u32` length followed by a prost encoded message. The
//! first frame a client writes is a [`ConnectionHeader`]; after that the client only
//! writes [`RequestFrame`]s and the server only writes [`ResponseFrame`]s.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::rpc::error::RpcError;

const LENGTH_PREFIX: usize = 4;

/// Failure classification carried in [`ErrorStatus::code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    Application = 1,
    NoSuchMethod = 2,
    NoSuchService = 3,
    ServerTooBusy = 4,
    InvalidRequest = 5,
    Fatal = 6,
    Network = 7,
    ServiceUnavailable = 8,
    TimedOut = 9,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserCredentialsPb {
    #[prost(string, tag = "1")]
    pub real_user: String,
    #[prost(string, optional, tag = "2")]
    pub effective_user: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionHeader {
    #[prost(message, optional, tag = "1")]
    pub credentials: Option<UserCredentialsPb>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestFrame {
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    #[prost(string, tag = "2")]
    pub service_name: String,
    #[prost(string, tag = "3")]
    pub method_name: String,
    /// Absent when the caller set no timeout.
    #[prost(uint64, optional, tag = "4")]
    pub timeout_millis: Option<u64>,
    #[prost(bytes = "bytes", tag = "5")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorStatus {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(uint32, optional, tag = "3")]
    pub app_error_ext: Option<u32>,
    #[prost(bytes = "bytes", tag = "4")]
    pub app_error_payload: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseFrame {
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    #[prost(message, optional, tag = "2")]
    pub error: Option<ErrorStatus>,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
    #[prost(bytes = "bytes", repeated, tag = "4")]
    pub sidecars: Vec<Bytes>,
}

/// Encode `msg` as a length prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max: usize) -> Result<Bytes, RpcError> {
    let len = msg.encoded_len();
    if len > max {
        return Err(RpcError::MessageTooLarge { size: len, max });
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + len);
    buf.put_u32(len as u32);
    msg.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Read one frame body. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<Bytes>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max {
        return Err(RpcError::MessageTooLarge { size: len, max });
    }
    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;
    Ok(Some(body.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_frames_are_read_back_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let first = RequestFrame {
            call_id: 1,
            service_name: "svc".to_string(),
            method_name: "Add".to_string(),
            timeout_millis: Some(250),
            payload: Bytes::from_static(b"\x08\x01"),
        };
        let second = RequestFrame {
            call_id: 2,
            timeout_millis: None,
            ..first.clone()
        };
        client.write_all(&encode_frame(&first, 1024).unwrap()).await.unwrap();
        client.write_all(&encode_frame(&second, 1024).unwrap()).await.unwrap();
        drop(client);

        let body = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(RequestFrame::decode(body).unwrap(), first);
        let body = read_frame(&mut server, 1024).await.unwrap().unwrap();
        let decoded = RequestFrame::decode(body).unwrap();
        assert_eq!(decoded.call_id, 2);
        assert!(decoded.timeout_millis.is_none());

        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(4096).await.unwrap();

        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, RpcError::MessageTooLarge { size: 4096, max: 1024 }));
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let frame = ResponseFrame {
            call_id: 7,
            error: None,
            payload: Bytes::new(),
            sidecars: vec![Bytes::from(vec![0u8; 256])],
        };
        assert!(matches!(
            encode_frame(&frame, 128),
            Err(RpcError::MessageTooLarge { max: 128, .. })
        ));
    }
}
