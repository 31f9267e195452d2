//! Request and response messages of the calculator services.

use bytes::Bytes;

use crate::rpc::UserCredentialsPb;

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddRequest {
    #[prost(uint32, tag = "1")]
    pub x: u32,
    #[prost(uint32, tag = "2")]
    pub y: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddResponse {
    #[prost(uint32, tag = "1")]
    pub result: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SleepRequest {
    #[prost(uint32, tag = "1")]
    pub sleep_micros: u32,
    /// Respond from a detached task instead of the worker.
    #[prost(bool, tag = "2")]
    pub deferred: bool,
    #[prost(bool, tag = "3")]
    pub return_app_error: bool,
    /// Fail with an application error unless the call carries a deadline.
    #[prost(bool, tag = "4")]
    pub client_timeout_defined: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SleepResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SendStringsRequest {
    #[prost(uint32, tag = "1")]
    pub random_seed: u32,
    #[prost(uint64, repeated, tag = "2")]
    pub sizes: Vec<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SendStringsResponse {
    /// Sidecar index of each generated payload, in request order.
    #[prost(uint32, repeated, tag = "1")]
    pub sidecars: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub data: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub data: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WhoAmIRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WhoAmIResponse {
    #[prost(message, optional, tag = "1")]
    pub credentials: Option<UserCredentialsPb>,
    #[prost(string, tag = "2")]
    pub address: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PanicRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PanicResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {
    /// Microseconds since the UNIX epoch when the server handled the ping.
    #[prost(uint64, tag = "1")]
    pub time: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DisconnectRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DisconnectResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ForwardRequest {
    #[prost(string, optional, tag = "1")]
    pub host: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub port: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ForwardResponse {
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Application error payload, identified by [`CALCULATOR_ERROR_EXT`](super::CALCULATOR_ERROR_EXT).
#[derive(Clone, PartialEq, prost::Message)]
pub struct CalculatorError {
    #[prost(string, tag = "1")]
    pub extra_error_data: String,
}

impl CalculatorError {
    pub fn new(extra_error_data: impl Into<String>) -> Self {
        Self {
            extra_error_data: extra_error_data.into(),
        }
    }

    /// Decode the payload of an application error.
    pub fn from_payload(payload: &Bytes) -> Result<Self, prost::DecodeError> {
        <Self as prost::Message>::decode(payload.clone())
    }
}
