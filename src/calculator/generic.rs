use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use prost::Message;
use tracing::{debug, info};

use super::proto::{AddRequest, AddResponse, SendStringsRequest, SleepRequest, SleepResponse};
use super::{
    ADD_METHOD, GENERIC_SERVICE_NAME, SEND_STRINGS_METHOD, SLEEP_METHOD,
    attach_generated_sidecars,
};
use crate::rpc::{ErrorCode, InboundCall, MethodTable, RpcError, Service};

/// Calculator answering raw calls through a method table, without typed contexts.
///
/// `Add` and `SendStrings` treat an unparsable payload as a broken invariant and panic;
/// the service pool turns that into a `Fatal` response. `Sleep` answers `InvalidRequest`.
#[derive(Debug)]
pub struct GenericCalculatorService {
    methods: MethodTable,
}

impl GenericCalculatorService {
    pub fn new() -> Result<Self, RpcError> {
        let mut methods = MethodTable::new();
        methods.register(ADD_METHOD, add)?;
        methods.register(SLEEP_METHOD, sleep)?;
        methods.register(SEND_STRINGS_METHOD, send_strings)?;
        Ok(Self { methods })
    }
}

impl Service for GenericCalculatorService {
    fn service_name(&self) -> &str {
        GENERIC_SERVICE_NAME
    }

    fn handle(&self, call: InboundCall) -> BoxFuture<'_, ()> {
        self.methods.dispatch(call).boxed()
    }
}

fn decode_or_panic<M: Message + Default>(call: &InboundCall) -> M {
    let payload = call.serialized_request();
    match M::decode(payload.clone()) {
        Ok(request) => request,
        Err(e) => panic!("couldn't parse: {payload:?}: {e}"),
    }
}

fn add(call: InboundCall) -> BoxFuture<'static, ()> {
    async move {
        let request: AddRequest = decode_or_panic(&call);
        call.respond_success(&AddResponse {
            result: request.x.wrapping_add(request.y),
        });
    }
    .boxed()
}

fn sleep(call: InboundCall) -> BoxFuture<'static, ()> {
    async move {
        let request = match SleepRequest::decode(call.serialized_request().clone()) {
            Ok(request) => request,
            Err(e) => {
                call.respond_failure(ErrorCode::InvalidRequest, format!("Couldn't parse pb: {e}"));
                return;
            }
        };

        info!(sleep_micros = request.sleep_micros, "Got sleep call");
        tokio::time::sleep(Duration::from_micros(u64::from(request.sleep_micros))).await;
        call.respond_success(&SleepResponse {});
    }
    .boxed()
}

fn send_strings(mut call: InboundCall) -> BoxFuture<'static, ()> {
    async move {
        let request: SendStringsRequest = decode_or_panic(&call);
        match attach_generated_sidecars(&mut call, &request) {
            Ok(response) => call.respond_success(&response),
            Err(e) => {
                debug!(error = %e, "Couldn't attach sidecars");
                call.respond_failure(ErrorCode::Application, e.to_string());
            }
        }
    }
    .boxed()
}
