//! Calculator services used to exercise the messenger.
//!
//! [`GenericCalculatorService`] dispatches raw calls by method name; [`CalculatorService`]
//! decodes typed requests and adds the adversarial handlers (deferred completion, panics,
//! disconnects, forwarding). Both fabricate sidecars the same way.

pub mod generic;
pub mod proto;
pub mod proxy;
pub mod typed;

pub use generic::GenericCalculatorService;
pub use proxy::CalculatorServiceProxy;
pub use typed::CalculatorService;

use crate::payload::PayloadGenerator;
use crate::rpc::{InboundCall, RpcError};

use self::proto::{SendStringsRequest, SendStringsResponse};

pub const GENERIC_SERVICE_NAME: &str = "rpc.GenericCalculatorService";
pub const CALCULATOR_SERVICE_NAME: &str = "rpc_test.CalculatorService";

pub const ADD_METHOD: &str = "Add";
pub const SLEEP_METHOD: &str = "Sleep";
pub const SEND_STRINGS_METHOD: &str = "SendStrings";
pub const ECHO_METHOD: &str = "Echo";
pub const WHO_AM_I_METHOD: &str = "WhoAmI";
pub const PANIC_METHOD: &str = "Panic";
pub const PING_METHOD: &str = "Ping";
pub const DISCONNECT_METHOD: &str = "Disconnect";
pub const FORWARD_METHOD: &str = "Forward";

/// Extension number of [`proto::CalculatorError`] application errors.
pub const CALCULATOR_ERROR_EXT: u32 = 101;

/// Attach one generated payload per requested size, in order, from a single generator
/// seeded with the request's seed.
///
/// Sizes are checked against the remaining budget before any bytes are generated.
pub(crate) fn attach_generated_sidecars(
    call: &mut InboundCall,
    request: &SendStringsRequest,
) -> Result<SendStringsResponse, RpcError> {
    let mut generator = PayloadGenerator::new(u64::from(request.random_seed));
    let mut response = SendStringsResponse::default();

    for &size in &request.sizes {
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size <= call.remaining_sidecar_budget())
            .ok_or(RpcError::SidecarBudget {
                budget: call.sidecar_budget(),
            })?;
        let index = call.add_sidecar(generator.next_payload(size))?;
        response.sidecars.push(index as u32);
    }
    Ok(response)
}
