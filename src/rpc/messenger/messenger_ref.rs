use std::fmt;
use std::sync::{Arc, Weak};

use crate::rpc::error::RpcError;
use crate::rpc::messenger::Messenger;

/// A non-owning reference to a [`Messenger`].
///
/// Services that issue their own calls hold one of these so that they never extend the
/// lifetime of the messenger that serves them.
#[derive(Clone)]
pub struct MessengerRef {
    name: String,
    weak_messenger: Weak<Messenger>,
}

impl MessengerRef {
    pub fn new(messenger: &Arc<Messenger>) -> Self {
        Self {
            name: messenger.name().to_string(),
            weak_messenger: Arc::downgrade(messenger),
        }
    }

    /// Upgrade to the messenger for the duration of one operation.
    ///
    /// Returns [`RpcError::MessengerShutdown`] once the messenger is dropped or shut down.
    pub fn get(&self) -> Result<Arc<Messenger>, RpcError> {
        Weak::upgrade(&self.weak_messenger)
            .filter(|messenger| !messenger.is_shut_down())
            .ok_or_else(|| RpcError::MessengerShutdown(self.name.clone()))
    }
}

impl fmt::Debug for MessengerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessengerRef")
            .field("name", &self.name)
            .field("alive", &(self.weak_messenger.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::messenger::MessengerConfig;

    #[test]
    fn test_reference_fails_after_drop() {
        let messenger = Messenger::new("ref-test", MessengerConfig::builder().build());
        let messenger_ref = MessengerRef::new(&messenger);
        assert!(messenger_ref.get().is_ok());

        drop(messenger);
        assert!(matches!(
            messenger_ref.get(),
            Err(RpcError::MessengerShutdown(name)) if name == "ref-test"
        ));
    }

    #[test]
    fn test_reference_fails_after_shutdown() {
        let messenger = Messenger::new("ref-test", MessengerConfig::builder().build());
        let messenger_ref = MessengerRef::new(&messenger);

        messenger.shutdown();
        assert!(messenger_ref.get().is_err());
    }
}
