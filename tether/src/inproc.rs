//! In-process endpoint registry.
//!
//! Maps `inproc://name` endpoints to the socket bound to them. The registry
//! belongs to one [`Context`](crate::ctx::Context); sockets of different
//! contexts never see each other's endpoints.
//!
//! # Example
//!
//! ```rust
//! use tether::prelude::*;
//!
//! # fn main() -> tether::Result<()> {
//! let ctx = Context::new(ContextConfig::default())?;
//! let mut server = ctx.socket(Options::default())?;
//! server.bind("inproc://workers")?;
//!
//! let mut client = ctx.socket(Options::default())?;
//! client.connect("inproc://workers")?;
//! # Ok(())
//! # }
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use tether_core::command::OwnRef;
use tether_core::error::{Result, TetherError};
use tether_core::options::Options;

const PREFIX: &str = "inproc://";

/// What a connecting socket needs to know about the bound one.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub(crate) socket: OwnRef,
    pub(crate) send_hwm: u32,
    pub(crate) recv_hwm: u32,
    pub(crate) conflate: bool,
}

impl Endpoint {
    pub(crate) fn new(socket: OwnRef, options: &Options) -> Self {
        Self {
            socket,
            send_hwm: options.send_hwm,
            recv_hwm: options.recv_hwm,
            conflate: options.conflate,
        }
    }
}

/// Bound inproc endpoints of one context.
#[derive(Debug, Default)]
pub(crate) struct InprocRegistry {
    endpoints: DashMap<String, Endpoint>,
}

impl InprocRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` for the socket described by `entry`.
    ///
    /// Returns the endpoint name without its prefix.
    pub(crate) fn register(&self, endpoint: &str, entry: Endpoint) -> Result<String> {
        let name = validate_and_extract_name(endpoint)?;
        match self.endpoints.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(TetherError::AddressInUse(endpoint.to_owned())),
            Entry::Vacant(slot) => {
                debug!("[INPROC] {} bound to {}", endpoint, entry.socket.object());
                slot.insert(entry);
                Ok(name.to_owned())
            }
        }
    }

    /// Look up a bound endpoint.
    ///
    /// The bound socket's sequence number is bumped while the registry entry
    /// is still locked: the socket cannot finish terminating before the
    /// caller's `Bind` reaches it.
    pub(crate) fn find(&self, endpoint: &str) -> Result<Endpoint> {
        let name = validate_and_extract_name(endpoint)?;
        let entry = self
            .endpoints
            .get(name)
            .ok_or_else(|| TetherError::EndpointNotFound(endpoint.to_owned()))?;
        entry.socket.inc_seqnum();
        Ok(entry.clone())
    }

    /// Remove `name` if it is still bound by `socket`.
    pub(crate) fn unregister(&self, name: &str, socket: &OwnRef) -> bool {
        self.endpoints
            .remove_if(name, |_, entry| entry.socket == *socket)
            .is_some()
    }

    /// Names of all bound endpoints, without the prefix.
    pub(crate) fn names(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Validate endpoint format and extract the name.
pub(crate) fn validate_and_extract_name(endpoint: &str) -> Result<&str> {
    let name = endpoint
        .strip_prefix(PREFIX)
        .ok_or_else(|| TetherError::invalid_endpoint(endpoint))?;
    if name.is_empty() {
        return Err(TetherError::invalid_endpoint(endpoint));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tether_core::config::Granularity;
    use tether_core::object::CommandBus;
    use tether_core::own::OwnNode;

    fn socket_ref(bus: &Arc<CommandBus>) -> OwnRef {
        OwnNode::new(Arc::clone(bus), 0, Options::default()).own_ref()
    }

    fn bus() -> Arc<CommandBus> {
        Arc::new(CommandBus::new(1, 0..0, Granularity::default()))
    }

    #[test]
    fn test_validate_endpoint() {
        assert_eq!(validate_and_extract_name("inproc://test").unwrap(), "test");
        assert!(validate_and_extract_name("tcp://test").is_err());
        assert!(validate_and_extract_name("inproc://").is_err());
        assert!(validate_and_extract_name("").is_err());
    }

    #[test]
    fn test_bind_duplicate() {
        let bus = bus();
        let registry = InprocRegistry::new();
        let socket = socket_ref(&bus);
        let options = Options::default();

        assert!(registry
            .register("inproc://dup", Endpoint::new(socket.clone(), &options))
            .is_ok());
        let err = registry
            .register("inproc://dup", Endpoint::new(socket, &options))
            .unwrap_err();
        assert!(matches!(err, TetherError::AddressInUse(_)));
    }

    #[test]
    fn test_find_bumps_bound_socket_seqnum() {
        let bus = bus();
        let registry = InprocRegistry::new();
        let node = OwnNode::new(Arc::clone(&bus), 0, Options::default().with_recv_hwm(7));
        registry
            .register("inproc://seq", Endpoint::new(node.own_ref(), node.options()))
            .unwrap();

        let found = registry.find("inproc://seq").unwrap();
        assert_eq!(found.recv_hwm, 7);
        assert_eq!(node.pending_seqnums(), 1);

        assert!(matches!(
            registry.find("inproc://missing"),
            Err(TetherError::EndpointNotFound(_))
        ));
    }

    #[test]
    fn test_unregister_only_by_owner() {
        let bus = bus();
        let registry = InprocRegistry::new();
        let owner = socket_ref(&bus);
        let stranger = socket_ref(&bus);
        let name = registry
            .register("inproc://mine", Endpoint::new(owner.clone(), &Options::default()))
            .unwrap();

        assert!(!registry.unregister(&name, &stranger));
        assert_eq!(registry.names(), vec!["mine".to_string()]);
        assert!(registry.unregister(&name, &owner));
        assert!(registry.names().is_empty());
    }
}
