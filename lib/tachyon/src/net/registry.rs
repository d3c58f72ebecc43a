use crate::net::connection::{Connection, ConnectionConfig};
use crate::net::transport::SocketConnector;
use indexmap::IndexMap;
use lumen::config::{ClientConfig, Profile};
use lumen::logging;
use std::cell::RefCell;
use std::rc::Rc;

/// Reserved identifier every lookup collapses onto on the handheld profile,
/// where one process-wide connection serves all traffic.
pub const SHARED_CONNECTION_IDENTIFIER: &str = "shared";

pub type ConnectionHandle = Rc<RefCell<Connection>>;

/// Identifier to connection map. Connections are created lazily from the
/// ambient configuration on first lookup; callers holding a handle keep a
/// connection alive and functional even after it leaves the registry.
pub struct ConnectionRegistry {
    profile: Profile,
    config: ClientConfig,
    connections: IndexMap<String, ConnectionHandle>,
    log: logging::Logger,
}

impl ConnectionRegistry {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        profile: Profile,
        config: ClientConfig,
        log: L,
    ) -> ConnectionRegistry {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        ConnectionRegistry {
            profile,
            config,
            connections: IndexMap::new(),
            log,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[inline]
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Returns the connection registered under `identifier`, constructing it
    /// from the ambient configuration when missing. On the handheld profile
    /// every identifier aliases the single shared connection.
    pub fn get(&mut self, identifier: &str) -> ConnectionHandle {
        if let Some(existing) = self.connections.get(identifier) {
            return existing.clone();
        }

        let connection = match self.profile {
            Profile::Handheld => {
                let shared = match self.connections.get(SHARED_CONNECTION_IDENTIFIER) {
                    Some(shared) => shared.clone(),
                    None => {
                        let fresh = self.construct(SHARED_CONNECTION_IDENTIFIER);

                        self.connections
                            .insert(SHARED_CONNECTION_IDENTIFIER.to_string(), fresh.clone());

                        fresh
                    }
                };

                if identifier != SHARED_CONNECTION_IDENTIFIER {
                    self.connections
                        .insert(identifier.to_string(), shared.clone());
                }

                shared
            }
            Profile::Desktop => {
                let fresh = self.construct(identifier);

                self.connections
                    .insert(identifier.to_string(), fresh.clone());

                fresh
            }
        };

        logging::debug!(self.log, "connection registered";
                        "context" => "get",
                        "identifier" => %identifier,
                        "registered" => self.connections.len());

        connection
    }

    fn construct(&self, identifier: &str) -> ConnectionHandle {
        let connection = Connection::new(
            identifier,
            ConnectionConfig::from(&self.config),
            self.profile,
            Box::new(SocketConnector::new()),
            &self.log,
        );

        Rc::new(RefCell::new(connection))
    }

    /// Removes every identifier mapped to this connection. Streams are not
    /// closed here; the connection tears itself down when the last handle
    /// drops.
    pub fn destroy(&mut self, connection: &ConnectionHandle) {
        self.connections
            .retain(|_, registered| !Rc::ptr_eq(registered, connection));

        logging::debug!(self.log, "connection destroyed";
                        "context" => "destroy",
                        "registered" => self.connections.len());
    }

    /// Snapshots the registered connections, clears the registry, then
    /// closes each snapshot element. The clear-first order keeps callbacks
    /// from observing half-emptied state.
    pub fn close_all(&mut self) {
        let snapshot: Vec<ConnectionHandle> = self.connections.values().cloned().collect();

        self.connections.clear();

        for connection in snapshot {
            connection.borrow_mut().close_connection();
        }
    }
}

thread_local! {
    static REGISTRY: RefCell<Option<ConnectionRegistry>> = RefCell::new(None);
}

/// One-shot initializer for the process-wide registry owned by the current
/// loop. Later calls are ignored; `get` falls back to a default-configured
/// registry when the host application never initializes one.
pub fn init<'a, L: Into<Option<&'a logging::Logger>>>(
    profile: Profile,
    config: ClientConfig,
    log: L,
) {
    let log = log.into();

    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();

        if registry.is_none() {
            *registry = Some(ConnectionRegistry::new(profile, config, log));
        }
    });
}

/// Looks up `identifier` in the process-wide registry.
pub fn get(identifier: &str) -> ConnectionHandle {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();

        registry
            .get_or_insert_with(|| {
                let config = ClientConfig::default();

                ConnectionRegistry::new(config.profile, config, None)
            })
            .get(identifier)
    })
}

/// Removes the connection's identifiers from the process-wide registry.
pub fn destroy(connection: &ConnectionHandle) {
    REGISTRY.with(|registry| {
        if let Some(registry) = registry.borrow_mut().as_mut() {
            registry.destroy(connection);
        }
    });
}

/// Closes every connection registered process-wide.
pub fn close_all() {
    REGISTRY.with(|registry| {
        if let Some(registry) = registry.borrow_mut().as_mut() {
            registry.close_all();
        }
    });
}

/// Tears the process-wide registry down, closing every registered
/// connection.
pub fn teardown() {
    REGISTRY.with(|registry| {
        if let Some(mut registry) = registry.borrow_mut().take() {
            registry.close_all();
        }
    });
}
