use crate::net::registry::ConnectionHandle;
use crate::net::support::NetResult;
use hashbrown::HashMap;
use lumen::logging;
use mio::{Events, Poll, Token};
use std::io;
use std::time::Duration;

/// Event loop adapter owning the connections registered on it. Socket
/// readiness is translated into per-half stream events; everything stays on
/// the loop thread, so control returns here between partial writes and
/// between read chunks.
pub struct Driver {
    poll: Poll,
    events: Events,
    connections: HashMap<Token, ConnectionHandle>,
    next_token: usize,
    log: logging::Logger,
}

impl Driver {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> io::Result<Driver> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Ok(Driver {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            connections: HashMap::new(),
            next_token: 0,
            log,
        })
    }

    /// Registers an opened connection's transport for readiness events.
    pub fn register(&mut self, connection: &ConnectionHandle) -> NetResult<()> {
        let token = Token(self.next_token);

        connection
            .borrow_mut()
            .register_transport(self.poll.registry(), token)?;

        self.next_token += 1;
        self.connections.insert(token, connection.clone());

        logging::debug!(self.log, "connection registered on poll";
                        "context" => "register",
                        "token" => token.0);

        Ok(())
    }

    /// Deregisters a connection's transport and forgets it.
    pub fn deregister(&mut self, connection: &ConnectionHandle) -> NetResult<()> {
        connection
            .borrow_mut()
            .deregister_transport(self.poll.registry())?;

        self.connections
            .retain(|_, registered| !ConnectionHandle::ptr_eq(registered, connection));

        Ok(())
    }

    /// Polls once and dispatches readiness to the owning connections.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;

        for event in self.events.iter() {
            let connection = match self.connections.get(&event.token()) {
                Some(connection) => connection.clone(),
                None => continue,
            };

            connection.borrow_mut().dispatch_readiness(
                event.is_readable(),
                event.is_writable(),
                event.is_read_closed(),
                event.is_error(),
            );
        }

        Ok(())
    }
}
