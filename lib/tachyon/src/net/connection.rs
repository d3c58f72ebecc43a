use crate::net::buffer::{Accumulator, WriteBuffer};
use crate::net::bus::{self, BusEvent};
use crate::net::contract::{ConnectionDataSource, DataSourceHandle, DelegateHandle, DelegateSet};
use crate::net::policy::{SecurityLevel, SecurityOptions, SecurityPolicy};
use crate::net::response::{self, ResponseSummary};
use crate::net::support::{Domain, Fault, NetError, NetResult};
use crate::net::transport::{Connector, ProxyDescriptor, Target, Transport};
use lumen::config::{ClientConfig, Profile};
use lumen::logging;
use mio::{Interest, Registry, Token};
use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};

/// One half of the stream pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Half {
    Read,
    Write,
}

/// Lifecycle state of a single stream half.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    NotConfigured,
    Ready,
    Connecting,
    Connected,
    Error,
}

/// Readiness event delivered to one half of the stream pair. The event loop
/// produces these from socket readiness; tests inject them directly.
#[derive(Debug)]
pub enum StreamEvent {
    OpenCompleted,
    CanAcceptBytes,
    BytesAvailable,
    EndEncountered,
    Faulted(Fault),
}

/// Configuration snapshot taken at construction. Later changes to the
/// ambient configuration never reconfigure an open connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub origin: String,
    pub secure_preferred: bool,
    pub can_reduce_security: bool,
    pub can_fall_back_to_cleartext: bool,
    pub proxy: Option<ProxyDescriptor>,
}

impl From<&ClientConfig> for ConnectionConfig {
    fn from(config: &ClientConfig) -> ConnectionConfig {
        ConnectionConfig {
            origin: config.origin.clone(),
            secure_preferred: config.secure_preferred,
            can_reduce_security: config.can_reduce_security,
            can_fall_back_to_cleartext: config.can_fall_back_to_cleartext,
            proxy: config.proxy.as_ref().map(|proxy| ProxyDescriptor {
                host: proxy.host.clone(),
                port: proxy.port,
            }),
        }
    }
}

/// A long-lived full-duplex connection to a single remote origin. Outbound
/// request buffers are pulled from the data source and multiplexed onto the
/// socket; inbound bytes accumulate for the response collaborator. All
/// methods must be called from the loop that owns the connection.
pub struct Connection {
    identifier: String,
    config: ConnectionConfig,
    level: SecurityLevel,
    options: Option<SecurityOptions>,

    read_state: StreamState,
    write_state: StreamState,
    can_accept_bytes: bool,
    process_next: bool,

    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    target: Option<Target>,

    accumulator: Accumulator,
    inflight: Option<WriteBuffer>,
    last_response: Option<ResponseSummary>,

    delegates: DelegateSet,
    data_source: Option<Weak<RefCell<dyn ConnectionDataSource>>>,
    setup_fault: Option<Fault>,

    log: logging::Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        identifier: impl Into<String>,
        config: ConnectionConfig,
        profile: Profile,
        connector: Box<dyn Connector>,
        log: L,
    ) -> Connection {
        let identifier = identifier.into();

        let log = match log.into() {
            Some(log) => log.new(logging::o!("connection" => identifier.clone())),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let level = SecurityLevel::initial(config.secure_preferred);

        Connection {
            identifier,
            config,
            level,
            options: None,
            read_state: StreamState::NotConfigured,
            write_state: StreamState::NotConfigured,
            can_accept_bytes: false,
            process_next: false,
            connector,
            transport: None,
            target: None,
            accumulator: Accumulator::new(),
            inflight: None,
            last_response: None,
            delegates: DelegateSet::new(profile),
            data_source: None,
            setup_fault: None,
            log,
        }
    }

    #[inline]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[inline]
    pub fn origin(&self) -> &str {
        &self.config.origin
    }

    #[inline]
    pub fn security_level(&self) -> SecurityLevel {
        self.level
    }

    #[inline]
    pub fn security_options(&self) -> Option<&SecurityOptions> {
        self.options.as_ref()
    }

    #[inline]
    pub fn read_state(&self) -> StreamState {
        self.read_state
    }

    #[inline]
    pub fn write_state(&self) -> StreamState {
        self.write_state
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.read_state == StreamState::Ready && self.write_state == StreamState::Ready
    }

    #[inline]
    pub fn is_connecting(&self) -> bool {
        self.read_state == StreamState::Connecting && self.write_state == StreamState::Connecting
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.read_state == StreamState::Connected && self.write_state == StreamState::Connected
    }

    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.read_state == StreamState::NotConfigured
            && self.write_state == StreamState::NotConfigured
    }

    /// Fault recorded when the stream pair could not be configured.
    #[inline]
    pub fn initialization_fault(&self) -> Option<&Fault> {
        self.setup_fault.as_ref()
    }

    /// Most recent status line inspection.
    #[inline]
    pub fn last_response(&self) -> Option<ResponseSummary> {
        self.last_response
    }

    /// Accumulated response bytes, untouched beyond inspection. The
    /// response collaborator frames and drains them through `consume_response_bytes`.
    #[inline]
    pub fn response_bytes(&self) -> &[u8] {
        self.accumulator.as_slice()
    }

    #[inline]
    pub fn consume_response_bytes(&mut self, count: usize) {
        self.accumulator.consume(count);
    }

    pub fn assign_delegate(&mut self, delegate: &DelegateHandle) {
        self.delegates.assign(delegate);
    }

    pub fn resign_delegate(&mut self, delegate: &DelegateHandle) {
        self.delegates.resign(delegate);
    }

    pub fn set_data_source(&mut self, source: &DataSourceHandle) {
        self.data_source = Some(Rc::downgrade(source));
    }
}

impl Connection {
    /// Configures the stream pair towards `origin:port`, the port following
    /// the current security level. No-op when the pair is already
    /// configured.
    pub fn prepare(&mut self) -> NetResult<()> {
        if self.read_state != StreamState::NotConfigured
            || self.write_state != StreamState::NotConfigured
        {
            return Ok(());
        }

        if self.config.origin.is_empty() {
            let fault = Fault::setup("Connection requires an origin host");
            self.setup_fault = Some(fault.clone());

            return Err(NetError::Fatal(fault));
        }

        self.setup_fault = None;
        self.options = SecurityPolicy::options_for(self.level);
        self.target = Some(Target {
            host: self.config.origin.clone(),
            port: self.level.port(),
            security: self.options.clone(),
            proxy: self.config.proxy.clone(),
        });

        self.read_state = StreamState::Ready;
        self.write_state = StreamState::Ready;

        logging::debug!(self.log, "stream pair prepared";
                        "context" => "prepare",
                        "host" => %self.config.origin,
                        "port" => self.level.port(),
                        "secure" => self.level.is_secure());

        Ok(())
    }

    /// Fire-and-forget connect. Progress and failure are reported through
    /// the delegates; this call never surfaces an error to the caller.
    pub fn connect(&mut self) {
        if self.is_connected() || self.is_connecting() {
            return;
        }

        if !self.is_ready() {
            // A half stuck in an error state keeps prepare from
            // reconfiguring; reset the pair first.
            self.close_connection();

            if let Err(NetError::Fatal(fault)) = self.prepare() {
                logging::warn!(self.log, "stream pair setup failed";
                               "context" => "connect",
                               "fault" => %fault);
                self.fan_out_failed(&fault);

                return;
            }
        }

        self.open_streams();
    }

    fn open_streams(&mut self) {
        let target = self
            .target
            .clone()
            .expect("Prepared connection must have a target");

        match self.connector.open(&target, &self.log) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.read_state = StreamState::Connecting;
                self.write_state = StreamState::Connecting;

                logging::debug!(self.log, "opening connection";
                                "context" => "connect",
                                "host" => %target.host,
                                "port" => target.port);
            }
            Err(fault) => {
                self.read_state = StreamState::Error;
                self.write_state = StreamState::Error;
                self.handle_fault(Half::Write, fault);
            }
        }
    }

    /// Idempotent teardown of both halves. Fires no delegate events by
    /// itself; the event paths that lead here fan out before or after as
    /// appropriate.
    pub fn close_connection(&mut self) {
        if self.is_disconnected() && self.transport.is_none() {
            return;
        }

        logging::debug!(self.log, "closing connection";
                        "context" => "close",
                        "read_state" => ?self.read_state,
                        "write_state" => ?self.write_state,
                        "accumulated" => self.accumulator.len());

        // A request abandoned mid-write is failed, not silently dropped.
        if let Some(buffer) = self.inflight.take() {
            if buffer.is_partially_sent() {
                let request = buffer.request_identifier().to_string();

                self.with_source(|source, connection| {
                    source.did_fail_to_process_request(connection, &request)
                });
            }
        }

        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }

        self.accumulator.clear();
        self.options = None;
        self.target = None;
        self.last_response = None;
        self.can_accept_bytes = false;
        self.read_state = StreamState::NotConfigured;
        self.write_state = StreamState::NotConfigured;
    }
}

impl Connection {
    /// Advances the state machine with a readiness event for one half.
    pub fn handle_stream_event(&mut self, half: Half, event: StreamEvent) {
        match event {
            StreamEvent::OpenCompleted => self.on_open_completed(half),
            StreamEvent::CanAcceptBytes => {
                if half == Half::Write && self.write_state == StreamState::Connected {
                    self.can_accept_bytes = true;

                    if self.process_next {
                        self.pull_next();
                    }

                    self.write_step();
                }
            }
            StreamEvent::BytesAvailable => {
                if half == Half::Read && self.read_state == StreamState::Connected {
                    self.read_step();
                }
            }
            StreamEvent::EndEncountered => {
                if !self.is_disconnected() {
                    self.handle_end();
                }
            }
            StreamEvent::Faulted(fault) => self.handle_fault(half, fault),
        }
    }

    fn on_open_completed(&mut self, half: Half) {
        if self.half_state(half) != StreamState::Connecting {
            return;
        }

        self.set_half_state(half, StreamState::Connected);

        // Connection readiness is advertised only once both halves agree.
        if self.is_connected() {
            logging::debug!(self.log, "connection established";
                            "context" => "open",
                            "host" => %self.config.origin,
                            "level" => ?self.level);

            self.fan_out_connected();

            if self.process_next && self.pull_next() && self.can_accept_bytes {
                self.write_step();
            }
        }
    }

    fn handle_end(&mut self) {
        // Remote-initiated EOF stands in for a timeout: close cleanly.
        logging::debug!(self.log, "remote closed the stream"; "context" => "end");

        self.close_connection();
        self.fan_out_disconnected();
    }

    fn handle_fault(&mut self, half: Half, fault: Fault) {
        logging::debug!(self.log, "stream fault";
                        "context" => "error",
                        "half" => ?half,
                        "fault" => %fault);

        if fault.is_tls_handshake() {
            let permitted = match self.level {
                SecurityLevel::Strict => self.config.can_reduce_security,
                SecurityLevel::Lenient => self.config.can_fall_back_to_cleartext,
                SecurityLevel::Cleartext => false,
            };

            if permitted {
                if let Some(level) = self.level.reduced() {
                    self.fall_back(level);
                    return;
                }
            }
        }

        // A fault that interrupts a partially sent request belongs to the
        // data source, not the delegates.
        let correlated = half == Half::Write
            && self
                .inflight
                .as_ref()
                .map(WriteBuffer::is_partially_sent)
                .unwrap_or(false);

        if correlated {
            let buffer = self
                .inflight
                .take()
                .expect("Correlated fault must have an in-flight buffer");
            let request = buffer.request_identifier().to_string();

            self.with_source(|source, connection| {
                source.did_fail_to_process_request(connection, &request)
            });

            if Self::should_close(&fault) {
                self.fan_out_will_disconnect(&fault);
                self.close_connection();
            } else {
                self.set_half_state(half, StreamState::Error);
            }

            return;
        }

        if Self::should_close(&fault) {
            self.fan_out_will_disconnect(&fault);
            self.close_connection();
        } else {
            self.set_half_state(half, StreamState::Error);
            self.fan_out_failed(&fault);
        }
    }

    /// Transition, not unwinding: tear the pair down without any delegate
    /// traffic and restart the handshake at the relaxed level.
    fn fall_back(&mut self, level: SecurityLevel) {
        logging::debug!(self.log, "remote refused the current security level, relaxing";
                        "context" => "fallback",
                        "from" => ?self.level,
                        "to" => ?level);

        self.level = level;
        self.close_connection();
        self.connect();
    }

    fn should_close(fault: &Fault) -> bool {
        match fault.domain {
            Domain::Posix | Domain::Security => true,
            Domain::Engine => false,
        }
    }

    #[inline]
    fn half_state(&self, half: Half) -> StreamState {
        match half {
            Half::Read => self.read_state,
            Half::Write => self.write_state,
        }
    }

    #[inline]
    fn set_half_state(&mut self, half: Half, state: StreamState) {
        match half {
            Half::Read => self.read_state = state,
            Half::Write => self.write_state = state,
        }
    }

    fn take_transport_fault(&mut self, error: io::Error) -> Fault {
        self.transport
            .as_mut()
            .and_then(|transport| transport.take_fault())
            .unwrap_or_else(|| Fault::posix(&error))
    }
}

impl Connection {
    /// Requests that the next buffer be pulled from the data source once the
    /// in-flight one (if any) completes. Fire-and-forget.
    pub fn schedule_next_request_execution(&mut self) {
        self.process_next = true;

        if !self.is_connected() {
            return;
        }

        if self.pull_next() && self.can_accept_bytes {
            self.write_step();
        }
    }

    /// Cancels future pulls. The in-flight buffer is unaffected.
    pub fn unschedule_requests_execution(&mut self) {
        self.process_next = false;
    }

    fn pull_next(&mut self) -> bool {
        if self.inflight.is_some() {
            return true;
        }

        if !self.is_connected() {
            return false;
        }

        let pulled = self.with_source(|source, connection| {
            if !source.has_data(connection) {
                return None;
            }

            let request = source.next_request_identifier(connection);
            let buffer = source.request_data(connection, &request);

            Some(buffer)
        });

        match pulled.and_then(|inner| inner) {
            Some(buffer) => {
                logging::trace!(self.log, "pulled next request";
                                "context" => "schedule",
                                "request" => %buffer.request_identifier(),
                                "size" => buffer.len());

                self.inflight = Some(buffer);
                true
            }
            None => false,
        }
    }

    fn write_step(&mut self) {
        while self.can_accept_bytes {
            let mut buffer = match self.inflight.take() {
                Some(buffer) => buffer,
                None => break,
            };

            if self.transport.is_none() {
                self.inflight = Some(buffer);
                break;
            }

            if buffer.offset() == 0 && !buffer.started() {
                buffer.mark_started();
                let request = buffer.request_identifier().to_string();

                self.with_source(|source, connection| {
                    source.processing_started(connection, &request)
                });
            }

            let outcome = {
                let transport = self.transport.as_mut().expect("Checked above");
                buffer.write_to(&mut **transport)
            };

            match outcome {
                Ok(_) if !buffer.has_data() => {
                    let request = buffer.request_identifier().to_string();

                    logging::trace!(self.log, "request fully shipped";
                                    "context" => "write",
                                    "request" => %request,
                                    "size" => buffer.len());

                    self.with_source(|source, connection| {
                        source.did_send_request(connection, &request)
                    });

                    if !(self.process_next && self.pull_next()) {
                        break;
                    }
                }
                Ok(written) => {
                    // The socket took a partial range; the rest waits for
                    // the next readiness event.
                    logging::trace!(self.log, "partial write";
                                    "context" => "write",
                                    "request" => %buffer.request_identifier(),
                                    "written" => written,
                                    "offset" => buffer.offset());

                    self.inflight = Some(buffer);
                    self.can_accept_bytes = false;
                    break;
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {
                    self.inflight = Some(buffer);
                    self.can_accept_bytes = false;
                    break;
                }
                Err(error) => {
                    let fault = self.take_transport_fault(error);

                    self.inflight = Some(buffer);
                    self.handle_fault(Half::Write, fault);
                    break;
                }
            }
        }
    }

    fn read_step(&mut self) {
        loop {
            let outcome = match self.transport.as_mut() {
                Some(transport) => self.accumulator.ingress(&mut **transport),
                None => return,
            };

            match outcome {
                Ok(0) => {
                    self.handle_end();
                    return;
                }
                Ok(read) => {
                    logging::trace!(self.log, "accumulated response bytes";
                                    "context" => "read",
                                    "read" => read,
                                    "accumulated" => self.accumulator.len());

                    self.inspect_response();
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    let fault = self.take_transport_fault(error);

                    self.handle_fault(Half::Read, fault);
                    return;
                }
            }
        }
    }

    fn inspect_response(&mut self) {
        if let Some(summary) = response::inspect(self.accumulator.as_slice()) {
            logging::trace!(self.log, "inspected response head";
                            "context" => "read",
                            "status" => summary.status_code,
                            "content_length" => ?summary.content_length);

            self.last_response = Some(summary);
        }
    }

    fn with_source<R, F: FnOnce(&mut dyn ConnectionDataSource, &str) -> R>(
        &self,
        operation: F,
    ) -> Option<R> {
        let source = self.data_source.as_ref()?.upgrade()?;
        let mut source = source.borrow_mut();

        Some(operation(&mut *source, &self.identifier))
    }
}

impl Connection {
    fn fan_out_connected(&mut self) {
        let host = self.config.origin.clone();

        self.delegates
            .broadcast(|delegate| delegate.did_connect_to_host(&host));
        bus::publish(BusEvent::Connected {
            connection: self.identifier.clone(),
            host,
        });
    }

    fn fan_out_disconnected(&mut self) {
        let host = self.config.origin.clone();

        self.delegates
            .broadcast(|delegate| delegate.did_disconnect_from_host(&host));
        bus::publish(BusEvent::Disconnected {
            connection: self.identifier.clone(),
            host,
        });
    }

    fn fan_out_will_disconnect(&mut self, fault: &Fault) {
        let host = self.config.origin.clone();

        self.delegates
            .broadcast(|delegate| delegate.will_disconnect_from_host(&host, fault));
        bus::publish(BusEvent::WillDisconnect {
            connection: self.identifier.clone(),
            host,
            fault: fault.clone(),
        });
    }

    fn fan_out_failed(&mut self, fault: &Fault) {
        let host = self.config.origin.clone();

        self.delegates
            .broadcast(|delegate| delegate.connection_did_fail_to_host(&host, fault));
        bus::publish(BusEvent::Failed {
            connection: self.identifier.clone(),
            host,
            fault: fault.clone(),
        });
    }
}

impl Connection {
    /// Registers the transport on the supplied poll registry.
    pub fn register_transport(&mut self, registry: &Registry, token: Token) -> NetResult<()> {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => return Err(NetError::Fatal(Fault::setup("No transport to register"))),
        };

        if let Some(source) = transport.source() {
            registry.register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        }

        Ok(())
    }

    /// Deregisters the transport from the supplied poll registry.
    pub fn deregister_transport(&mut self, registry: &Registry) -> NetResult<()> {
        if let Some(transport) = self.transport.as_mut() {
            if let Some(source) = transport.source() {
                registry.deregister(source)?;
            }
        }

        Ok(())
    }

    /// Translates socket readiness into per-half stream events. The socket
    /// pair shares one handle, so both halves report open completion when
    /// the underlying connect finishes.
    pub fn dispatch_readiness(
        &mut self,
        readable: bool,
        writable: bool,
        read_closed: bool,
        errored: bool,
    ) {
        if errored {
            if let Some(fault) = self.transport.as_mut().and_then(|t| t.take_fault()) {
                self.handle_stream_event(Half::Write, StreamEvent::Faulted(fault));
                return;
            }
        }

        if writable {
            if self.is_connecting() {
                match self.transport.as_mut().map(|t| t.established()) {
                    Some(Ok(true)) => {
                        self.handle_stream_event(Half::Read, StreamEvent::OpenCompleted);
                        self.handle_stream_event(Half::Write, StreamEvent::OpenCompleted);
                    }
                    Some(Ok(false)) | None => (),
                    Some(Err(error)) => {
                        let fault = self.take_transport_fault(error);

                        self.handle_stream_event(Half::Write, StreamEvent::Faulted(fault));
                        return;
                    }
                }
            }

            // Ship any ciphertext the security layer buffered.
            if let Some(transport) = self.transport.as_mut() {
                drop(io::Write::flush(&mut **transport));
            }

            self.handle_stream_event(Half::Write, StreamEvent::CanAcceptBytes);
        }

        if readable || read_closed {
            self.handle_stream_event(Half::Read, StreamEvent::BytesAvailable);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_connection();
    }
}
