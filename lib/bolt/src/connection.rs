//! The per-socket request/response state machine. Requests are enqueued
//! locally together with their response handles; the server answers in
//! strict FIFO order, so completion order equals enqueue order.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use socket2::SockRef;
use strut::logging;
use strut::logging::Logger;

use crate::address::Address;
use crate::auth::AuthToken;
use crate::chunk::{self, ChunkedOutput};
use crate::codec::{Packer, Unpacker};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::handshake;
use crate::message::{Request, Summary};
use crate::response::{NoOpResponse, Response};
use crate::routing::AccessMode;
use crate::security::SecurityPlan;
use crate::server::ServerInfo;
use crate::value::{dehydrate, hydrate, Value, ValueMap};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Closed,
    ConnectedUnauth,
    Ready,
    Streaming,
    TxOpen,
    Failed,
    Defunct,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RequestKind {
    Init,
    Run,
    PullAll,
    DiscardAll,
    Begin,
    Commit,
    Rollback,
    Reset,
    Route,
}

struct Pending {
    kind: RequestKind,
    response: Box<dyn Response>,
}

/// Optional request qualifiers, accepted by the server on protocol 3 and
/// up: transaction metadata, a server-side timeout, causal-consistency
/// bookmarks and an access mode hint.
#[derive(Default, Clone)]
pub struct Extra {
    pub mode: Option<AccessMode>,
    pub bookmarks: Vec<String>,
    pub metadata: Option<ValueMap>,
    pub timeout: Option<f64>,
}

impl Extra {
    #[inline]
    fn is_plain(&self) -> bool {
        self.mode.is_none()
            && self.bookmarks.is_empty()
            && self.metadata.is_none()
            && self.timeout.is_none()
    }

    fn to_map(&self) -> Result<ValueMap> {
        let mut map = ValueMap::new();
        if self.mode == Some(AccessMode::Read) {
            map.insert("mode".to_string(), Value::from("r"));
        }
        if !self.bookmarks.is_empty() {
            map.insert(
                "bookmarks".to_string(),
                Value::List(
                    self.bookmarks
                        .iter()
                        .map(|b| Value::from(b.as_str()))
                        .collect(),
                ),
            );
        }
        if let Some(metadata) = &self.metadata {
            map.insert("tx_metadata".to_string(), Value::Map(metadata.clone()));
        }
        if let Some(timeout) = self.timeout {
            if timeout < 0.0 {
                return Err(Error::client("transaction timeout must not be negative"));
            }
            map.insert(
                "tx_timeout".to_string(),
                Value::Integer((1000.0 * timeout) as i64),
            );
        }
        Ok(map)
    }
}

/// The socket, plain or TLS-wrapped.
enum Stream {
    Plain(TcpStream),
    Secure(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Stream {
    #[inline]
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(stream) => stream,
            Stream::Secure(stream) => &stream.sock,
        }
    }

    fn shutdown(&self) {
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.read(buf),
            Stream::Secure(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.write(buf),
            Stream::Secure(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(stream) => stream.flush(),
            Stream::Secure(stream) => stream.flush(),
        }
    }
}

pub struct Connection {
    address: Address,
    io: BufReader<Stream>,
    version: u32,
    server: ServerInfo,
    outbox: ChunkedOutput,
    responses: VecDeque<Pending>,
    state: ConnectionState,
    in_transaction: bool,
    in_use: bool,
    created: Instant,
    last_acquired: Instant,
    log: Logger,
}

impl Connection {
    fn new(stream: Stream, address: Address, resolved: Address, version: u32, log: Logger) -> Connection {
        let now = Instant::now();
        Connection {
            address,
            io: BufReader::new(stream),
            version,
            server: ServerInfo::new(resolved, version),
            outbox: ChunkedOutput::new(),
            responses: VecDeque::new(),
            state: ConnectionState::ConnectedUnauth,
            in_transaction: false,
            in_use: false,
            created: now,
            last_acquired: now,
            log,
        }
    }

    /// The logical address this connection was opened for; pool slots key
    /// on it. The resolved endpoint lives in `server()`.
    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[inline]
    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    #[inline]
    pub fn protocol_version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn secure(&self) -> bool {
        matches!(self.io.get_ref(), Stream::Secure(_))
    }

    #[inline]
    pub fn is_defunct(&self) -> bool {
        self.state == ConnectionState::Defunct
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    #[inline]
    pub(crate) fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
        if in_use {
            self.last_acquired = Instant::now();
        }
    }

    /// Time since this connection was created.
    #[inline]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// The instant this connection last left the pool.
    #[inline]
    pub fn last_acquired(&self) -> Instant {
        self.last_acquired
    }

    /// Outstanding response handles.
    #[inline]
    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    fn require_protocol(&self, minimum: u32, what: &str) -> Result<()> {
        if self.version < minimum {
            return Err(Error::client(format!(
                "{} requires protocol version {} or above, connection speaks {}",
                what, minimum, self.version
            )));
        }
        Ok(())
    }

    fn append(&mut self, request: Request, kind: RequestKind, response: Box<dyn Response>) -> Result<()> {
        self.append_request(request)?;
        self.responses.push_back(Pending { kind, response });
        Ok(())
    }

    fn append_request(&mut self, request: Request) -> Result<()> {
        match self.state {
            ConnectionState::Defunct => {
                return Err(Error::ServiceUnavailable(
                    "connection is defunct".to_string(),
                ))
            }
            ConnectionState::Closed => {
                return Err(Error::ServiceUnavailable("connection is closed".to_string()))
            }
            _ => (),
        }
        logging::trace!(self.log, "writing message to output buffer";
                        "context" => "append",
                        "message" => request.name(),
                        "queued" => self.responses.len());
        let structure = request.into_structure();
        let mut body = Vec::new();
        let mut packer =
            Packer::new(&mut body).with_bytes_support(self.server.supports_bytes());
        packer.pack_structure(&structure)?;
        self.outbox.append_message(&body);
        Ok(())
    }

    /// Authenticates the connection. INIT below protocol 3, HELLO from
    /// protocol 3 on, where the user agent travels inside the metadata map.
    pub fn init(&mut self, user_agent: &str, auth: &AuthToken) -> Result<()> {
        auth.validate()?;
        let request = if self.version >= 3 {
            let mut metadata = ValueMap::new();
            metadata.insert("user_agent".to_string(), Value::from(user_agent));
            for (key, value) in auth.to_map() {
                metadata.insert(key, value);
            }
            Request::Hello { metadata }
        } else {
            Request::Init {
                user_agent: user_agent.to_string(),
                auth: auth.to_map(),
            }
        };
        self.append(request, RequestKind::Init, Box::new(NoOpResponse))?;
        self.sync()
    }

    pub fn run<R: Response + 'static>(
        &mut self,
        statement: &str,
        parameters: ValueMap,
        extra: Extra,
        response: R,
    ) -> Result<()> {
        let extra = if self.version >= 3 {
            Some(extra.to_map()?)
        } else {
            if !extra.is_plain() {
                return Err(Error::client(
                    "access modes, bookmarks, timeouts and transaction metadata \
                     require protocol version 3 or above",
                ));
            }
            None
        };
        let parameters = match dehydrate(Value::Map(parameters)) {
            Value::Map(parameters) => parameters,
            _ => unreachable!(),
        };
        self.append(
            Request::Run {
                statement: statement.to_string(),
                parameters,
                extra,
            },
            RequestKind::Run,
            Box::new(response),
        )
    }

    pub fn pull_all<R: Response + 'static>(&mut self, response: R) -> Result<()> {
        self.append(Request::PullAll, RequestKind::PullAll, Box::new(response))
    }

    pub fn discard_all<R: Response + 'static>(&mut self, response: R) -> Result<()> {
        self.append(Request::DiscardAll, RequestKind::DiscardAll, Box::new(response))
    }

    pub fn begin<R: Response + 'static>(&mut self, extra: Extra, response: R) -> Result<()> {
        self.require_protocol(3, "explicit transactions")?;
        self.append(
            Request::Begin {
                extra: extra.to_map()?,
            },
            RequestKind::Begin,
            Box::new(response),
        )
    }

    pub fn commit<R: Response + 'static>(&mut self, response: R) -> Result<()> {
        self.require_protocol(3, "explicit transactions")?;
        self.append(Request::Commit, RequestKind::Commit, Box::new(response))
    }

    pub fn rollback<R: Response + 'static>(&mut self, response: R) -> Result<()> {
        self.require_protocol(3, "explicit transactions")?;
        self.append(Request::Rollback, RequestKind::Rollback, Box::new(response))
    }

    /// Fetches the routing table, protocol 3 and up.
    pub(crate) fn route<R: Response + 'static>(
        &mut self,
        context: ValueMap,
        response: R,
    ) -> Result<()> {
        self.require_protocol(3, "ROUTE")?;
        self.append(Request::Route { context }, RequestKind::Route, Box::new(response))
    }

    /// Discards all outstanding server-side work. Earlier pending requests
    /// are answered with IGNORED before the RESET summary arrives.
    pub fn reset(&mut self) -> Result<()> {
        self.append(Request::Reset, RequestKind::Reset, Box::new(NoOpResponse))?;
        self.sync()
    }

    /// Flushes every buffered message to the socket.
    pub fn send_all(&mut self) -> Result<()> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        logging::trace!(self.log, "sending output buffer";
                        "context" => "send_all",
                        "bytes" => self.outbox.len());
        match self.outbox.write_to(self.io.get_mut()) {
            Ok(_) => Ok(()),
            Err(err) => Err(self.set_defunct(format!("failed to write to connection: {}", err))),
        }
    }

    /// Reads and dispatches a single response message.
    pub fn fetch_message(&mut self) -> Result<()> {
        if self.responses.is_empty() {
            return Err(Error::client("no outstanding responses to fetch"));
        }
        let body = match chunk::read_message(&mut self.io) {
            Ok(body) => body,
            Err(err) => {
                return Err(self.set_defunct(format!("failed to read from connection: {}", err)))
            }
        };
        if body.is_empty() {
            self.set_defunct("peer sent an empty message".to_string());
            return Err(Error::Decoding("message has no content".to_string()));
        }
        let structure = match Unpacker::new(&body[..]).unpack_structure() {
            Ok(structure) => structure,
            Err(err) => {
                self.set_defunct(format!("undecodable response: {}", err));
                return Err(err);
            }
        };
        let summary = match Summary::from_structure(structure) {
            Ok(summary) => summary,
            Err(err) => {
                self.set_defunct(format!("unknown response: {}", err));
                return Err(err);
            }
        };
        self.dispatch(summary)
    }

    fn dispatch(&mut self, summary: Summary) -> Result<()> {
        match summary {
            Summary::Record(values) => {
                let record = match values.into_iter().map(hydrate).collect::<Result<Vec<_>>>() {
                    Ok(record) => record,
                    Err(err) => {
                        self.set_defunct(format!("unhydratable record: {}", err));
                        return Err(err);
                    }
                };
                match self.responses.front_mut() {
                    Some(entry) => entry.response.on_records(vec![record]),
                    None => {
                        self.set_defunct("record arrived with no outstanding request".to_string());
                        return Err(Error::Decoding(
                            "record arrived with no outstanding request".to_string(),
                        ));
                    }
                }
                Ok(())
            }
            Summary::Success(metadata) => {
                let mut entry = match self.responses.pop_front() {
                    Some(entry) => entry,
                    None => {
                        self.set_defunct("summary arrived with no outstanding request".to_string());
                        return Err(Error::Decoding(
                            "summary arrived with no outstanding request".to_string(),
                        ));
                    }
                };
                logging::trace!(self.log, "request succeeded";
                                "context" => "fetch",
                                "request" => ?entry.kind);
                match entry.kind {
                    RequestKind::Init => {
                        self.server.update(&metadata);
                        self.state = ConnectionState::Ready;
                    }
                    RequestKind::Run => self.state = ConnectionState::Streaming,
                    RequestKind::PullAll | RequestKind::DiscardAll => {
                        self.state = if self.in_transaction {
                            ConnectionState::TxOpen
                        } else {
                            ConnectionState::Ready
                        };
                    }
                    RequestKind::Begin => {
                        self.in_transaction = true;
                        self.state = ConnectionState::TxOpen;
                    }
                    RequestKind::Commit | RequestKind::Rollback => {
                        self.in_transaction = false;
                        self.state = ConnectionState::Ready;
                    }
                    RequestKind::Reset => {
                        self.in_transaction = false;
                        self.state = ConnectionState::Ready;
                    }
                    RequestKind::Route => (),
                }
                entry.response.on_success(metadata);
                Ok(())
            }
            Summary::Failure(metadata) => {
                let mut entry = match self.responses.pop_front() {
                    Some(entry) => entry,
                    None => {
                        self.set_defunct("failure arrived with no outstanding request".to_string());
                        return Err(Error::Decoding(
                            "failure arrived with no outstanding request".to_string(),
                        ));
                    }
                };
                let (code, message) = Summary::failure_parts(&metadata);
                logging::debug!(self.log, "request failed";
                                "context" => "fetch",
                                "request" => ?entry.kind,
                                "code" => &code);
                self.state = ConnectionState::Failed;
                entry.response.on_failure(metadata);
                Err(match entry.kind {
                    // Unauthenticated connections are unusable after a
                    // rejected INIT/HELLO.
                    RequestKind::Init => {
                        self.state = ConnectionState::Defunct;
                        self.io.get_ref().shutdown();
                        Error::Auth(message)
                    }
                    // The COMMIT never got its summary; the transaction
                    // outcome is unknown to this client.
                    RequestKind::Commit => {
                        Error::IncompleteCommit(format!("[{}] {}", code, message))
                    }
                    _ => Error::from_failure(&code, &message),
                })
            }
            Summary::Ignored => {
                match self.responses.pop_front() {
                    Some(mut entry) => entry.response.on_ignored(),
                    None => {
                        self.set_defunct("IGNORED arrived with no outstanding request".to_string());
                        return Err(Error::Decoding(
                            "IGNORED arrived with no outstanding request".to_string(),
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    /// Reads responses until every queued handle has completed.
    pub fn fetch_all(&mut self) -> Result<()> {
        while !self.responses.is_empty() {
            self.fetch_message()?;
        }
        Ok(())
    }

    /// `send_all` then `fetch_all`.
    pub fn sync(&mut self) -> Result<()> {
        self.send_all()?;
        self.fetch_all()
    }

    /// Tears the connection down: every pending handle fails, the error to
    /// surface is returned. A COMMIT in flight upgrades it to
    /// `IncompleteCommit` since the transaction outcome is unknowable.
    fn set_defunct(&mut self, reason: String) -> Error {
        logging::debug!(self.log, "connection defunct";
                        "context" => "defunct",
                        "address" => %self.address,
                        "reason" => &reason,
                        "pending" => self.responses.len());
        self.state = ConnectionState::Defunct;
        self.io.get_ref().shutdown();
        self.outbox.clear();

        let mut commit_in_flight = false;
        let pending: Vec<Pending> = self.responses.drain(..).collect();
        for mut entry in pending {
            if entry.kind == RequestKind::Commit {
                commit_in_flight = true;
            }
            let mut metadata = ValueMap::new();
            metadata.insert("message".to_string(), Value::from(reason.as_str()));
            entry.response.on_failure(metadata);
        }
        if commit_in_flight {
            Error::IncompleteCommit(reason)
        } else {
            Error::ServiceUnavailable(reason)
        }
    }

    /// Closes the connection, sending a best-effort GOODBYE on protocol 3
    /// and up.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        logging::debug!(self.log, "closing connection";
                        "context" => "close",
                        "address" => %self.address,
                        "state" => ?self.state);
        if self.version >= 3 && self.state != ConnectionState::Defunct {
            if self.append_request(Request::Goodbye).is_ok() {
                let _ = self.outbox.write_to(self.io.get_mut());
            }
        }
        self.io.get_ref().shutdown();
        self.outbox.clear();
        self.responses.clear();
        self.state = ConnectionState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens, secures, handshakes and authenticates a connection to the given
/// logical address, walking resolved endpoints in order until one accepts.
pub fn connect<'a, L: Into<Option<&'a Logger>>>(
    address: &Address,
    config: &Config,
    plan: &SecurityPlan,
    log: L,
) -> Result<Connection> {
    // Reject broken credentials before any socket is opened.
    config.auth.validate()?;

    let log = match log.into() {
        Some(log) => log.new(logging::o!()),
        None => logging::null(),
    };
    let endpoints = address.resolve(config.resolver.as_ref())?;
    let mut last_error = None;
    for endpoint in endpoints {
        logging::trace!(log, "attempting endpoint";
                        "context" => "connect",
                        "address" => %address,
                        "endpoint" => %endpoint);
        match open_endpoint(address, endpoint, config, plan, &log) {
            Ok(connection) => return Ok(connection),
            Err(err @ Error::ServiceUnavailable(_)) => {
                logging::debug!(log, "endpoint attempt failed";
                                "context" => "connect",
                                "endpoint" => %endpoint,
                                "error" => %err);
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        Error::ServiceUnavailable(format!("failed to establish connection to {}", address))
    }))
}

fn open_endpoint(
    address: &Address,
    endpoint: SocketAddr,
    config: &Config,
    plan: &SecurityPlan,
    log: &Logger,
) -> Result<Connection> {
    let tcp = TcpStream::connect_timeout(&endpoint, config.connection_timeout())?;
    tcp.set_nodelay(true)?;
    if config.keep_alive {
        SockRef::from(&tcp).set_keepalive(true)?;
    }
    // Bound the handshake and authentication round trips; steady-state
    // reads block indefinitely and rely on keep-alive.
    tcp.set_read_timeout(Some(config.connection_timeout()))?;

    let mut stream = if plan.encrypted {
        let tls = plan.tls.clone().ok_or_else(|| {
            Error::Configuration("security plan requires TLS but carries no context".to_string())
        })?;
        let name = rustls::ServerName::try_from(address.host()).map_err(|_| {
            Error::Configuration(format!("invalid server name {:?}", address.host()))
        })?;
        let tls_connection = rustls::ClientConnection::new(tls, name)
            .map_err(|err| Error::ServiceUnavailable(format!("cannot initialise TLS: {}", err)))?;
        Stream::Secure(Box::new(rustls::StreamOwned::new(tls_connection, tcp)))
    } else {
        Stream::Plain(tcp)
    };

    let version = match handshake::perform(&mut stream) {
        Ok(version) => version,
        // The taxonomy keeps handshake failures distinct, but at connect
        // level an endpoint that cannot agree a version is just unusable.
        Err(Error::Handshake(message)) => return Err(Error::ServiceUnavailable(message)),
        Err(err) => return Err(err),
    };
    logging::debug!(log, "protocol version agreed";
                    "context" => "connect",
                    "endpoint" => %endpoint,
                    "version" => version);

    let mut connection = Connection::new(
        stream,
        address.clone(),
        Address::from(endpoint),
        version,
        log.new(logging::o!()),
    );
    connection.init(&config.user_agent, &config.auth)?;
    connection.io.get_ref().tcp().set_read_timeout(None)?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collector, meta, Script, StubServer};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn plain_config() -> Config {
        Config {
            encrypted: Some(false),
            connection_timeout: 2.0,
            auth: AuthToken::basic("neotest", "neotest"),
            ..Config::default()
        }
    }

    fn connect_to(server: &StubServer) -> Connection {
        connect(&server.address(), &plain_config(), &SecurityPlan::off(), None).unwrap()
    }

    #[test]
    fn test_connect_and_authenticate() {
        let server = StubServer::start(Script::hello());
        let cx = connect_to(&server);
        assert_eq!(cx.state(), ConnectionState::Ready);
        assert_eq!(cx.protocol_version(), 3);
        assert_eq!(cx.server().agent(), Some("Neo4j/3.5.0"));
        assert!(!cx.secure());
    }

    #[test]
    fn test_return_1() {
        let script = Script::hello()
            .recv()
            .success(meta(&[("fields", Value::List(vec![Value::from("x")]))]))
            .recv()
            .record(vec![Value::Integer(1)])
            .success(meta(&[]));
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        let (fields, fields_sink) = collector();
        let (records, records_sink) = collector();
        cx.run(
            "RETURN $x",
            {
                let mut params = ValueMap::new();
                params.insert("x".to_string(), Value::Integer(1));
                params
            },
            Extra::default(),
            fields_sink,
        )
        .unwrap();
        cx.pull_all(records_sink).unwrap();
        cx.sync().unwrap();

        assert_eq!(records.lock().records, vec![vec![Value::Integer(1)]]);
        assert_eq!(
            fields.lock().metadata.as_ref().unwrap()["fields"],
            Value::List(vec![Value::from("x")])
        );
        assert_eq!(cx.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_return_1_on_protocol_1() {
        let script = Script::with_version(1)
            .recv()
            .success(meta(&[("server", Value::from("Neo4j/3.4.0"))]))
            .recv()
            .success(meta(&[("fields", Value::List(vec![Value::from("x")]))]))
            .recv()
            .record(vec![Value::Integer(1)])
            .success(meta(&[]));
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);
        assert_eq!(cx.protocol_version(), 1);

        let (records, records_sink) = collector();
        cx.run("RETURN $x", ValueMap::new(), Extra::default(), NoOpResponse)
            .unwrap();
        cx.pull_all(records_sink).unwrap();
        cx.sync().unwrap();
        assert_eq!(records.lock().records, vec![vec![Value::Integer(1)]]);
    }

    #[test]
    fn test_callbacks_fire_in_enqueue_order() {
        let script = Script::hello()
            .recv()
            .success(meta(&[]))
            .recv()
            .record(vec![Value::Integer(1)])
            .success(meta(&[]))
            .recv()
            .success(meta(&[]))
            .recv()
            .record(vec![Value::Integer(2)])
            .success(meta(&[]));
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let tag = |name: &'static str| {
            let order = Arc::clone(&order);
            crate::response::Handlers::new().on_success(move |_| order.lock().push(name))
        };
        cx.run("RETURN 1", ValueMap::new(), Extra::default(), tag("run1"))
            .unwrap();
        cx.pull_all(tag("pull1")).unwrap();
        cx.run("RETURN 2", ValueMap::new(), Extra::default(), tag("run2"))
            .unwrap();
        cx.pull_all(tag("pull2")).unwrap();
        cx.sync().unwrap();

        assert_eq!(*order.lock(), vec!["run1", "pull1", "run2", "pull2"]);
    }

    #[test]
    fn test_commit_summary_carries_bookmark() {
        let script = Script::hello()
            .recv()
            .success(meta(&[]))
            .recv()
            .success(meta(&[("fields", Value::List(vec![Value::from("x")]))]))
            .recv()
            .record(vec![Value::Integer(1)])
            .success(meta(&[("type", Value::from("r"))]))
            .recv()
            .success(meta(&[("bookmark", Value::from("bookmark:1"))]));
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        let metadata: Arc<Mutex<ValueMap>> = Arc::new(Mutex::new(ValueMap::new()));
        let merge = |sink: &Arc<Mutex<ValueMap>>| {
            let sink = Arc::clone(sink);
            crate::response::Handlers::new().on_success(move |m| sink.lock().extend(m))
        };
        let (records, records_sink) = collector();
        cx.begin(Extra::default(), merge(&metadata)).unwrap();
        cx.run(
            "RETURN $x",
            {
                let mut params = ValueMap::new();
                params.insert("x".to_string(), Value::Integer(1));
                params
            },
            Extra::default(),
            merge(&metadata),
        )
        .unwrap();
        cx.pull_all(records_sink).unwrap();
        cx.commit(merge(&metadata)).unwrap();
        cx.sync().unwrap();

        assert_eq!(records.lock().records, vec![vec![Value::Integer(1)]]);
        let metadata = metadata.lock();
        assert_eq!(metadata["fields"], Value::List(vec![Value::from("x")]));
        assert_eq!(metadata["bookmark"], Value::from("bookmark:1"));
        assert_eq!(cx.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_disconnect_on_run_is_service_unavailable() {
        let script = Script::hello().recv().hangup();
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        cx.run("RETURN 1", ValueMap::new(), Extra::default(), NoOpResponse)
            .unwrap();
        match cx.sync() {
            Err(Error::ServiceUnavailable(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(cx.is_defunct());
    }

    #[test]
    fn test_connection_error_on_commit_is_incomplete() {
        let script = Script::hello()
            .recv()
            .success(meta(&[]))
            .recv()
            .success(meta(&[("fields", Value::List(vec![]))]))
            .recv()
            .success(meta(&[]))
            .recv()
            .hangup();
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        cx.begin(Extra::default(), NoOpResponse).unwrap();
        cx.run("CREATE (a) RETURN id(a)", ValueMap::new(), Extra::default(), NoOpResponse)
            .unwrap();
        cx.pull_all(NoOpResponse).unwrap();
        cx.sync().unwrap();
        assert_eq!(cx.state(), ConnectionState::TxOpen);

        cx.commit(NoOpResponse).unwrap();
        match cx.sync() {
            Err(Error::IncompleteCommit(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_failure_on_commit_is_incomplete() {
        let script = Script::hello()
            .recv()
            .success(meta(&[]))
            .recv()
            .failure("Neo.TransientError.General.Terminated", "boom");
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        cx.begin(Extra::default(), NoOpResponse).unwrap();
        cx.sync().unwrap();
        cx.commit(NoOpResponse).unwrap();
        match cx.sync() {
            Err(Error::IncompleteCommit(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_failure_then_ignored_then_reset() {
        let script = Script::hello()
            .recv()
            .failure("Neo.ClientError.Statement.SyntaxError", "bad syntax")
            .recv()
            .ignored()
            .recv()
            .success(meta(&[]));
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        let ignored: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
        let seen = Arc::clone(&ignored);
        cx.run("RETURN $", ValueMap::new(), Extra::default(), NoOpResponse)
            .unwrap();
        cx.pull_all(crate::response::Handlers::new().on_ignored(move || *seen.lock() = true))
            .unwrap();
        match cx.sync() {
            Err(Error::Client(failure)) => {
                assert_eq!(failure.code, "Neo.ClientError.Statement.SyntaxError")
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(cx.state(), ConnectionState::Failed);

        // the remaining request is answered with IGNORED
        cx.fetch_all().unwrap();
        assert!(*ignored.lock());

        cx.reset().unwrap();
        assert_eq!(cx.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_auth_failure_defuncts_connection() {
        let script = Script::with_version(3)
            .recv()
            .failure("Neo.ClientError.Security.Unauthorized", "who are you");
        let server = StubServer::start(script);
        match connect(&server.address(), &plain_config(), &SecurityPlan::off(), None) {
            Err(Error::Auth(message)) => assert!(message.contains("who are you")),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_malformed_auth_opens_no_socket() {
        // port 9 goes nowhere; if validation let us through this would be
        // ServiceUnavailable instead
        let mut config = plain_config();
        config.auth = AuthToken::basic("neotest", "");
        match connect(&Address::new("127.0.0.1", 9), &config, &SecurityPlan::off(), None) {
            Err(Error::Auth(_)) => (),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_http_misdial() {
        let server = StubServer::start(Script::with_version(3).handshake_reply(*b"HTTP"));
        match connect(&server.address(), &plain_config(), &SecurityPlan::off(), None) {
            Err(Error::ServiceUnavailable(message)) => assert!(message.contains("HTTP")),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_no_common_version() {
        let server = StubServer::start(Script::with_version(3).handshake_reply([0, 0, 0, 0]));
        match connect(&server.address(), &plain_config(), &SecurityPlan::off(), None) {
            Err(Error::ServiceUnavailable(message)) => assert!(message.contains("version")),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_extras_rejected_below_protocol_3() {
        let script = Script::with_version(1)
            .recv()
            .success(meta(&[("server", Value::from("Neo4j/3.4.0"))]));
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        let extra = Extra {
            timeout: Some(0.25),
            ..Extra::default()
        };
        match cx.run("RETURN 1", ValueMap::new(), extra, NoOpResponse) {
            Err(Error::Client(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        match cx.begin(Extra::default(), NoOpResponse) {
            Err(Error::Client(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_multi_chunk_bytes_round_trip_inside_a_node() {
        use crate::value::{Structure, TAG_NODE};

        let blob = vec![0u8; 16365];
        let mut properties = ValueMap::new();
        properties.insert("foo".to_string(), Value::Bytes(blob.clone()));
        let node = Structure::new(
            TAG_NODE,
            vec![
                Value::Integer(1),
                Value::List(vec![]),
                Value::Map(properties),
            ],
        );
        let script = Script::hello()
            .recv()
            .success(meta(&[]))
            .recv()
            .record(vec![Value::Structure(node)])
            .success(meta(&[]));
        let server = StubServer::start(script);
        let mut cx = connect_to(&server);

        let (records, records_sink) = collector();
        let mut params = ValueMap::new();
        params.insert("x".to_string(), Value::Bytes(blob.clone()));
        cx.run(
            "CREATE (a) SET a.foo = $x RETURN a",
            params,
            Extra::default(),
            NoOpResponse,
        )
        .unwrap();
        cx.pull_all(records_sink).unwrap();
        cx.sync().unwrap();

        let records = records.lock();
        match &records.records[0][0] {
            Value::Node(node) => assert_eq!(node.properties["foo"], Value::Bytes(blob)),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_custom_resolver_walks_endpoints_in_order() {
        let server = StubServer::start(Script::hello());
        let port = server.address().port();
        let mut config = plain_config();
        config.connection_timeout = 0.25;
        config.resolver = Some(Arc::new(move |address: &Address| {
            vec![
                Address::new("10.255.255.1", address.port()), // unroutable
                Address::new("127.0.0.1", address.port()),
            ]
        }));
        let cx = connect(&Address::new("*", port), &config, &SecurityPlan::off(), None).unwrap();
        assert_eq!(cx.server().address(), &Address::new("127.0.0.1", port));
    }

    #[test]
    fn test_timeout_extra_converts_to_milliseconds() {
        let extra = Extra {
            timeout: Some(12.34),
            ..Extra::default()
        };
        assert_eq!(extra.to_map().unwrap()["tx_timeout"], Value::Integer(12340));
        let negative = Extra {
            timeout: Some(-1.0),
            ..Extra::default()
        };
        assert!(negative.to_map().is_err());
    }

    #[test]
    fn test_read_mode_marks_extra_map() {
        let extra = Extra {
            mode: Some(AccessMode::Read),
            bookmarks: vec!["foo".to_string(), "bar".to_string()],
            ..Extra::default()
        };
        let map = extra.to_map().unwrap();
        assert_eq!(map["mode"], Value::from("r"));
        assert_eq!(
            map["bookmarks"],
            Value::List(vec![Value::from("foo"), Value::from("bar")])
        );
        assert!(Extra::default().to_map().unwrap().is_empty());
    }
}
