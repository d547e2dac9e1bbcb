//! Test support: a scripted stub server speaking real handshake, chunking
//! and packstream over a loopback listener, plus small collection helpers.

use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::address::Address;
use crate::chunk::{self, ChunkedOutput};
use crate::codec::Packer;
use crate::message;
use crate::response::Response;
use crate::value::{Structure, Value, ValueMap};

/// Builds a metadata map from literal pairs.
pub fn meta(pairs: &[(&str, Value)]) -> ValueMap {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// A port with nothing listening on it.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn routing_servers(addresses: &[&Address]) -> Vec<String> {
    addresses.iter().map(|address| address.to_string()).collect()
}

/// A routing record as servers report them.
pub fn routing_record(ttl: i64, route: &[String], read: &[String], write: &[String]) -> Value {
    let role = |name: &str, addresses: &[String]| {
        let mut map = ValueMap::new();
        map.insert("role".to_string(), Value::from(name));
        map.insert(
            "addresses".to_string(),
            Value::List(addresses.iter().map(|a| Value::from(a.as_str())).collect()),
        );
        Value::Map(map)
    };
    let mut record = ValueMap::new();
    record.insert("ttl".to_string(), Value::Integer(ttl));
    record.insert(
        "servers".to_string(),
        Value::List(vec![
            role("ROUTE", route),
            role("READ", read),
            role("WRITE", write),
        ]),
    );
    Value::Map(record)
}

/// Everything a `Collector` response saw.
#[derive(Default)]
pub struct Collected {
    pub metadata: Option<ValueMap>,
    pub records: Vec<Vec<Value>>,
    pub failure: Option<ValueMap>,
    pub ignored: bool,
}

pub struct Collector(Arc<Mutex<Collected>>);

impl Response for Collector {
    fn on_success(&mut self, metadata: ValueMap) {
        self.0.lock().metadata = Some(metadata);
    }

    fn on_records(&mut self, records: Vec<Vec<Value>>) {
        self.0.lock().records.extend(records);
    }

    fn on_failure(&mut self, metadata: ValueMap) {
        self.0.lock().failure = Some(metadata);
    }

    fn on_ignored(&mut self) {
        self.0.lock().ignored = true;
    }
}

/// A response handle that records everything, and the handle to read it
/// back through.
pub fn collector() -> (Arc<Mutex<Collected>>, Collector) {
    let collected = Arc::new(Mutex::new(Collected::default()));
    (Arc::clone(&collected), Collector(collected))
}

#[derive(Clone)]
enum Step {
    Recv,
    Send(Vec<u8>),
    Hangup,
}

/// A per-connection conversation: receive steps read and discard one
/// message, send steps emit pre-encoded messages, hangup slams the socket.
#[derive(Clone)]
pub struct Script {
    version: u32,
    handshake_reply: Option<[u8; 4]>,
    steps: Vec<Step>,
}

impl Script {
    pub fn with_version(version: u32) -> Script {
        Script {
            version,
            handshake_reply: None,
            steps: Vec::new(),
        }
    }

    /// Protocol 3 opening: consume HELLO, confirm with a server agent.
    pub fn hello() -> Script {
        Script::with_version(3)
            .recv()
            .success(meta(&[("server", Value::from("Neo4j/3.5.0"))]))
    }

    /// Overrides the 4-byte handshake reply, e.g. with `b"HTTP"`.
    pub fn handshake_reply(mut self, reply: [u8; 4]) -> Script {
        self.handshake_reply = Some(reply);
        self
    }

    pub fn recv(mut self) -> Script {
        self.steps.push(Step::Recv);
        self
    }

    pub fn success(self, metadata: ValueMap) -> Script {
        self.send(Structure::new(message::SUCCESS, vec![Value::Map(metadata)]))
    }

    pub fn record(self, values: Vec<Value>) -> Script {
        self.send(Structure::new(message::RECORD, vec![Value::List(values)]))
    }

    pub fn failure(self, code: &str, text: &str) -> Script {
        let mut metadata = ValueMap::new();
        metadata.insert("code".to_string(), Value::from(code));
        metadata.insert("message".to_string(), Value::from(text));
        self.send(Structure::new(message::FAILURE, vec![Value::Map(metadata)]))
    }

    pub fn ignored(self) -> Script {
        self.send(Structure::new(message::IGNORED, vec![]))
    }

    pub fn hangup(mut self) -> Script {
        self.steps.push(Step::Hangup);
        self
    }

    fn send(mut self, structure: Structure) -> Script {
        let mut body = Vec::new();
        let mut packer = Packer::new(&mut body).with_bytes_support(true);
        packer.pack_structure(&structure).unwrap();
        let mut framed = ChunkedOutput::new();
        framed.append_message(&body);
        let mut wire = Vec::new();
        framed.write_to(&mut wire).unwrap();
        self.steps.push(Step::Send(wire));
        self
    }
}

/// Loopback stub server. Every accepted connection replays the script.
pub struct StubServer {
    address: Address,
    accepted: Arc<AtomicUsize>,
}

impl StubServer {
    pub fn start(script: Script) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = Address::from(listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                thread::spawn(move || serve(stream, script));
            }
        });
        StubServer { address, accepted }
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

fn serve(mut stream: TcpStream, script: Script) {
    // handshake: magic preamble plus four proposals
    let mut opening = [0u8; 20];
    if stream.read_exact(&mut opening).is_err() {
        return;
    }
    let reply = script
        .handshake_reply
        .unwrap_or_else(|| script.version.to_be_bytes());
    if stream.write_all(&reply).is_err() {
        return;
    }

    for step in script.steps {
        match step {
            Step::Recv => {
                if chunk::read_message(&mut stream).is_err() {
                    return;
                }
            }
            Step::Send(bytes) => {
                if stream.write_all(&bytes).is_err() {
                    return;
                }
            }
            Step::Hangup => {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        }
    }

    // script exhausted: keep the socket open until the peer goes away
    let mut sink = [0u8; 1024];
    loop {
        match stream.read(&mut sink) {
            Ok(0) | Err(_) => return,
            Ok(_) => (),
        }
    }
}
