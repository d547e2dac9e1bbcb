//! Protocol messages: requests the client sends and summaries the server
//! answers with. Every message is a tagged structure on the wire.

use crate::error::{Error, Result};
use crate::value::{Structure, Value, ValueMap};

// Request tags.
pub const INIT: u8 = 0x01;
pub const HELLO: u8 = 0x01;
pub const GOODBYE: u8 = 0x02;
pub const RESET: u8 = 0x0F;
pub const RUN: u8 = 0x10;
pub const BEGIN: u8 = 0x11;
pub const COMMIT: u8 = 0x12;
pub const ROLLBACK: u8 = 0x13;
pub const DISCARD_ALL: u8 = 0x2F;
pub const PULL_ALL: u8 = 0x3F;
pub const ROUTE: u8 = 0x66;

// Response tags.
pub const SUCCESS: u8 = 0x70;
pub const RECORD: u8 = 0x71;
pub const IGNORED: u8 = 0x7E;
pub const FAILURE: u8 = 0x7F;

/// A request message, ready to be turned into its wire structure.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Authentication message on protocol 1 and 2.
    Init { user_agent: String, auth: ValueMap },
    /// Authentication message on protocol 3 and up; the auth token and the
    /// user agent travel inside the single metadata map.
    Hello { metadata: ValueMap },
    /// `extra` is present on protocol 3 and up only.
    Run {
        statement: String,
        parameters: ValueMap,
        extra: Option<ValueMap>,
    },
    DiscardAll,
    PullAll,
    Begin { extra: ValueMap },
    Commit,
    Rollback,
    Reset,
    Goodbye,
    /// Routing table fetch on protocol 3 and up, carrying the routing
    /// context.
    Route { context: ValueMap },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Init { .. } => "INIT",
            Request::Hello { .. } => "HELLO",
            Request::Run { .. } => "RUN",
            Request::DiscardAll => "DISCARD_ALL",
            Request::PullAll => "PULL_ALL",
            Request::Begin { .. } => "BEGIN",
            Request::Commit => "COMMIT",
            Request::Rollback => "ROLLBACK",
            Request::Reset => "RESET",
            Request::Goodbye => "GOODBYE",
            Request::Route { .. } => "ROUTE",
        }
    }

    pub fn into_structure(self) -> Structure {
        match self {
            Request::Init { user_agent, auth } => Structure::new(
                INIT,
                vec![Value::String(user_agent), Value::Map(auth)],
            ),
            Request::Hello { metadata } => Structure::new(HELLO, vec![Value::Map(metadata)]),
            Request::Run {
                statement,
                parameters,
                extra,
            } => {
                let mut fields = vec![Value::String(statement), Value::Map(parameters)];
                if let Some(extra) = extra {
                    fields.push(Value::Map(extra));
                }
                Structure::new(RUN, fields)
            }
            Request::DiscardAll => Structure::new(DISCARD_ALL, vec![]),
            Request::PullAll => Structure::new(PULL_ALL, vec![]),
            Request::Begin { extra } => Structure::new(BEGIN, vec![Value::Map(extra)]),
            Request::Commit => Structure::new(COMMIT, vec![]),
            Request::Rollback => Structure::new(ROLLBACK, vec![]),
            Request::Reset => Structure::new(RESET, vec![]),
            Request::Goodbye => Structure::new(GOODBYE, vec![]),
            Request::Route { context } => Structure::new(ROUTE, vec![Value::Map(context)]),
        }
    }
}

/// A response message from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Summary {
    Success(ValueMap),
    Record(Vec<Value>),
    Failure(ValueMap),
    Ignored,
}

impl Summary {
    pub fn from_structure(structure: Structure) -> Result<Summary> {
        let Structure { tag, fields } = structure;
        let mut fields = fields.into_iter();
        match tag {
            SUCCESS => match fields.next() {
                Some(Value::Map(metadata)) => Ok(Summary::Success(metadata)),
                _ => Err(Error::Decoding("malformed SUCCESS message".to_string())),
            },
            RECORD => match fields.next() {
                Some(Value::List(values)) => Ok(Summary::Record(values)),
                _ => Err(Error::Decoding("malformed RECORD message".to_string())),
            },
            FAILURE => match fields.next() {
                Some(Value::Map(metadata)) => Ok(Summary::Failure(metadata)),
                _ => Err(Error::Decoding("malformed FAILURE message".to_string())),
            },
            IGNORED => Ok(Summary::Ignored),
            other => Err(Error::Decoding(format!(
                "unknown response message tag {:#04X}",
                other
            ))),
        }
    }

    /// Extracts the status code and message of a FAILURE metadata map.
    pub fn failure_parts(metadata: &ValueMap) -> (String, String) {
        let code = metadata
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let message = metadata
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        (code, message)
    }
}
