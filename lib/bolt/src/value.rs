use hashbrown::HashMap;
use indexmap::IndexMap;
use lazy_static::lazy_static;

use crate::error::{Error, Result};

/// String-keyed mapping with insertion order preserved, as required on the
/// wire.
pub type ValueMap = IndexMap<String, Value>;

/// The tagged union understood by the codec, extended with the hydrated
/// graph, spatial and temporal types the registry produces from tagged
/// structures.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(ValueMap),
    Structure(Structure),
    Node(Node),
    Relationship(Relationship),
    UnboundRelationship(UnboundRelationship),
    Path(Path),
    Point2D(Point2D),
    Point3D(Point3D),
    Date(Date),
    Time(Time),
    DateTime(DateTime),
    Duration(Duration),
}

/// A tagged tuple on the wire; the representation of protocol messages and
/// complex values alike.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub tag: u8,
    pub fields: Vec<Value>,
}

impl Structure {
    #[inline]
    pub fn new(tag: u8, fields: Vec<Value>) -> Structure {
        Structure { tag, fields }
    }
}

// Struct tag bytes.
pub const TAG_NODE: u8 = 0x4E;
pub const TAG_RELATIONSHIP: u8 = 0x52;
pub const TAG_UNBOUND_RELATIONSHIP: u8 = 0x72;
pub const TAG_PATH: u8 = 0x50;
pub const TAG_POINT_2D: u8 = 0x58;
pub const TAG_POINT_3D: u8 = 0x59;
pub const TAG_DATE: u8 = 0x44;
pub const TAG_TIME: u8 = 0x54;
pub const TAG_DATE_TIME: u8 = 0x46;
pub const TAG_DURATION: u8 = 0x45;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: ValueMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub id: i64,
    pub start: i64,
    pub end: i64,
    pub rel_type: String,
    pub properties: ValueMap,
}

/// A relationship detached from its endpoints, as it appears inside paths.
#[derive(Debug, Clone, PartialEq)]
pub struct UnboundRelationship {
    pub id: i64,
    pub rel_type: String,
    pub properties: ValueMap,
}

/// An alternating sequence of nodes and relationships. `sequence` indexes
/// into the node and relationship lists as transmitted by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub nodes: Vec<Node>,
    pub relationships: Vec<UnboundRelationship>,
    pub sequence: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point2D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point3D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Days since the unix epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Date {
    pub days: i64,
}

/// Nanoseconds since midnight, plus the UTC offset of the clock that
/// observed them.
#[derive(Debug, Clone, PartialEq)]
pub struct Time {
    pub nanoseconds: i64,
    pub tz_offset_seconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateTime {
    pub seconds: i64,
    pub nanoseconds: i64,
    pub tz_offset_seconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Duration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl Value {
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(values) => Some(values),
            _ => None,
        }
    }

    #[inline]
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Value {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Value {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Value {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Value {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Value {
        Value::List(value)
    }
}

impl From<ValueMap> for Value {
    fn from(value: ValueMap) -> Value {
        Value::Map(value)
    }
}

type Hydrator = fn(Vec<Value>) -> Result<Value>;

lazy_static! {
    /// Struct tag -> constructor. Tags absent from this table flow through
    /// as raw structures.
    static ref HYDRATORS: HashMap<u8, Hydrator> = {
        let mut registry = HashMap::new();
        registry.insert(TAG_NODE, hydrate_node as Hydrator);
        registry.insert(TAG_RELATIONSHIP, hydrate_relationship as Hydrator);
        registry.insert(TAG_UNBOUND_RELATIONSHIP, hydrate_unbound_relationship as Hydrator);
        registry.insert(TAG_PATH, hydrate_path as Hydrator);
        registry.insert(TAG_POINT_2D, hydrate_point_2d as Hydrator);
        registry.insert(TAG_POINT_3D, hydrate_point_3d as Hydrator);
        registry.insert(TAG_DATE, hydrate_date as Hydrator);
        registry.insert(TAG_TIME, hydrate_time as Hydrator);
        registry.insert(TAG_DATE_TIME, hydrate_date_time as Hydrator);
        registry.insert(TAG_DURATION, hydrate_duration as Hydrator);
        registry
    };
}

/// Replaces known tagged structures with their typed counterparts,
/// bottom-up. Unknown tags are kept as raw structures.
pub fn hydrate(value: Value) -> Result<Value> {
    match value {
        Value::List(values) => Ok(Value::List(
            values.into_iter().map(hydrate).collect::<Result<_>>()?,
        )),
        Value::Map(map) => {
            let mut hydrated = ValueMap::with_capacity(map.len());
            for (key, value) in map {
                hydrated.insert(key, hydrate(value)?);
            }
            Ok(Value::Map(hydrated))
        }
        Value::Structure(structure) => {
            let fields = structure
                .fields
                .into_iter()
                .map(hydrate)
                .collect::<Result<Vec<_>>>()?;
            match HYDRATORS.get(&structure.tag) {
                Some(hydrator) => hydrator(fields),
                None => Ok(Value::Structure(Structure::new(structure.tag, fields))),
            }
        }
        value => Ok(value),
    }
}

/// Replaces typed values with their wire structures, bottom-up. The inverse
/// of `hydrate`; applied to outgoing parameters before packing.
pub fn dehydrate(value: Value) -> Value {
    match value {
        Value::List(values) => Value::List(values.into_iter().map(dehydrate).collect()),
        Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, dehydrate(v))).collect()),
        Value::Structure(structure) => Value::Structure(Structure::new(
            structure.tag,
            structure.fields.into_iter().map(dehydrate).collect(),
        )),
        Value::Node(node) => Value::Structure(Structure::new(
            TAG_NODE,
            vec![
                Value::Integer(node.id),
                Value::List(node.labels.into_iter().map(Value::String).collect()),
                Value::Map(node.properties),
            ],
        )),
        Value::Relationship(rel) => Value::Structure(Structure::new(
            TAG_RELATIONSHIP,
            vec![
                Value::Integer(rel.id),
                Value::Integer(rel.start),
                Value::Integer(rel.end),
                Value::String(rel.rel_type),
                Value::Map(rel.properties),
            ],
        )),
        Value::UnboundRelationship(rel) => Value::Structure(Structure::new(
            TAG_UNBOUND_RELATIONSHIP,
            vec![
                Value::Integer(rel.id),
                Value::String(rel.rel_type),
                Value::Map(rel.properties),
            ],
        )),
        Value::Path(path) => Value::Structure(Structure::new(
            TAG_PATH,
            vec![
                Value::List(path.nodes.into_iter().map(Value::Node).map(dehydrate).collect()),
                Value::List(
                    path.relationships
                        .into_iter()
                        .map(Value::UnboundRelationship)
                        .map(dehydrate)
                        .collect(),
                ),
                Value::List(path.sequence.into_iter().map(Value::Integer).collect()),
            ],
        )),
        Value::Point2D(point) => Value::Structure(Structure::new(
            TAG_POINT_2D,
            vec![
                Value::Integer(point.srid),
                Value::Float(point.x),
                Value::Float(point.y),
            ],
        )),
        Value::Point3D(point) => Value::Structure(Structure::new(
            TAG_POINT_3D,
            vec![
                Value::Integer(point.srid),
                Value::Float(point.x),
                Value::Float(point.y),
                Value::Float(point.z),
            ],
        )),
        Value::Date(date) => {
            Value::Structure(Structure::new(TAG_DATE, vec![Value::Integer(date.days)]))
        }
        Value::Time(time) => Value::Structure(Structure::new(
            TAG_TIME,
            vec![
                Value::Integer(time.nanoseconds),
                Value::Integer(time.tz_offset_seconds),
            ],
        )),
        Value::DateTime(dt) => Value::Structure(Structure::new(
            TAG_DATE_TIME,
            vec![
                Value::Integer(dt.seconds),
                Value::Integer(dt.nanoseconds),
                Value::Integer(dt.tz_offset_seconds),
            ],
        )),
        Value::Duration(d) => Value::Structure(Structure::new(
            TAG_DURATION,
            vec![
                Value::Integer(d.months),
                Value::Integer(d.days),
                Value::Integer(d.seconds),
                Value::Integer(d.nanoseconds),
            ],
        )),
        value => value,
    }
}

fn field_error(what: &str) -> Error {
    Error::Decoding(format!("malformed {} structure", what))
}

fn take_int(fields: &mut std::vec::IntoIter<Value>, what: &str) -> Result<i64> {
    match fields.next() {
        Some(Value::Integer(value)) => Ok(value),
        _ => Err(field_error(what)),
    }
}

fn take_float(fields: &mut std::vec::IntoIter<Value>, what: &str) -> Result<f64> {
    match fields.next() {
        Some(Value::Float(value)) => Ok(value),
        _ => Err(field_error(what)),
    }
}

fn take_string(fields: &mut std::vec::IntoIter<Value>, what: &str) -> Result<String> {
    match fields.next() {
        Some(Value::String(value)) => Ok(value),
        _ => Err(field_error(what)),
    }
}

fn take_map(fields: &mut std::vec::IntoIter<Value>, what: &str) -> Result<ValueMap> {
    match fields.next() {
        Some(Value::Map(value)) => Ok(value),
        _ => Err(field_error(what)),
    }
}

fn take_list(fields: &mut std::vec::IntoIter<Value>, what: &str) -> Result<Vec<Value>> {
    match fields.next() {
        Some(Value::List(value)) => Ok(value),
        _ => Err(field_error(what)),
    }
}

fn hydrate_node(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    let id = take_int(&mut fields, "node")?;
    let labels = take_list(&mut fields, "node")?
        .into_iter()
        .map(|label| match label {
            Value::String(label) => Ok(label),
            _ => Err(field_error("node")),
        })
        .collect::<Result<_>>()?;
    let properties = take_map(&mut fields, "node")?;
    Ok(Value::Node(Node {
        id,
        labels,
        properties,
    }))
}

fn hydrate_relationship(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    Ok(Value::Relationship(Relationship {
        id: take_int(&mut fields, "relationship")?,
        start: take_int(&mut fields, "relationship")?,
        end: take_int(&mut fields, "relationship")?,
        rel_type: take_string(&mut fields, "relationship")?,
        properties: take_map(&mut fields, "relationship")?,
    }))
}

fn hydrate_unbound_relationship(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    Ok(Value::UnboundRelationship(UnboundRelationship {
        id: take_int(&mut fields, "unbound relationship")?,
        rel_type: take_string(&mut fields, "unbound relationship")?,
        properties: take_map(&mut fields, "unbound relationship")?,
    }))
}

fn hydrate_path(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    let nodes = take_list(&mut fields, "path")?
        .into_iter()
        .map(|value| match value {
            Value::Node(node) => Ok(node),
            _ => Err(field_error("path")),
        })
        .collect::<Result<_>>()?;
    let relationships = take_list(&mut fields, "path")?
        .into_iter()
        .map(|value| match value {
            Value::UnboundRelationship(rel) => Ok(rel),
            _ => Err(field_error("path")),
        })
        .collect::<Result<_>>()?;
    let sequence = take_list(&mut fields, "path")?
        .into_iter()
        .map(|value| value.as_int().ok_or_else(|| field_error("path")))
        .collect::<Result<_>>()?;
    Ok(Value::Path(Path {
        nodes,
        relationships,
        sequence,
    }))
}

fn hydrate_point_2d(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    Ok(Value::Point2D(Point2D {
        srid: take_int(&mut fields, "point")?,
        x: take_float(&mut fields, "point")?,
        y: take_float(&mut fields, "point")?,
    }))
}

fn hydrate_point_3d(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    Ok(Value::Point3D(Point3D {
        srid: take_int(&mut fields, "point")?,
        x: take_float(&mut fields, "point")?,
        y: take_float(&mut fields, "point")?,
        z: take_float(&mut fields, "point")?,
    }))
}

fn hydrate_date(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    Ok(Value::Date(Date {
        days: take_int(&mut fields, "date")?,
    }))
}

fn hydrate_time(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    Ok(Value::Time(Time {
        nanoseconds: take_int(&mut fields, "time")?,
        tz_offset_seconds: take_int(&mut fields, "time")?,
    }))
}

fn hydrate_date_time(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    Ok(Value::DateTime(DateTime {
        seconds: take_int(&mut fields, "datetime")?,
        nanoseconds: take_int(&mut fields, "datetime")?,
        tz_offset_seconds: take_int(&mut fields, "datetime")?,
    }))
}

fn hydrate_duration(fields: Vec<Value>) -> Result<Value> {
    let mut fields = fields.into_iter();
    Ok(Value::Duration(Duration {
        months: take_int(&mut fields, "duration")?,
        days: take_int(&mut fields, "duration")?,
        seconds: take_int(&mut fields, "duration")?,
        nanoseconds: take_int(&mut fields, "duration")?,
    }))
}
