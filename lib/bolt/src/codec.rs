//! Packed-value codec. `Packer` and `Unpacker` are generic over the byte
//! sink/source and never own the transport; framing is the chunk layer's
//! concern.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::value::{Structure, Value, ValueMap};

pub const MARKER_NULL: u8 = 0xC0;
pub const MARKER_FLOAT: u8 = 0xC1;
pub const MARKER_FALSE: u8 = 0xC2;
pub const MARKER_TRUE: u8 = 0xC3;
pub const MARKER_INT_8: u8 = 0xC8;
pub const MARKER_INT_16: u8 = 0xC9;
pub const MARKER_INT_32: u8 = 0xCA;
pub const MARKER_INT_64: u8 = 0xCB;
pub const MARKER_BYTES_8: u8 = 0xCC;
pub const MARKER_BYTES_16: u8 = 0xCD;
pub const MARKER_BYTES_32: u8 = 0xCE;
pub const MARKER_TINY_STRING: u8 = 0x80;
pub const MARKER_STRING_8: u8 = 0xD0;
pub const MARKER_STRING_16: u8 = 0xD1;
pub const MARKER_STRING_32: u8 = 0xD2;
pub const MARKER_TINY_LIST: u8 = 0x90;
pub const MARKER_LIST_8: u8 = 0xD4;
pub const MARKER_LIST_16: u8 = 0xD5;
pub const MARKER_LIST_32: u8 = 0xD6;
pub const MARKER_TINY_MAP: u8 = 0xA0;
pub const MARKER_MAP_8: u8 = 0xD8;
pub const MARKER_MAP_16: u8 = 0xD9;
pub const MARKER_MAP_32: u8 = 0xDA;
pub const MARKER_TINY_STRUCT: u8 = 0xB0;

/// Largest field count a structure header can carry.
pub const MAX_STRUCT_FIELDS: usize = 15;

#[inline]
fn write_failed(err: io::Error) -> Error {
    Error::Encoding(format!("write failed: {}", err))
}

#[inline]
fn read_failed(err: io::Error) -> Error {
    Error::Decoding(format!("message truncated: {}", err))
}

/// Encodes values into a byte sink, always choosing the smallest legal
/// marker. `Bytes` values are refused unless the peer is known to accept
/// them.
pub struct Packer<W> {
    sink: W,
    bytes_supported: bool,
}

impl<W: Write> Packer<W> {
    #[inline]
    pub fn new(sink: W) -> Packer<W> {
        Packer {
            sink,
            bytes_supported: false,
        }
    }

    #[inline]
    pub fn with_bytes_support(mut self, supported: bool) -> Packer<W> {
        self.bytes_supported = supported;
        self
    }

    #[inline]
    pub fn into_inner(self) -> W {
        self.sink
    }

    pub fn pack(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.sink.write_u8(MARKER_NULL).map_err(write_failed),
            Value::Boolean(true) => self.sink.write_u8(MARKER_TRUE).map_err(write_failed),
            Value::Boolean(false) => self.sink.write_u8(MARKER_FALSE).map_err(write_failed),
            Value::Integer(n) => self.pack_integer(*n),
            Value::Float(f) => {
                self.sink.write_u8(MARKER_FLOAT).map_err(write_failed)?;
                self.sink.write_f64::<BigEndian>(*f).map_err(write_failed)
            }
            Value::String(s) => self.pack_string(s),
            Value::Bytes(b) => self.pack_bytes(b),
            Value::List(items) => {
                self.pack_size_header(items.len(), MARKER_TINY_LIST, MARKER_LIST_8)?;
                for item in items {
                    self.pack(item)?;
                }
                Ok(())
            }
            Value::Map(map) => self.pack_map(map),
            Value::Structure(structure) => self.pack_structure(structure),
            other => Err(Error::Encoding(format!(
                "value {:?} must be dehydrated before packing",
                other
            ))),
        }
    }

    pub fn pack_structure(&mut self, structure: &Structure) -> Result<()> {
        if structure.fields.len() > MAX_STRUCT_FIELDS {
            return Err(Error::Encoding(format!(
                "structure has {} fields, at most {} fit in the header",
                structure.fields.len(),
                MAX_STRUCT_FIELDS
            )));
        }
        self.sink
            .write_u8(MARKER_TINY_STRUCT | structure.fields.len() as u8)
            .map_err(write_failed)?;
        self.sink.write_u8(structure.tag).map_err(write_failed)?;
        for field in &structure.fields {
            self.pack(field)?;
        }
        Ok(())
    }

    fn pack_integer(&mut self, n: i64) -> Result<()> {
        if -16 <= n && n <= 127 {
            self.sink.write_u8(n as i8 as u8).map_err(write_failed)
        } else if -128 <= n && n <= -17 {
            self.sink.write_u8(MARKER_INT_8).map_err(write_failed)?;
            self.sink.write_i8(n as i8).map_err(write_failed)
        } else if i64::from(i16::min_value()) <= n && n <= i64::from(i16::max_value()) {
            self.sink.write_u8(MARKER_INT_16).map_err(write_failed)?;
            self.sink.write_i16::<BigEndian>(n as i16).map_err(write_failed)
        } else if i64::from(i32::min_value()) <= n && n <= i64::from(i32::max_value()) {
            self.sink.write_u8(MARKER_INT_32).map_err(write_failed)?;
            self.sink.write_i32::<BigEndian>(n as i32).map_err(write_failed)
        } else {
            self.sink.write_u8(MARKER_INT_64).map_err(write_failed)?;
            self.sink.write_i64::<BigEndian>(n).map_err(write_failed)
        }
    }

    fn pack_string(&mut self, s: &str) -> Result<()> {
        self.pack_size_header(s.len(), MARKER_TINY_STRING, MARKER_STRING_8)?;
        self.sink.write_all(s.as_bytes()).map_err(write_failed)
    }

    fn pack_bytes(&mut self, b: &[u8]) -> Result<()> {
        if !self.bytes_supported {
            return Err(Error::Encoding(
                "byte arrays are not supported by the remote server".to_string(),
            ));
        }
        if b.len() <= 0xFF {
            self.sink.write_u8(MARKER_BYTES_8).map_err(write_failed)?;
            self.sink.write_u8(b.len() as u8).map_err(write_failed)?;
        } else if b.len() <= 0xFFFF {
            self.sink.write_u8(MARKER_BYTES_16).map_err(write_failed)?;
            self.sink
                .write_u16::<BigEndian>(b.len() as u16)
                .map_err(write_failed)?;
        } else if b.len() <= 0xFFFF_FFFF {
            self.sink.write_u8(MARKER_BYTES_32).map_err(write_failed)?;
            self.sink
                .write_u32::<BigEndian>(b.len() as u32)
                .map_err(write_failed)?;
        } else {
            return Err(Error::Encoding(format!("byte array too long ({})", b.len())));
        }
        self.sink.write_all(b).map_err(write_failed)
    }

    fn pack_map(&mut self, map: &ValueMap) -> Result<()> {
        self.pack_size_header(map.len(), MARKER_TINY_MAP, MARKER_MAP_8)?;
        for (key, value) in map {
            self.pack_string(key)?;
            self.pack(value)?;
        }
        Ok(())
    }

    /// Writes a size header for strings, lists and maps: a tiny marker when
    /// the size fits in the low nibble, an 8/16/32 bit form otherwise. The
    /// 8/16/32 markers for each family are consecutive bytes, so the family
    /// is identified by its 8-bit marker.
    fn pack_size_header(&mut self, size: usize, tiny_marker: u8, marker_8: u8) -> Result<()> {
        if size <= 0x0F {
            self.sink
                .write_u8(tiny_marker | size as u8)
                .map_err(write_failed)
        } else if size <= 0xFF {
            self.sink.write_u8(marker_8).map_err(write_failed)?;
            self.sink.write_u8(size as u8).map_err(write_failed)
        } else if size <= 0xFFFF {
            self.sink.write_u8(marker_8 + 1).map_err(write_failed)?;
            self.sink
                .write_u16::<BigEndian>(size as u16)
                .map_err(write_failed)
        } else if size <= 0xFFFF_FFFF {
            self.sink.write_u8(marker_8 + 2).map_err(write_failed)?;
            self.sink
                .write_u32::<BigEndian>(size as u32)
                .map_err(write_failed)
        } else {
            Err(Error::Encoding(format!("collection too large ({})", size)))
        }
    }
}

/// Decodes values from a byte source. Strict: unknown markers and
/// non-string map keys fail.
pub struct Unpacker<R> {
    source: R,
}

impl<R: Read> Unpacker<R> {
    #[inline]
    pub fn new(source: R) -> Unpacker<R> {
        Unpacker { source }
    }

    pub fn unpack(&mut self) -> Result<Value> {
        let marker = self.source.read_u8().map_err(read_failed)?;
        match marker {
            0x00..=0x7F => Ok(Value::Integer(i64::from(marker))),
            0xF0..=0xFF => Ok(Value::Integer(i64::from(marker as i8))),
            MARKER_NULL => Ok(Value::Null),
            MARKER_TRUE => Ok(Value::Boolean(true)),
            MARKER_FALSE => Ok(Value::Boolean(false)),
            MARKER_FLOAT => Ok(Value::Float(
                self.source.read_f64::<BigEndian>().map_err(read_failed)?,
            )),
            MARKER_INT_8 => Ok(Value::Integer(i64::from(
                self.source.read_i8().map_err(read_failed)?,
            ))),
            MARKER_INT_16 => Ok(Value::Integer(i64::from(
                self.source.read_i16::<BigEndian>().map_err(read_failed)?,
            ))),
            MARKER_INT_32 => Ok(Value::Integer(i64::from(
                self.source.read_i32::<BigEndian>().map_err(read_failed)?,
            ))),
            MARKER_INT_64 => Ok(Value::Integer(
                self.source.read_i64::<BigEndian>().map_err(read_failed)?,
            )),
            0x80..=0x8F => self.unpack_string_body((marker & 0x0F) as usize),
            MARKER_STRING_8 => {
                let size = self.source.read_u8().map_err(read_failed)? as usize;
                self.unpack_string_body(size)
            }
            MARKER_STRING_16 => {
                let size = self.source.read_u16::<BigEndian>().map_err(read_failed)? as usize;
                self.unpack_string_body(size)
            }
            MARKER_STRING_32 => {
                let size = self.source.read_u32::<BigEndian>().map_err(read_failed)? as usize;
                self.unpack_string_body(size)
            }
            0x90..=0x9F => self.unpack_list_body((marker & 0x0F) as usize),
            MARKER_LIST_8 => {
                let size = self.source.read_u8().map_err(read_failed)? as usize;
                self.unpack_list_body(size)
            }
            MARKER_LIST_16 => {
                let size = self.source.read_u16::<BigEndian>().map_err(read_failed)? as usize;
                self.unpack_list_body(size)
            }
            MARKER_LIST_32 => {
                let size = self.source.read_u32::<BigEndian>().map_err(read_failed)? as usize;
                self.unpack_list_body(size)
            }
            0xA0..=0xAF => self.unpack_map_body((marker & 0x0F) as usize),
            MARKER_MAP_8 => {
                let size = self.source.read_u8().map_err(read_failed)? as usize;
                self.unpack_map_body(size)
            }
            MARKER_MAP_16 => {
                let size = self.source.read_u16::<BigEndian>().map_err(read_failed)? as usize;
                self.unpack_map_body(size)
            }
            MARKER_MAP_32 => {
                let size = self.source.read_u32::<BigEndian>().map_err(read_failed)? as usize;
                self.unpack_map_body(size)
            }
            MARKER_BYTES_8 => {
                let size = self.source.read_u8().map_err(read_failed)? as usize;
                self.unpack_bytes_body(size)
            }
            MARKER_BYTES_16 => {
                let size = self.source.read_u16::<BigEndian>().map_err(read_failed)? as usize;
                self.unpack_bytes_body(size)
            }
            MARKER_BYTES_32 => {
                let size = self.source.read_u32::<BigEndian>().map_err(read_failed)? as usize;
                self.unpack_bytes_body(size)
            }
            0xB0..=0xBF => {
                let size = (marker & 0x0F) as usize;
                Ok(Value::Structure(self.unpack_structure_body(size)?))
            }
            _ => Err(Error::Decoding(format!(
                "unknown marker byte {:#04X}",
                marker
            ))),
        }
    }

    /// Decodes a top-level structure, the shape of every protocol message.
    pub fn unpack_structure(&mut self) -> Result<Structure> {
        let marker = self.source.read_u8().map_err(read_failed)?;
        if marker & 0xF0 != MARKER_TINY_STRUCT {
            return Err(Error::Decoding(format!(
                "expected a structure, found marker byte {:#04X}",
                marker
            )));
        }
        self.unpack_structure_body((marker & 0x0F) as usize)
    }

    fn unpack_structure_body(&mut self, size: usize) -> Result<Structure> {
        let tag = self.source.read_u8().map_err(read_failed)?;
        let mut fields = Vec::with_capacity(size);
        for _ in 0..size {
            fields.push(self.unpack()?);
        }
        Ok(Structure::new(tag, fields))
    }

    fn unpack_string_body(&mut self, size: usize) -> Result<Value> {
        Ok(Value::String(self.unpack_string_raw(size)?))
    }

    fn unpack_string_raw(&mut self, size: usize) -> Result<String> {
        let mut buffer = vec![0u8; size];
        self.source.read_exact(&mut buffer).map_err(read_failed)?;
        String::from_utf8(buffer)
            .map_err(|_| Error::Decoding("string is not valid UTF-8".to_string()))
    }

    fn unpack_bytes_body(&mut self, size: usize) -> Result<Value> {
        let mut buffer = vec![0u8; size];
        self.source.read_exact(&mut buffer).map_err(read_failed)?;
        Ok(Value::Bytes(buffer))
    }

    fn unpack_list_body(&mut self, size: usize) -> Result<Value> {
        let mut items = Vec::with_capacity(size);
        for _ in 0..size {
            items.push(self.unpack()?);
        }
        Ok(Value::List(items))
    }

    fn unpack_map_body(&mut self, size: usize) -> Result<Value> {
        let mut map = ValueMap::with_capacity(size);
        for _ in 0..size {
            let key = match self.unpack()? {
                Value::String(key) => key,
                other => {
                    return Err(Error::Decoding(format!(
                        "map keys must be strings, found {:?}",
                        other
                    )))
                }
            };
            map.insert(key, self.unpack()?);
        }
        Ok(Value::Map(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(value: &Value) -> Vec<u8> {
        packed_with_bytes(value, false)
    }

    fn packed_with_bytes(value: &Value, bytes_supported: bool) -> Vec<u8> {
        let mut packer = Packer::new(Vec::new()).with_bytes_support(bytes_supported);
        packer.pack(value).unwrap();
        packer.into_inner()
    }

    fn unpacked(buffer: &[u8]) -> Value {
        Unpacker::new(buffer).unpack().unwrap()
    }

    #[test]
    fn test_pack_primitives() {
        assert_eq!(packed(&Value::Null), [0xC0]);
        assert_eq!(packed(&Value::Boolean(false)), [0xC2]);
        assert_eq!(packed(&Value::Boolean(true)), [0xC3]);
        assert_eq!(
            packed(&Value::Float(1.1)),
            [0xC1, 0x3F, 0xF1, 0x99, 0x99, 0x99, 0x99, 0x99, 0x9A]
        );
    }

    #[test]
    fn test_pack_integer_markers() {
        assert_eq!(packed(&Value::Integer(0)), [0x00]);
        assert_eq!(packed(&Value::Integer(42)), [0x2A]);
        assert_eq!(packed(&Value::Integer(127)), [0x7F]);
        assert_eq!(packed(&Value::Integer(-1)), [0xFF]);
        assert_eq!(packed(&Value::Integer(-16)), [0xF0]);
        assert_eq!(packed(&Value::Integer(-17)), [0xC8, 0xEF]);
        assert_eq!(packed(&Value::Integer(-128)), [0xC8, 0x80]);
        assert_eq!(packed(&Value::Integer(128)), [0xC9, 0x00, 0x80]);
        assert_eq!(packed(&Value::Integer(-129)), [0xC9, 0xFF, 0x7F]);
        assert_eq!(packed(&Value::Integer(32767)), [0xC9, 0x7F, 0xFF]);
        assert_eq!(packed(&Value::Integer(32768)), [0xCA, 0x00, 0x00, 0x80, 0x00]);
        assert_eq!(
            packed(&Value::Integer(2147483648)),
            [0xCB, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_marker_minimality_at_boundaries() {
        // (inclusive lower bound of the range, encoded length)
        let boundaries: [(i64, usize); 9] = [
            (i64::min_value(), 9),
            (i64::from(i32::min_value()) - 1, 9),
            (i64::from(i32::min_value()), 5),
            (i64::from(i16::min_value()), 3),
            (-128, 2),
            (-16, 1),
            (127, 1),
            (32767, 3),
            (2147483647, 5),
        ];
        for &(n, expected) in boundaries.iter() {
            assert_eq!(packed(&Value::Integer(n)).len(), expected, "integer {}", n);
            assert_eq!(unpacked(&packed(&Value::Integer(n))), Value::Integer(n));
        }
    }

    #[test]
    fn test_pack_strings() {
        assert_eq!(packed(&Value::from("")), [0x80]);
        assert_eq!(
            packed(&Value::from("hello")),
            [0x85, 0x68, 0x65, 0x6C, 0x6C, 0x6F]
        );
        // 16 characters escalates to the 8-bit form
        let sixteen = "abcdefghijklmnop";
        let bytes = packed(&Value::from(sixteen));
        assert_eq!(&bytes[..2], &[0xD0, 0x10]);
        assert_eq!(&bytes[2..], sixteen.as_bytes());
        // 256 characters escalates to the 16-bit form
        let long = "x".repeat(256);
        let bytes = packed(&Value::from(long.as_str()));
        assert_eq!(&bytes[..3], &[0xD1, 0x01, 0x00]);
    }

    #[test]
    fn test_pack_lists_and_maps() {
        assert_eq!(packed(&Value::List(vec![])), [0x90]);
        assert_eq!(
            packed(&Value::List(vec![
                Value::Integer(1),
                Value::Integer(2),
                Value::Integer(3)
            ])),
            [0x93, 0x01, 0x02, 0x03]
        );
        let mut map = ValueMap::new();
        map.insert("a".to_string(), Value::Integer(1));
        assert_eq!(packed(&Value::Map(map)), [0xA1, 0x81, 0x61, 0x01]);
        let big_list = Value::List(vec![Value::Integer(0); 16]);
        assert_eq!(&packed(&big_list)[..2], &[0xD4, 0x10]);
    }

    #[test]
    fn test_pack_structure() {
        let structure = Structure::new(0x4E, vec![Value::Integer(1), Value::Null]);
        let mut packer = Packer::new(Vec::new());
        packer.pack_structure(&structure).unwrap();
        assert_eq!(packer.into_inner(), [0xB2, 0x4E, 0x01, 0xC0]);
    }

    #[test]
    fn test_structure_field_count_is_bounded() {
        let structure = Structure::new(0x4E, vec![Value::Null; 16]);
        let mut packer = Packer::new(Vec::new());
        assert!(packer.pack_structure(&structure).is_err());
    }

    #[test]
    fn test_pack_bytes_requires_support() {
        let value = Value::Bytes(vec![1, 2, 3]);
        let mut packer = Packer::new(Vec::new());
        match packer.pack(&value) {
            Err(Error::Encoding(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(
            packed_with_bytes(&value, true),
            [0xCC, 0x03, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn test_pack_bytes_length_forms() {
        let medium = Value::Bytes(vec![0; 256]);
        assert_eq!(&packed_with_bytes(&medium, true)[..3], &[0xCD, 0x01, 0x00]);
        let large = Value::Bytes(vec![0; 65536]);
        assert_eq!(
            &packed_with_bytes(&large, true)[..5],
            &[0xCE, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_random_integers_round_trip_minimally() {
        use rand::Rng;

        fn shortest_len(n: i64) -> usize {
            if -16 <= n && n <= 127 {
                1
            } else if -128 <= n && n <= -17 {
                2
            } else if i64::from(i16::min_value()) <= n && n <= i64::from(i16::max_value()) {
                3
            } else if i64::from(i32::min_value()) <= n && n <= i64::from(i32::max_value()) {
                5
            } else {
                9
            }
        }

        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            // bit-shifted so every marker range gets hit
            let n: i64 = rng.gen::<i64>() >> rng.gen_range(0..64);
            let bytes = packed(&Value::Integer(n));
            assert_eq!(bytes.len(), shortest_len(n), "integer {}", n);
            assert_eq!(unpacked(&bytes), Value::Integer(n));
        }
    }

    #[test]
    fn test_round_trip_nested() {
        let mut properties = ValueMap::new();
        properties.insert("name".to_string(), Value::from("fast"));
        properties.insert("score".to_string(), Value::Float(0.25));
        let value = Value::List(vec![
            Value::Null,
            Value::Boolean(true),
            Value::Integer(-12345),
            Value::from("text"),
            Value::Map(properties),
            Value::List(vec![Value::Integer(1), Value::from("two")]),
            Value::Structure(Structure::new(0x44, vec![Value::Integer(18250)])),
        ]);
        assert_eq!(unpacked(&packed(&value)), value);
    }

    #[test]
    fn test_nan_survives_as_nan() {
        let bytes = packed(&Value::Float(std::f64::NAN));
        match unpacked(&bytes) {
            Value::Float(f) => assert!(f.is_nan()),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_unknown_marker_fails() {
        for marker in [0xC4u8, 0xC7, 0xCF, 0xD3, 0xD7, 0xDB, 0xDF].iter() {
            match Unpacker::new(&[*marker][..]).unpack() {
                Err(Error::Decoding(_)) => (),
                other => panic!("marker {:#04X}: unexpected result {:?}", marker, other),
            }
        }
    }

    #[test]
    fn test_non_string_map_key_fails() {
        // {1: 1} is not a legal map
        match Unpacker::new(&[0xA1, 0x01, 0x01][..]).unpack() {
            Err(Error::Decoding(message)) => assert!(message.contains("map keys")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_truncated_input_fails() {
        match Unpacker::new(&[0xC9, 0x01][..]).unpack() {
            Err(Error::Decoding(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_hydrated_values_are_refused() {
        let value = Value::Date(crate::value::Date { days: 1 });
        let mut packer = Packer::new(Vec::new());
        assert!(packer.pack(&value).is_err());
    }
}
