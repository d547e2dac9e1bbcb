//! Version negotiation, performed immediately after the TCP (and TLS)
//! connect: a four byte preamble, four big-endian version proposals, and a
//! four byte reply naming the agreed version.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Error, Result};

pub const MAGIC_PREAMBLE: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Protocol versions known to this driver, most preferred first. Unused
/// proposal slots are zero filled.
pub const SUPPORTED_VERSIONS: [u32; 4] = [3, 2, 1, 0];

/// Runs the handshake over a fresh stream and returns the agreed version.
pub fn perform<S: Read + Write>(stream: &mut S) -> Result<u32> {
    stream.write_all(&MAGIC_PREAMBLE)?;
    for version in SUPPORTED_VERSIONS.iter() {
        stream.write_u32::<BigEndian>(*version)?;
    }
    stream.flush()?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .map_err(|err| Error::ServiceUnavailable(format!("connection closed during handshake: {}", err)))?;

    // A letter where a version should be means the peer is speaking some
    // text protocol at us, in practice an HTTP server port.
    if reply[0].is_ascii_alphabetic() {
        return Err(Error::ServiceUnavailable(
            "remote endpoint appears to speak HTTP, not Bolt; \
             check that the correct port is being used"
                .to_string(),
        ));
    }

    let agreed = u32::from_be_bytes(reply);
    if agreed == 0 {
        return Err(Error::Handshake(
            "the server does not support any protocol version offered by this driver".to_string(),
        ));
    }
    if !SUPPORTED_VERSIONS.contains(&agreed) {
        return Err(Error::Handshake(format!(
            "the server agreed to unknown protocol version {}",
            agreed
        )));
    }
    Ok(agreed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// One-shot stream: canned reply on the read side, capture on the
    /// write side.
    struct ScriptedStream {
        reply: io::Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(reply: &[u8]) -> ScriptedStream {
            ScriptedStream {
                reply: io::Cursor::new(reply.to_vec()),
                written: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reply.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_proposal_bytes() {
        let mut stream = ScriptedStream::new(&[0, 0, 0, 3]);
        perform(&mut stream).unwrap();
        assert_eq!(
            stream.written,
            [
                0x60, 0x60, 0xB0, 0x17, // preamble
                0x00, 0x00, 0x00, 0x03, // most preferred first
                0x00, 0x00, 0x00, 0x02, //
                0x00, 0x00, 0x00, 0x01, //
                0x00, 0x00, 0x00, 0x00, // unused slot
            ]
        );
    }

    #[test]
    fn test_agrees_on_offered_version() {
        for version in 1u32..=3 {
            let mut stream = ScriptedStream::new(&version.to_be_bytes());
            assert_eq!(perform(&mut stream).unwrap(), version);
        }
    }

    #[test]
    fn test_zero_reply_means_no_common_version() {
        let mut stream = ScriptedStream::new(&[0, 0, 0, 0]);
        match perform(&mut stream) {
            Err(Error::Handshake(message)) => assert!(message.contains("version")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut stream = ScriptedStream::new(&[0, 0, 0, 4]);
        assert!(matches!(perform(&mut stream), Err(Error::Handshake(_))));
    }

    #[test]
    fn test_http_reply_is_named_in_the_error() {
        let mut stream = ScriptedStream::new(b"HTTP");
        match perform(&mut stream) {
            Err(Error::ServiceUnavailable(message)) => assert!(message.contains("HTTP")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_peer_close_during_handshake() {
        let mut stream = ScriptedStream::new(&[0, 0]);
        assert!(matches!(
            perform(&mut stream),
            Err(Error::ServiceUnavailable(_))
        ));
    }
}
