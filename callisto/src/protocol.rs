//! Provides the binary records which peers exchange over the wire.
//!
//! The protocol is deliberately tiny: a node asks a peer for a single value by sending a
//! [GetRequest](GetRequest) and receives a single reply frame in return. All frames are
//! length-delimited binary records so that independent implementations interoperate:
//!
//! * A request frame starts with the tag byte `G`, followed by the group name and the key.
//! * A successful reply starts with the tag byte `V`, followed by the raw value.
//! * A failure reply starts with the tag byte `E`, followed by an error message.
//!
//! Each field is encoded as a big-endian **u32** length prefix followed by that many bytes.
//! Group names, keys and error messages are UTF-8, values are arbitrary bytes.
//!
//! As frames arrive via a network socket, a parser has to deal with partial data: all parse
//! functions return an empty optional if the buffer merely holds an incomplete frame (read on)
//! and an **Err** if it holds malformed data (close the connection).
//!
//! # Examples
//!
//! Parsing a partial request:
//! ```
//! # use bytes::{BufMut, BytesMut};
//! # use callisto::protocol::GetRequest;
//! let mut buffer = BytesMut::new();
//! buffer.put_u8(b'G');
//! buffer.put_u32(6);
//! buffer.put_slice(b"sco");
//!
//! assert_eq!(GetRequest::parse(&buffer).unwrap().is_none(), true);
//! ```
//!
//! Parsing a complete request:
//! ```
//! # use bytes::BytesMut;
//! # use callisto::protocol::GetRequest;
//! let mut buffer = BytesMut::new();
//! GetRequest::new("scores", "Tom").encode(&mut buffer);
//!
//! let (request, frame_len) = GetRequest::parse(&buffer).unwrap().unwrap();
//! assert_eq!(request.group, "scores");
//! assert_eq!(request.key, "Tom");
//! assert_eq!(frame_len, buffer.len());
//! ```
use anyhow::{anyhow, Context};
use bytes::{BufMut, Bytes, BytesMut};

/// Contains the maximal length (in bytes) permitted for group names, keys and error messages.
const MAX_STRING_LENGTH: usize = 64 * 1024;

/// Contains the maximal length (in bytes) permitted for a transferred value.
const MAX_VALUE_LENGTH: usize = 64 * 1024 * 1024;

/// Reads a single length-delimited field starting at the given offset.
///
/// Returns the field along with the offset of the first byte after it, or an empty optional if
/// the buffer doesn't contain the complete field yet.
fn read_field(
    buffer: &BytesMut,
    offset: usize,
    max_length: usize,
) -> anyhow::Result<Option<(&[u8], usize)>> {
    if buffer.len() < offset + 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ]) as usize;
    if length > max_length {
        return Err(anyhow!(
            "A field of {} bytes exceeds the permitted maximum of {} bytes!",
            length,
            max_length
        ));
    }

    let start = offset + 4;
    if buffer.len() < start + length {
        return Ok(None);
    }

    Ok(Some((&buffer[start..start + length], start + length)))
}

/// Appends a length-delimited field to the given buffer.
fn write_field(data: &[u8], buffer: &mut BytesMut) {
    buffer.put_u32(data.len() as u32);
    buffer.put_slice(data);
}

/// Asks a peer for the value of **key** within the group named **group**.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    /// Contains the name of the group to query.
    pub group: String,

    /// Contains the key to look up.
    pub key: String,
}

impl GetRequest {
    /// Marks a frame as request.
    const TAG: u8 = b'G';

    /// Creates a new request for the given group and key.
    pub fn new(group: &str, key: &str) -> Self {
        GetRequest {
            group: group.to_owned(),
            key: key.to_owned(),
        }
    }

    /// Appends the encoded request frame to the given buffer.
    pub fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(GetRequest::TAG);
        write_field(self.group.as_bytes(), buffer);
        write_field(self.key.as_bytes(), buffer);
    }

    /// Tries to parse a request frame from the given buffer.
    ///
    /// Returns the request along with the total length of its frame (so that the caller can
    /// drop the consumed bytes), an empty optional if the frame is incomplete, or an **Err**
    /// if the buffer contains malformed data.
    pub fn parse(buffer: &BytesMut) -> anyhow::Result<Option<(GetRequest, usize)>> {
        if buffer.is_empty() {
            return Ok(None);
        }
        if buffer[0] != GetRequest::TAG {
            return Err(anyhow!(
                "Expected a request frame but found the tag {:#04x}!",
                buffer[0]
            ));
        }

        let (group, offset) = match read_field(buffer, 1, MAX_STRING_LENGTH)? {
            Some(field) => field,
            None => return Ok(None),
        };
        let (key, end) = match read_field(buffer, offset, MAX_STRING_LENGTH)? {
            Some(field) => field,
            None => return Ok(None),
        };

        let group = std::str::from_utf8(group)
            .context("The group name within a request was not valid UTF-8!")?
            .to_owned();
        let key = std::str::from_utf8(key)
            .context("The key within a request was not valid UTF-8!")?
            .to_owned();

        Ok(Some((GetRequest { group, key }, end)))
    }
}

/// Carries the value served by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    /// Contains the raw bytes of the requested value.
    pub value: Bytes,
}

impl GetResponse {
    /// Marks a frame as successful reply.
    const VALUE_TAG: u8 = b'V';

    /// Marks a frame as failure reply.
    const ERROR_TAG: u8 = b'E';

    /// Creates a new response carrying the given value.
    pub fn new(value: Bytes) -> Self {
        GetResponse { value }
    }

    /// Appends the encoded success frame to the given buffer.
    pub fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(GetResponse::VALUE_TAG);
        write_field(&self.value, buffer);
    }

    /// Appends an encoded failure frame carrying the given message to the given buffer.
    pub fn encode_error(message: &str, buffer: &mut BytesMut) {
        buffer.put_u8(GetResponse::ERROR_TAG);
        write_field(message.as_bytes(), buffer);
    }

    /// Tries to parse a reply frame from the given buffer.
    ///
    /// Returns the response for a success frame and an empty optional if the frame is
    /// incomplete. A failure frame reported by the peer surfaces as an **Err**, just like
    /// malformed data - in both cases the caller abandons the exchange.
    pub fn parse(buffer: &BytesMut) -> anyhow::Result<Option<GetResponse>> {
        if buffer.is_empty() {
            return Ok(None);
        }

        match buffer[0] {
            GetResponse::VALUE_TAG => match read_field(buffer, 1, MAX_VALUE_LENGTH)? {
                Some((value, _)) => Ok(Some(GetResponse {
                    value: Bytes::copy_from_slice(value),
                })),
                None => Ok(None),
            },
            GetResponse::ERROR_TAG => match read_field(buffer, 1, MAX_STRING_LENGTH)? {
                Some((message, _)) => Err(anyhow!(
                    "The peer reported an error: {}",
                    String::from_utf8_lossy(message)
                )),
                None => Ok(None),
            },
            tag => Err(anyhow!(
                "Expected a reply frame but found the tag {:#04x}!",
                tag
            )),
        }
    }
}
