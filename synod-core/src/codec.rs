//! Postcard codec for datagram payloads
//!
//! Each datagram carries exactly one serialized value, so unlike a stream
//! codec there is no length prefix: the datagram boundary is the frame.

use std::io;
use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// Largest payload accepted for a single datagram.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// A codec that maps one datagram to one postcard-encoded value.
///
/// `decode` consumes the whole buffer; a buffer that does not hold exactly one
/// well-formed value is an error rather than a partial frame.
#[derive(Debug)]
pub struct DatagramCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DatagramCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Default for DatagramCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DatagramCodec<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Decoder for DatagramCodec<T>
where
    T: for<'de> Deserialize<'de>,
{
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        let (item, rest) = postcard::take_from_bytes(&datagram).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed datagram of {} bytes: {e}", datagram.len()),
            )
        })?;
        if !rest.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes after payload", rest.len()),
            ));
        }
        Ok(Some(item))
    }
}

impl<T> Encoder<T> for DatagramCodec<T>
where
    T: Serialize,
{
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = postcard::to_stdvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "payload of {} bytes exceeds datagram limit of {MAX_DATAGRAM}",
                    bytes.len()
                ),
            ));
        }
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// Encode one value into a standalone datagram.
pub fn encode_datagram<T: Serialize>(item: T) -> Result<BytesMut, Report<CodecError>> {
    let mut buf = BytesMut::new();
    DatagramCodec::<T>::new()
        .encode(item, &mut buf)
        .change_context(CodecError)?;
    Ok(buf)
}

/// Decode a single received datagram.
pub fn decode_datagram<T>(datagram: &[u8]) -> Result<T, Report<CodecError>>
where
    T: for<'de> Deserialize<'de>,
{
    let mut buf = BytesMut::from(datagram);
    DatagramCodec::<T>::new()
        .decode(&mut buf)
        .change_context(CodecError)?
        .ok_or_else(|| Report::new(CodecError).attach("empty datagram"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Envelope, NodeId, ProposalNumber, Slot};
    use crate::message::PaxosMessage;

    type Msg = PaxosMessage<Vec<u8>, String>;

    #[test]
    fn datagram_carries_one_envelope() {
        let envelope = Envelope {
            from: NodeId(4),
            body: Msg::Prepare {
                number: ProposalNumber(9),
                slot: Slot(2),
            },
        };
        let buf = encode_datagram(envelope.clone()).unwrap();
        let decoded: Envelope<Msg> = decode_datagram(&buf).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        let buf = encode_datagram(Envelope {
            from: NodeId(1),
            body: Msg::Commit {
                slot: Slot(0),
                value: vec![1, 2, 3, 4],
            },
        })
        .unwrap();
        let result: Result<Envelope<Msg>, _> = decode_datagram(&buf[..buf.len() - 2]);
        assert!(result.is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut buf = encode_datagram(Envelope {
            from: NodeId(1),
            body: Msg::Prepare {
                number: ProposalNumber(1),
                slot: Slot(0),
            },
        })
        .unwrap();
        buf.put_slice(&[0xff, 0xff]);
        let result: Result<Envelope<Msg>, _> = decode_datagram(&buf);
        assert!(result.is_err());
    }

    #[test]
    fn oversized_payload_is_rejected_at_encode() {
        let body = Msg::Commit {
            slot: Slot(0),
            value: vec![0; MAX_DATAGRAM + 1],
        };
        assert!(encode_datagram(Envelope { from: NodeId(1), body }).is_err());
    }

    #[test]
    fn empty_buffer_is_not_a_frame() {
        let mut buf = BytesMut::new();
        let item = DatagramCodec::<Envelope<Msg>>::new().decode(&mut buf).unwrap();
        assert!(item.is_none());
        assert!(decode_datagram::<Envelope<Msg>>(&[]).is_err());
    }
}
