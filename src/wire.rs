// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin wrappers around `hickory-proto`'s wire (de)serialization so every
//! transport and writer goes through one place.

use hickory_proto::op::Message;
use hickory_proto::ProtoError;

pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    msg.to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<Message, ProtoError> {
    Message::from_vec(bytes)
}

/// DoQ / TCP / gRPC length-prefix framing: a 2-byte big-endian length
/// followed by exactly that many bytes. `add_prefix` on an empty message
/// produces `{0x00, 0x00}`.
pub fn add_prefix(payload: &[u8]) -> Vec<u8> {
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_prefix_on_empty_message_is_two_zero_bytes() {
        assert_eq!(add_prefix(&[]), vec![0x00, 0x00]);
    }

    #[test]
    fn add_prefix_round_trips_length() {
        let payload = vec![1u8, 2, 3, 4, 5];
        let framed = add_prefix(&payload);
        let len = u16::from_be_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(len, payload.len());
        assert_eq!(&framed[2..], &payload[..]);
    }
}
