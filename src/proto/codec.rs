//! Protobuf wire codec for [`Envelope`].
//!
//! The envelope is encoded by hand (the payload sub-messages derive
//! `prost::Message`) so that payload field numbers this build does not
//! recognize are captured as [`Payload::Unknown`] and re-emitted verbatim
//! on encode. Decoding checks wire well-formedness only; semantic
//! validation belongs to the relay and client layers.

use bytes::Buf;
use prost::encoding::{self, DecodeContext, WireType};
use prost::DecodeError;

use super::{Envelope, Payload};

/// Lowest field number reserved for the payload oneof. Everything below is
/// an envelope scalar; everything at or above is a payload variant.
const PAYLOAD_TAG_FIRST: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] DecodeError),
}

/// Serialize an envelope to wire bytes.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(envelope));
    if envelope.version != 0 {
        encoding::uint32::encode(1, &envelope.version, &mut buf);
    }
    if !envelope.from_address.is_empty() {
        encoding::string::encode(2, &envelope.from_address, &mut buf);
    }
    if !envelope.to_address.is_empty() {
        encoding::string::encode(3, &envelope.to_address, &mut buf);
    }
    if envelope.r#type != 0 {
        encoding::int32::encode(4, &envelope.r#type, &mut buf);
    }
    if !envelope.message_id.is_empty() {
        encoding::bytes::encode(5, &envelope.message_id, &mut buf);
    }
    if envelope.timestamp != 0 {
        encoding::int64::encode(6, &envelope.timestamp, &mut buf);
    }
    if let Some(payload) = &envelope.payload {
        payload.encode_into(&mut buf);
    }
    buf
}

/// Exact encoded size of an envelope, for buffer pre-sizing.
pub fn encoded_len(envelope: &Envelope) -> usize {
    let mut len = 0;
    if envelope.version != 0 {
        len += encoding::uint32::encoded_len(1, &envelope.version);
    }
    if !envelope.from_address.is_empty() {
        len += encoding::string::encoded_len(2, &envelope.from_address);
    }
    if !envelope.to_address.is_empty() {
        len += encoding::string::encoded_len(3, &envelope.to_address);
    }
    if envelope.r#type != 0 {
        len += encoding::int32::encoded_len(4, &envelope.r#type);
    }
    if !envelope.message_id.is_empty() {
        len += encoding::bytes::encoded_len(5, &envelope.message_id);
    }
    if envelope.timestamp != 0 {
        len += encoding::int64::encoded_len(6, &envelope.timestamp);
    }
    if let Some(payload) = &envelope.payload {
        len += payload.encoded_len();
    }
    len
}

/// Parse wire bytes into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtoError> {
    let mut buf = bytes;
    let mut env = Envelope::default();
    while buf.has_remaining() {
        let (tag, wire_type) = encoding::decode_key(&mut buf)?;
        match tag {
            1 => encoding::uint32::merge(wire_type, &mut env.version, &mut buf, ctx())?,
            2 => encoding::string::merge(wire_type, &mut env.from_address, &mut buf, ctx())?,
            3 => encoding::string::merge(wire_type, &mut env.to_address, &mut buf, ctx())?,
            4 => encoding::int32::merge(wire_type, &mut env.r#type, &mut buf, ctx())?,
            5 => encoding::bytes::merge(wire_type, &mut env.message_id, &mut buf, ctx())?,
            6 => encoding::int64::merge(wire_type, &mut env.timestamp, &mut buf, ctx())?,
            t if t >= PAYLOAD_TAG_FIRST => {
                Payload::merge_into(&mut env.payload, t, wire_type, &mut buf)?
            }
            _ => encoding::skip_field(wire_type, tag, &mut buf, ctx())?,
        }
    }
    Ok(env)
}

fn ctx() -> DecodeContext {
    DecodeContext::default()
}

// ─── Payload dispatch ─────────────────────────────────────────────────────────

macro_rules! payload_variants {
    ($(($variant:ident, $msg:ty, $tag:literal)),+ $(,)?) => {
        impl Payload {
            /// Field number this payload occupies in the envelope oneof.
            pub fn wire_tag(&self) -> u32 {
                match self {
                    $(Payload::$variant(_) => $tag,)+
                    Payload::Unknown { tag, .. } => *tag,
                }
            }

            fn encode_into(&self, buf: &mut Vec<u8>) {
                match self {
                    $(Payload::$variant(m) => encoding::message::encode($tag, m, buf),)+
                    Payload::Unknown { tag, data } => {
                        encoding::encode_key(*tag, WireType::LengthDelimited, buf);
                        encoding::encode_varint(data.len() as u64, buf);
                        buf.extend_from_slice(data);
                    }
                }
            }

            fn encoded_len(&self) -> usize {
                match self {
                    $(Payload::$variant(m) => encoding::message::encoded_len($tag, m),)+
                    Payload::Unknown { tag, data } => {
                        encoding::key_len(*tag)
                            + encoding::encoded_len_varint(data.len() as u64)
                            + data.len()
                    }
                }
            }

            fn merge_into(
                slot: &mut Option<Payload>,
                tag: u32,
                wire_type: WireType,
                buf: &mut &[u8],
            ) -> Result<(), DecodeError> {
                match tag {
                    $($tag => {
                        let mut m = <$msg>::default();
                        encoding::message::merge(wire_type, &mut m, buf, ctx())?;
                        *slot = Some(Payload::$variant(m));
                        Ok(())
                    })+
                    _ if wire_type == WireType::LengthDelimited => {
                        // A payload variant from a newer protocol revision:
                        // keep the raw bytes so the envelope round-trips.
                        let mut data = Vec::new();
                        encoding::bytes::merge(wire_type, &mut data, buf, ctx())?;
                        *slot = Some(Payload::Unknown { tag, data });
                        Ok(())
                    }
                    _ => encoding::skip_field(wire_type, tag, buf, ctx()),
                }
            }
        }
    };
}

payload_variants!(
    (Encrypted, super::EncryptedPayload, 10),
    (Handshake, super::Handshake, 11),
    (Heartbeat, super::Heartbeat, 12),
    (AuthChallenge, super::AuthChallenge, 13),
    (AuthResponse, super::AuthResponse, 14),
    (AuthResult, super::AuthResult, 15),
    (ConnectionRequest, super::ConnectionRequest, 16),
    (ConnectionResponse, super::ConnectionResponse, 17),
    (ConnectionRevoke, super::ConnectionRevoke, 18),
    (BlockNotification, super::BlockNotification, 19),
    (UnblockNotification, super::UnblockNotification, 20),
    (DeliveryConfirm, super::DeliveryConfirm, 21),
    (QueueStatus, super::QueueStatus, 22),
    (QueueFull, super::QueueFull, 23),
    (RateLimited, super::RateLimited, 24),
);

// ─── Tests ────────────────────────────────────────────────────────────────────
