//! Property test: encode ∘ decode is the identity on well-formed
//! envelopes, including unknown payload variants.

use proptest::prelude::*;

use pinch::proto::{self, Envelope, Payload};

fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop_oneof![
        (
            proptest::collection::vec(any::<u8>(), 24),
            proptest::collection::vec(any::<u8>(), 0..512),
            proptest::collection::vec(any::<u8>(), 32),
        )
            .prop_map(|(nonce, ciphertext, sender_public_key)| {
                Payload::Encrypted(proto::EncryptedPayload {
                    nonce,
                    ciphertext,
                    sender_public_key,
                })
            }),
        any::<i64>().prop_map(|sent_at_ms| Payload::Heartbeat(proto::Heartbeat { sent_at_ms })),
        (any::<u64>()).prop_map(|pending_count| {
            Payload::QueueStatus(proto::QueueStatus { pending_count })
        }),
        ("[ -~]{0,64}", "[ -~]{0,64}").prop_map(|(recipient_address, reason)| {
            Payload::QueueFull(proto::QueueFull {
                recipient_address,
                reason,
            })
        }),
        (
            proptest::collection::vec(any::<u8>(), 16),
            proptest::collection::vec(any::<u8>(), 64),
            any::<i64>(),
            "[a-z_]{0,20}",
            any::<bool>(),
        )
            .prop_map(|(message_id, signature, timestamp, state, was_stored)| {
                Payload::DeliveryConfirm(proto::DeliveryConfirm {
                    message_id,
                    signature,
                    timestamp,
                    state,
                    was_stored,
                })
            }),
        // A payload tag from a future protocol revision.
        (25u32..1000, proptest::collection::vec(any::<u8>(), 0..256))
            .prop_map(|(tag, data)| Payload::Unknown { tag, data }),
    ]
}

fn envelope_strategy() -> impl Strategy<Value = Envelope> {
    (
        any::<u32>(),
        "[ -~]{0,80}",
        "[ -~]{0,80}",
        0i32..64,
        proptest::collection::vec(any::<u8>(), 0..32),
        any::<i64>(),
        proptest::option::of(payload_strategy()),
    )
        .prop_map(
            |(version, from_address, to_address, kind, message_id, timestamp, payload)| Envelope {
                version,
                from_address,
                to_address,
                r#type: kind,
                message_id,
                timestamp,
                payload,
            },
        )
}

proptest! {
    #[test]
    fn encode_decode_is_identity(envelope in envelope_strategy()) {
        let bytes = proto::encode(&envelope);
        let decoded = proto::decode(&bytes).unwrap();
        prop_assert_eq!(&decoded, &envelope);
        // Stability: a second round trip is byte-identical.
        prop_assert_eq!(proto::encode(&decoded), bytes);
    }
}
