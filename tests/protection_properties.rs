pub mod common;

use proptest::prelude::*;
use secchan::{BufferDescriptor, BufferKind, ContextFlags, ErrorKind, QoP, SecurityBuffer};

use crate::common::establish;

fn flags() -> ContextFlags {
    ContextFlags::MUTUAL_AUTH | ContextFlags::CONFIDENTIALITY
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_payload_survives_a_sealed_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let (mut client, mut server) = establish(flags());

        let mut message = BufferDescriptor::data(payload.clone());
        client.context.encrypt_message(&mut message, QoP::Confidential).unwrap();
        let qop = server.context.decrypt_message(&mut message).unwrap();

        prop_assert_eq!(qop, QoP::Confidential);
        prop_assert_eq!(message.find(BufferKind::Data).unwrap().as_slice(), &payload[..]);
    }

    #[test]
    fn any_flipped_wire_bit_is_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..256),
        position in any::<prop::sample::Index>(),
        bit in 0..8u32,
    ) {
        let (mut client, mut server) = establish(flags());

        let mut message = BufferDescriptor::data(payload);
        client.context.encrypt_message(&mut message, QoP::Confidential).unwrap();

        let mut data = message.find(BufferKind::Data).unwrap().as_slice().to_vec();
        let mut token = message.find(BufferKind::Token).unwrap().as_slice().to_vec();
        let index = position.index(data.len() + token.len());
        if index < data.len() {
            data[index] ^= 1 << bit;
        } else {
            token[index - data.len()] ^= 1 << bit;
        }

        let mut received = BufferDescriptor::data(data);
        received.push(SecurityBuffer::token(token));
        let err = server.context.decrypt_message(&mut received).unwrap_err();

        // Flipping a sequence-number byte reads as reordering; everything
        // else is plain corruption.
        prop_assert!(matches!(err.kind, ErrorKind::MessageAltered | ErrorKind::OutOfSequence));
        prop_assert_eq!(server.context.recv_sequence_number(), 0);
    }
}
