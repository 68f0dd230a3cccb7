use super::messages::{read_message, read_trailer, write_message, write_trailer, HandshakeMessage, Trailer, MSG_HELLO};
use super::*;
use crate::mechanism::{MechanismProvider, NegotiateParams, ProtectionOp, Role, UnprotectionOp};
use crate::{BufferDescriptor, ContextFlags, Direction, ErrorKind, Identity, QoP, Secret, StepOutcome};

fn identity(principal: &str, password: &str) -> Identity {
    Identity::Password {
        principal: principal.to_string(),
        password: Secret::from(password.to_string()),
    }
}

fn context(principal: &str, password: &str, direction: Direction) -> Box<dyn MechanismContext> {
    let provider = PskProvider;
    let credential = provider.acquire_credential(direction, &identity(principal, password)).unwrap();

    provider.new_context(credential.as_ref(), direction).unwrap()
}

fn initiator_params() -> NegotiateParams<'static> {
    NegotiateParams {
        target_name: Some("service/acceptor.example.com"),
        requested_flags: ContextFlags::MUTUAL_AUTH | ContextFlags::CONFIDENTIALITY,
    }
}

fn acceptor_params() -> NegotiateParams<'static> {
    NegotiateParams {
        target_name: None,
        requested_flags: ContextFlags::empty(),
    }
}

fn handshake(password: &str) -> (Box<dyn MechanismContext>, Box<dyn MechanismContext>) {
    let mut initiator = context("client", password, Direction::Outbound);
    let mut acceptor = context("server", password, Direction::Inbound);

    let mut t1 = BufferDescriptor::token(Vec::new());
    let outcome = initiator
        .negotiate_step(Role::Initiator, &initiator_params(), None, &mut t1)
        .unwrap();
    assert_eq!(outcome, StepOutcome::Continue);

    let mut t2 = BufferDescriptor::token(Vec::new());
    let outcome = acceptor
        .negotiate_step(Role::Acceptor, &acceptor_params(), Some(&t1), &mut t2)
        .unwrap();
    assert_eq!(outcome, StepOutcome::Complete);

    let mut t3 = BufferDescriptor::token(Vec::new());
    let outcome = initiator
        .negotiate_step(Role::Initiator, &initiator_params(), Some(&t2), &mut t3)
        .unwrap();
    assert_eq!(outcome, StepOutcome::CompleteAndFinish);

    (initiator, acceptor)
}

#[test]
fn handshake_message_roundtrip() {
    let message = HandshakeMessage {
        msg_type: MSG_HELLO,
        flags: 0x2f,
        principal: "client@example.com".to_string(),
        nonce: [0xaa; NONCE_SIZE],
        proof: [0x55; messages::PROOF_SIZE],
    };

    let token = write_message(&message).unwrap();
    assert_eq!(read_message(&token).unwrap(), message);
}

#[test]
fn read_message_reports_exact_missing_bytes() {
    let token = write_message(&HandshakeMessage {
        msg_type: MSG_HELLO,
        flags: 0,
        principal: "client".to_string(),
        nonce: [0; NONCE_SIZE],
        proof: [0; messages::PROOF_SIZE],
    })
    .unwrap();

    let err = read_message(&token[..2]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IncompleteToken { bytes_needed: 2 });

    let err = read_message(&token[..10]).unwrap_err();
    assert_eq!(
        err.kind,
        ErrorKind::IncompleteToken {
            bytes_needed: token.len() - 10
        }
    );
}

#[test]
fn oversized_length_prefix_is_rejected_up_front() {
    // A corrupt prefix must never turn into a huge buffering demand.
    let err = read_message(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);

    let err = read_message(&(MAX_TOKEN_LEN + 1).to_le_bytes()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);

    let mut acceptor = context("server", "password", Direction::Inbound);
    let input = BufferDescriptor::token(vec![0xff; 4]);
    let mut output = BufferDescriptor::token(Vec::new());
    let err = acceptor
        .negotiate_step(Role::Acceptor, &acceptor_params(), Some(&input), &mut output)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
}

#[test]
fn read_message_rejects_trailing_bytes() {
    let mut token = write_message(&HandshakeMessage {
        msg_type: MSG_HELLO,
        flags: 0,
        principal: "client".to_string(),
        nonce: [0; NONCE_SIZE],
        proof: [0; messages::PROOF_SIZE],
    })
    .unwrap();
    token.push(0);

    let err = read_message(&token).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
}

#[test]
fn trailer_roundtrip_and_size_check() {
    let trailer = Trailer {
        qop: QoP::Confidential as u8,
        sequence_number: 42,
        mac: [7; MAC_SIZE],
    };

    let buf = write_trailer(&trailer).unwrap();
    assert_eq!(buf.len(), TRAILER_SIZE);
    assert_eq!(read_trailer(&buf).unwrap(), trailer);

    let err = read_trailer(&buf[..TRAILER_SIZE - 1]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::MessageAltered);

    let mut bad_version = buf;
    bad_version[0] ^= 0xff;
    let err = read_trailer(&bad_version).unwrap_err();
    assert_eq!(err.kind, ErrorKind::MessageAltered);
}

#[test]
fn keystream_is_symmetric() {
    let key = [3; 32];
    let plaintext = b"a message that spans more than one keystream block, for sure".to_vec();

    let mut message = BufferDescriptor::data(plaintext.clone());
    apply_keystream(&key, 7, &mut message);
    assert_ne!(message.find(BufferKind::Data).unwrap().as_slice(), &plaintext[..]);

    apply_keystream(&key, 7, &mut message);
    assert_eq!(message.find(BufferKind::Data).unwrap().as_slice(), &plaintext[..]);
}

#[test]
fn ambient_identity_is_rejected() {
    let provider = PskProvider;
    let err = provider
        .acquire_credential(Direction::Outbound, &Identity::Ambient)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::IdentityRejected);
}

#[test]
fn wrong_shared_key_is_rejected_by_the_acceptor() {
    let mut initiator = context("client", "password one", Direction::Outbound);
    let mut acceptor = context("server", "password two", Direction::Inbound);

    let mut t1 = BufferDescriptor::token(Vec::new());
    initiator
        .negotiate_step(Role::Initiator, &initiator_params(), None, &mut t1)
        .unwrap();

    let mut t2 = BufferDescriptor::token(Vec::new());
    let err = acceptor
        .negotiate_step(Role::Acceptor, &acceptor_params(), Some(&t1), &mut t2)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::IdentityRejected);
}

#[test]
fn first_initiator_step_rejects_an_input_token() {
    let mut initiator = context("client", "password", Direction::Outbound);

    let input = BufferDescriptor::token(vec![1, 2, 3]);
    let mut output = BufferDescriptor::token(Vec::new());
    let err = initiator
        .negotiate_step(Role::Initiator, &initiator_params(), Some(&input), &mut output)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
}

#[test]
fn replayed_handshake_token_is_rejected() {
    let mut initiator = context("client", "password", Direction::Outbound);
    let mut acceptor = context("server", "password", Direction::Inbound);

    let mut t1 = BufferDescriptor::token(Vec::new());
    initiator
        .negotiate_step(Role::Initiator, &initiator_params(), None, &mut t1)
        .unwrap();

    let mut t2 = BufferDescriptor::token(Vec::new());
    acceptor
        .negotiate_step(Role::Acceptor, &acceptor_params(), Some(&t1), &mut t2)
        .unwrap();

    // Feeding T1 again: the acceptor's state machine is already past it.
    let mut t2_again = BufferDescriptor::token(Vec::new());
    let err = acceptor
        .negotiate_step(Role::Acceptor, &acceptor_params(), Some(&t1), &mut t2_again)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
}

#[test]
fn protection_requires_a_finished_handshake() {
    let mut initiator = context("client", "password", Direction::Outbound);

    let mut message = BufferDescriptor::data(b"too early".to_vec());
    let err = initiator
        .protect(ProtectionOp::Seal(QoP::Confidential), 0, &mut message)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::OutOfSequence);
}

#[test]
fn seal_and_unseal_roundtrip() {
    let (mut initiator, mut acceptor) = handshake("correct horse battery staple");

    let plaintext = b"ping".to_vec();
    let mut message = BufferDescriptor::data(plaintext.clone());
    initiator
        .protect(ProtectionOp::Seal(QoP::Confidential), 0, &mut message)
        .unwrap();
    assert_ne!(message.find(BufferKind::Data).unwrap().as_slice(), &plaintext[..]);

    let qop = acceptor.unprotect(UnprotectionOp::Unseal, 0, &mut message).unwrap();
    assert_eq!(qop, QoP::Confidential);
    assert_eq!(message.find(BufferKind::Data).unwrap().as_slice(), &plaintext[..]);
}

#[test]
fn verify_rejects_a_sealed_message() {
    let (mut initiator, mut acceptor) = handshake("shared");

    let mut message = BufferDescriptor::data(b"sealed".to_vec());
    initiator
        .protect(ProtectionOp::Seal(QoP::Confidential), 0, &mut message)
        .unwrap();

    let err = acceptor.unprotect(UnprotectionOp::Verify, 0, &mut message).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
}

#[test]
fn negotiated_flags_always_include_integrity_and_mutual_auth() {
    let (initiator, acceptor) = handshake("shared");

    for context in [&initiator, &acceptor] {
        match context.attribute(AttributeId::NegotiatedFlags).unwrap() {
            AttributeValue::Flags(flags) => {
                assert!(flags.contains(ContextFlags::INTEGRITY));
                assert!(flags.contains(ContextFlags::MUTUAL_AUTH));
                assert!(flags.contains(ContextFlags::CONFIDENTIALITY));
            }
            value => panic!("unexpected attribute value: {:?}", value),
        }
    }
}

#[test]
fn peer_principals_are_exchanged() {
    let (initiator, acceptor) = handshake("shared");

    assert_eq!(
        initiator.attribute(AttributeId::PeerPrincipal).unwrap(),
        AttributeValue::PeerPrincipal("server".to_string())
    );
    assert_eq!(
        acceptor.attribute(AttributeId::PeerPrincipal).unwrap(),
        AttributeValue::PeerPrincipal("client".to_string())
    );
}
