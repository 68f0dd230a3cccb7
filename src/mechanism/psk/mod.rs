//! Pre-shared-key mechanism provider.
//!
//! Both peers hold the same secret; the handshake exchanges nonces and keyed
//! proofs in a single round trip plus a final initiator-side verification, so
//! it authenticates mutually without ever putting the secret on the wire.
//! Session keys are derived per direction from the secret and both nonces.

mod messages;
#[cfg(test)]
mod test;

use std::any::Any;

use hmac::{Hmac, Mac};
use num_traits::FromPrimitive;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, instrument};

use self::messages::{
    read_message, read_trailer, write_message, write_trailer, HandshakeMessage, Trailer, MAC_SIZE, MSG_HELLO,
    MSG_REPLY, NONCE_SIZE, TRAILER_SIZE,
};
use crate::mechanism::{
    MechanismCapabilities, MechanismContext, MechanismId, MechanismInfo, MechanismProvider, NegotiateParams,
    ProtectionOp, ProviderCredential, Role, UnprotectionOp,
};
use crate::{
    AttributeId, AttributeValue, BufferDescriptor, BufferKind, ContextFlags, ContextSizes, Direction, Error, ErrorKind,
    Identity, QoP, Result, Secret, SecurityBuffer, StepOutcome,
};

pub const PKG_NAME: &str = "PSK";

const MAX_TOKEN_LEN: u32 = 1024;
const MAX_PRINCIPAL_LEN: usize = 512;

const MASTER_SALT: &[u8] = b"secchan psk master v1";
const INITIATOR_PROOF_LABEL: &[u8] = b"psk initiator proof";
const ACCEPTOR_PROOF_LABEL: &[u8] = b"psk acceptor proof";
const SIGN_I2A_LABEL: &[u8] = b"psk sign initiator to acceptor";
const SIGN_A2I_LABEL: &[u8] = b"psk sign acceptor to initiator";
const SEAL_I2A_LABEL: &[u8] = b"psk seal initiator to acceptor";
const SEAL_A2I_LABEL: &[u8] = b"psk seal acceptor to initiator";

const SUPPORTED_FLAGS: ContextFlags = ContextFlags::MUTUAL_AUTH
    .union(ContextFlags::CONFIDENTIALITY)
    .union(ContextFlags::INTEGRITY)
    .union(ContextFlags::REPLAY_DETECT)
    .union(ContextFlags::SEQUENCE_DETECT);

type HmacSha256 = Hmac<Sha256>;

/// The pre-shared-key mechanism. Registered under [`MechanismId::Psk`] at
/// process start.
#[derive(Debug, Default)]
pub struct PskProvider;

impl MechanismProvider for PskProvider {
    fn info(&self) -> MechanismInfo {
        MechanismInfo {
            name: MechanismId::Psk,
            capabilities: MechanismCapabilities::INTEGRITY
                | MechanismCapabilities::CONFIDENTIALITY
                | MechanismCapabilities::SIGN_ONLY
                | MechanismCapabilities::MUTUAL_AUTH,
            max_token_len: MAX_TOKEN_LEN,
            comment: String::from("Pre-shared key mutual authentication"),
        }
    }

    #[instrument(level = "debug", skip(self, identity))]
    fn acquire_credential(&self, _direction: Direction, identity: &Identity) -> Result<Box<dyn ProviderCredential>> {
        let (principal, password) = match identity {
            Identity::Password { principal, password } => (principal, password),
            _ => {
                return Err(Error::new(
                    ErrorKind::IdentityRejected,
                    "the PSK mechanism requires a principal and a pre-shared password",
                ))
            }
        };

        if password.as_ref().is_empty() {
            return Err(Error::new(ErrorKind::IdentityRejected, "the pre-shared password is empty"));
        }
        if principal.is_empty() || principal.len() > MAX_PRINCIPAL_LEN {
            return Err(Error::new(ErrorKind::IdentityRejected, "invalid principal length"));
        }

        let master = hmac_sha256(MASTER_SALT, &[password.as_ref().as_bytes()]);

        Ok(Box::new(PskCredential {
            principal: principal.clone(),
            master: Secret::from(master.to_vec()),
        }))
    }

    fn new_context(
        &self,
        credential: &dyn ProviderCredential,
        _direction: Direction,
    ) -> Result<Box<dyn MechanismContext>> {
        let credential = credential.as_any().downcast_ref::<PskCredential>().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidHandle,
                "the credential state does not belong to the PSK mechanism",
            )
        })?;

        Ok(Box::new(PskContext::new(credential.clone())))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PskCredential {
    principal: String,
    master: Secret<Vec<u8>>,
}

impl ProviderCredential for PskCredential {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PskState {
    Initial,
    AwaitingReply,
    Final,
}

#[derive(Debug)]
struct SessionKeys {
    send_sign: Secret<Vec<u8>>,
    recv_sign: Secret<Vec<u8>>,
    send_seal: Secret<Vec<u8>>,
    recv_seal: Secret<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct PskContext {
    credential: PskCredential,
    state: PskState,
    negotiated: ContextFlags,
    client_nonce: Option<[u8; NONCE_SIZE]>,
    peer_principal: Option<String>,
    keys: Option<SessionKeys>,
}

impl PskContext {
    fn new(credential: PskCredential) -> Self {
        Self {
            credential,
            state: PskState::Initial,
            negotiated: ContextFlags::empty(),
            client_nonce: None,
            peer_principal: None,
            keys: None,
        }
    }

    fn master(&self) -> &[u8] {
        self.credential.master.as_ref()
    }

    /// The flags this mechanism actually provides for a given request.
    /// Integrity, mutual authentication and sequence/replay detection are
    /// inherent: every protected message carries a MAC and a sequence number.
    fn sanitize_flags(requested: ContextFlags) -> ContextFlags {
        (requested & SUPPORTED_FLAGS)
            | ContextFlags::INTEGRITY
            | ContextFlags::MUTUAL_AUTH
            | ContextFlags::REPLAY_DETECT
            | ContextFlags::SEQUENCE_DETECT
    }

    fn initiate_hello(&mut self, params: &NegotiateParams<'_>, output: &mut BufferDescriptor) -> Result<StepOutcome> {
        let flags = Self::sanitize_flags(params.requested_flags);

        let mut nonce = [0; NONCE_SIZE];
        OsRng.try_fill_bytes(&mut nonce)?;

        let proof = hmac_sha256(
            self.master(),
            &[
                INITIATOR_PROOF_LABEL,
                &flags.bits().to_le_bytes(),
                self.credential.principal.as_bytes(),
                &nonce,
            ],
        );

        let token = write_message(&HandshakeMessage {
            msg_type: MSG_HELLO,
            flags: flags.bits(),
            principal: self.credential.principal.clone(),
            nonce,
            proof,
        })?;
        write_token(output, &token);

        self.negotiated = flags;
        self.client_nonce = Some(nonce);
        self.state = PskState::AwaitingReply;

        Ok(StepOutcome::Continue)
    }

    fn accept_hello(&mut self, input: &BufferDescriptor, output: &mut BufferDescriptor) -> Result<StepOutcome> {
        let hello = read_message(input.find(BufferKind::Token)?.as_slice())?;
        if hello.msg_type != MSG_HELLO {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                "expected a hello token from the initiator",
            ));
        }

        let authentic = verify_hmac_sha256(
            self.master(),
            &[
                INITIATOR_PROOF_LABEL,
                &hello.flags.to_le_bytes(),
                hello.principal.as_bytes(),
                &hello.nonce,
            ],
            &hello.proof,
        );
        if !authentic {
            return Err(Error::new(
                ErrorKind::IdentityRejected,
                "initiator proof mismatch; the peer does not hold the shared key",
            ));
        }

        let requested = ContextFlags::from_bits(hello.flags)
            .ok_or_else(|| Error::new(ErrorKind::ProtocolViolation, "unknown flag bits in the hello token"))?;
        let negotiated = Self::sanitize_flags(requested);

        let mut acceptor_nonce = [0; NONCE_SIZE];
        OsRng.try_fill_bytes(&mut acceptor_nonce)?;

        let proof = hmac_sha256(
            self.master(),
            &[
                ACCEPTOR_PROOF_LABEL,
                &negotiated.bits().to_le_bytes(),
                self.credential.principal.as_bytes(),
                &hello.nonce,
                &acceptor_nonce,
            ],
        );

        let token = write_message(&HandshakeMessage {
            msg_type: MSG_REPLY,
            flags: negotiated.bits(),
            principal: self.credential.principal.clone(),
            nonce: acceptor_nonce,
            proof,
        })?;
        write_token(output, &token);

        self.keys = Some(self.derive_keys(Role::Acceptor, &hello.nonce, &acceptor_nonce));
        self.negotiated = negotiated;
        self.peer_principal = Some(hello.principal);
        self.state = PskState::Final;
        debug!(peer = ?self.peer_principal, "initiator authenticated");

        Ok(StepOutcome::Complete)
    }

    fn finish_initiate(&mut self, input: Option<&BufferDescriptor>) -> Result<StepOutcome> {
        let input = input.ok_or_else(|| {
            Error::new(
                ErrorKind::ProtocolViolation,
                "the second initiator step requires the acceptor's reply token",
            )
        })?;
        let reply = read_message(input.find(BufferKind::Token)?.as_slice())?;
        if reply.msg_type != MSG_REPLY {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                "expected a reply token from the acceptor",
            ));
        }

        let client_nonce = self.client_nonce.expect("set when the hello was produced");
        let authentic = verify_hmac_sha256(
            self.master(),
            &[
                ACCEPTOR_PROOF_LABEL,
                &reply.flags.to_le_bytes(),
                reply.principal.as_bytes(),
                &client_nonce,
                &reply.nonce,
            ],
            &reply.proof,
        );
        if !authentic {
            return Err(Error::new(
                ErrorKind::IdentityRejected,
                "acceptor proof mismatch; the peer does not hold the shared key",
            ));
        }

        let negotiated = ContextFlags::from_bits(reply.flags)
            .ok_or_else(|| Error::new(ErrorKind::ProtocolViolation, "unknown flag bits in the reply token"))?;
        if !SUPPORTED_FLAGS.contains(negotiated) {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                "the acceptor negotiated flags this mechanism does not support",
            ));
        }

        self.keys = Some(self.derive_keys(Role::Initiator, &client_nonce, &reply.nonce));
        self.negotiated = negotiated;
        self.peer_principal = Some(reply.principal);
        self.state = PskState::Final;
        debug!(peer = ?self.peer_principal, "acceptor authenticated");

        Ok(StepOutcome::CompleteAndFinish)
    }

    fn derive_keys(&self, role: Role, client_nonce: &[u8], acceptor_nonce: &[u8]) -> SessionKeys {
        let derive = |label: &[u8]| -> Secret<Vec<u8>> {
            Secret::from(hmac_sha256(self.master(), &[label, client_nonce, acceptor_nonce]).to_vec())
        };

        let sign_i2a = derive(SIGN_I2A_LABEL);
        let sign_a2i = derive(SIGN_A2I_LABEL);
        let seal_i2a = derive(SEAL_I2A_LABEL);
        let seal_a2i = derive(SEAL_A2I_LABEL);

        match role {
            Role::Initiator => SessionKeys {
                send_sign: sign_i2a,
                recv_sign: sign_a2i,
                send_seal: seal_i2a,
                recv_seal: seal_a2i,
            },
            Role::Acceptor => SessionKeys {
                send_sign: sign_a2i,
                recv_sign: sign_i2a,
                send_seal: seal_a2i,
                recv_seal: seal_i2a,
            },
        }
    }

    fn keys(&self) -> Result<&SessionKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::OutOfSequence, "the handshake is not finished"))
    }
}

impl MechanismContext for PskContext {
    #[instrument(level = "debug", ret, fields(state = ?self.state), skip_all)]
    fn negotiate_step(
        &mut self,
        role: Role,
        params: &NegotiateParams<'_>,
        input: Option<&BufferDescriptor>,
        output: &mut BufferDescriptor,
    ) -> Result<StepOutcome> {
        match (role, self.state) {
            (Role::Initiator, PskState::Initial) => {
                if input_token_bytes(input).is_some() {
                    return Err(Error::new(
                        ErrorKind::ProtocolViolation,
                        "no input token is expected on the first initiator step",
                    ));
                }
                self.initiate_hello(params, output)
            }
            (Role::Acceptor, PskState::Initial) => {
                let input = input.ok_or_else(|| {
                    Error::new(ErrorKind::ProtocolViolation, "the acceptor requires an input token")
                })?;
                self.accept_hello(input, output)
            }
            (Role::Initiator, PskState::AwaitingReply) => self.finish_initiate(input),
            _ => Err(Error::new(
                ErrorKind::ProtocolViolation,
                "handshake token fed out of order or replayed",
            )),
        }
    }

    fn protect(&mut self, op: ProtectionOp, sequence_number: u64, message: &mut BufferDescriptor) -> Result<()> {
        let qop = match op {
            ProtectionOp::Seal(qop) => qop,
            ProtectionOp::Sign => QoP::SignOnly,
        };
        let keys = self.keys()?;

        // MAC over the plaintext, before any sealing.
        message.find(BufferKind::Data)?;
        let mac = compute_mac(keys.send_sign.as_ref(), sequence_number, qop, message);

        if matches!(op, ProtectionOp::Seal(QoP::Confidential)) {
            apply_keystream(keys.send_seal.as_ref(), sequence_number, message);
        }

        let trailer = write_trailer(&Trailer {
            qop: qop as u8,
            sequence_number,
            mac,
        })?;
        write_token(message, &trailer);

        Ok(())
    }

    fn unprotect(&mut self, op: UnprotectionOp, sequence_number: u64, message: &mut BufferDescriptor) -> Result<QoP> {
        let keys = self.keys()?;

        let trailer = read_trailer(message.find(BufferKind::Token)?.as_slice())?;
        let qop = QoP::from_u8(trailer.qop)
            .ok_or_else(|| Error::new(ErrorKind::MessageAltered, "unknown protection level in the trailer"))?;

        if trailer.sequence_number != sequence_number {
            return Err(Error::new(
                ErrorKind::OutOfSequence,
                format!(
                    "invalid sequence number: expected {}, got {}",
                    sequence_number, trailer.sequence_number
                ),
            ));
        }

        if op == UnprotectionOp::Verify && qop == QoP::Confidential {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                "a sealed message was passed to signature verification",
            ));
        }

        if qop == QoP::Confidential {
            apply_keystream(keys.recv_seal.as_ref(), sequence_number, message);
        }

        if !verify_mac(keys.recv_sign.as_ref(), sequence_number, qop, message, &trailer.mac) {
            return Err(Error::new(ErrorKind::MessageAltered, "message integrity check failed"));
        }

        Ok(qop)
    }

    fn attribute(&self, attr: AttributeId) -> Result<AttributeValue> {
        if self.state != PskState::Final {
            return Err(Error::new(
                ErrorKind::NotYetAvailable,
                "attributes are available once the handshake has completed",
            ));
        }

        match attr {
            AttributeId::NegotiatedFlags => Ok(AttributeValue::Flags(self.negotiated)),
            AttributeId::MechanismName => Ok(AttributeValue::MechanismName(PKG_NAME.to_string())),
            AttributeId::PeerPrincipal => {
                let peer = self.peer_principal.as_ref().expect("set at establishment");
                Ok(AttributeValue::PeerPrincipal(peer.clone()))
            }
            AttributeId::IdentityToken => {
                let peer = self.peer_principal.as_ref().expect("set at establishment");
                Ok(AttributeValue::IdentityToken(
                    format!("{}:{}", PKG_NAME, peer).into_bytes(),
                ))
            }
            AttributeId::Sizes => Ok(AttributeValue::Sizes(ContextSizes {
                max_token: MAX_TOKEN_LEN,
                max_signature: TRAILER_SIZE as u32,
                block: 0,
                security_trailer: TRAILER_SIZE as u32,
            })),
        }
    }
}

fn input_token_bytes(input: Option<&BufferDescriptor>) -> Option<&[u8]> {
    let token = input?.find(BufferKind::Token).ok()?;
    if token.is_empty() {
        None
    } else {
        Some(token.as_slice())
    }
}

/// Writes a handshake or trailer token into the descriptor's `Token` buffer,
/// appending one if the caller did not supply it.
fn write_token(output: &mut BufferDescriptor, bytes: &[u8]) {
    match output.find_mut(BufferKind::Token) {
        Ok(token) => token.write_data(bytes),
        Err(_) => output.push(SecurityBuffer::token(bytes.to_vec())),
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any size");
    for part in parts {
        mac.update(part);
    }

    let mut result = [0; 32];
    result.copy_from_slice(&mac.finalize().into_bytes());

    result
}

/// Constant-time check of a full-length HMAC-SHA256 tag.
fn verify_hmac_sha256(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any size");
    for part in parts {
        mac.update(part);
    }

    mac.verify_slice(tag).is_ok()
}

fn mac_state(key: &[u8], sequence_number: u64, qop: QoP, message: &BufferDescriptor) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any size");
    mac.update(&sequence_number.to_le_bytes());
    mac.update(&[qop as u8]);
    for buffer in message.buffers_of_kind(BufferKind::Data) {
        mac.update(buffer.as_slice());
    }

    mac
}

fn compute_mac(key: &[u8], sequence_number: u64, qop: QoP, message: &BufferDescriptor) -> [u8; MAC_SIZE] {
    let digest = mac_state(key, sequence_number, qop, message).finalize().into_bytes();
    let mut result = [0; MAC_SIZE];
    result.copy_from_slice(&digest[..MAC_SIZE]);

    result
}

/// Constant-time check of the truncated message MAC.
fn verify_mac(key: &[u8], sequence_number: u64, qop: QoP, message: &BufferDescriptor, tag: &[u8]) -> bool {
    mac_state(key, sequence_number, qop, message)
        .verify_truncated_left(tag)
        .is_ok()
}

/// XORs the `Data` buffers, in order, with an HMAC-derived keystream bound to
/// the message's sequence number. Applying it twice restores the input.
fn apply_keystream(key: &[u8], sequence_number: u64, message: &mut BufferDescriptor) {
    let mut block = [0; 32];
    let mut block_index: u32 = 0;
    let mut used = block.len();

    for buffer in message.buffers_of_kind_mut(BufferKind::Data) {
        for byte in buffer.as_mut_slice() {
            if used == block.len() {
                block = hmac_sha256(key, &[&sequence_number.to_le_bytes(), &block_index.to_le_bytes()]);
                block_index += 1;
                used = 0;
            }
            *byte ^= block[used];
            used += 1;
        }
    }
}
