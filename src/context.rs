use std::sync::atomic::Ordering;
use std::sync::Weak;

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use tracing::{debug, instrument};

use crate::credential::CredentialInner;
use crate::mechanism::{MechanismContext, MechanismId, NegotiateParams, ProtectionOp, Role, UnprotectionOp};
use crate::{mechanism, BufferDescriptor, CredentialHandle, Error, ErrorKind, Result};

/// The lifecycle of a security context. `Negotiating` may span 1..N round
/// trips; there is no transition out of `Established` or `Failed` except
/// destruction (a fatal protocol violation also lands in `Failed`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextState {
    New,
    Negotiating,
    Established,
    Failed,
}

bitflags! {
    /// Context properties requested by the caller and negotiated by the
    /// mechanism.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        const MUTUAL_AUTH = 0x1;
        const CONFIDENTIALITY = 0x2;
        const INTEGRITY = 0x4;
        const REPLAY_DETECT = 0x8;
        const SEQUENCE_DETECT = 0x10;
        const DELEGATE = 0x20;
        const STREAM = 0x40;
        const DATAGRAM = 0x80;
    }
}

/// Result of one successful handshake step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Send the output token and call again with the peer's reply.
    Continue,
    /// Send the output token if non-empty; the context is now established.
    Complete,
    /// No further tokens are needed; the context is established.
    CompleteAndFinish,
}

/// Quality of protection of one message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum QoP {
    /// Encrypted and integrity-protected.
    Confidential = 0,
    /// Readable but authenticated.
    SignOnly = 1,
}

/// Identifies a context attribute for [`SecurityContext::query_attribute`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttributeId {
    NegotiatedFlags,
    PeerPrincipal,
    MechanismName,
    /// An exportable, mechanism-defined token representing the authenticated
    /// peer identity, for downstream authorization decisions.
    IdentityToken,
    Sizes,
}

/// Buffer sizing limits of an established context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSizes {
    pub max_token: u32,
    pub max_signature: u32,
    pub block: u32,
    pub security_trailer: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Flags(ContextFlags),
    PeerPrincipal(String),
    MechanismName(String),
    IdentityToken(Vec<u8>),
    Sizes(ContextSizes),
}

/// One negotiated conversation's state, bound to one credential and one
/// mechanism.
///
/// The context holds a non-owning back-reference to its credential: the
/// caller keeps the credential alive, and the credential cannot be released
/// while this context exists. All handshake calls on one context must be
/// externally serialized; `&mut self` receivers enforce that at compile time.
pub struct SecurityContext {
    credential: Weak<CredentialInner>,
    mechanism_id: MechanismId,
    mechanism: Box<dyn MechanismContext>,
    state: ContextState,
    flags: ContextFlags,
    send_seq: u64,
    recv_seq: u64,
    disposed: bool,
}

/// Free-function form of [`SecurityContext::new`].
pub fn create_context(credential: &CredentialHandle) -> Result<SecurityContext> {
    SecurityContext::new(credential)
}

impl SecurityContext {
    /// Creates a context bound to the given credential. The credential's live
    /// context count is incremented until the context is disposed or dropped.
    pub fn new(credential: &CredentialHandle) -> Result<Self> {
        let inner = credential.inner()?;
        let provider = mechanism::mechanism_provider(&inner.mechanism)?;
        let mechanism = provider.new_context(inner.state.as_ref(), inner.direction)?;

        inner.contexts.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            credential: std::sync::Arc::downgrade(inner),
            mechanism_id: inner.mechanism.clone(),
            mechanism,
            state: ContextState::New,
            flags: ContextFlags::empty(),
            send_seq: 0,
            recv_seq: 0,
            disposed: false,
        })
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Negotiated flags; empty until the context is established.
    pub fn negotiated_flags(&self) -> ContextFlags {
        self.flags
    }

    pub fn send_sequence_number(&self) -> u64 {
        self.send_seq
    }

    pub fn recv_sequence_number(&self) -> u64 {
        self.recv_seq
    }

    /// Releases the context. Safe to call in any state, including
    /// mid-negotiation and after failure; a second call is an error.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Err(Error::new(
                ErrorKind::InvalidHandle,
                "the security context has already been disposed",
            ));
        }

        self.release_slot();

        Ok(())
    }

    fn release_slot(&mut self) {
        self.disposed = true;
        if let Some(inner) = self.credential.upgrade() {
            inner.contexts.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::new(
                ErrorKind::InvalidHandle,
                "the security context has been disposed",
            ));
        }

        Ok(())
    }

    fn ensure_negotiable(&self) -> Result<()> {
        match self.state {
            ContextState::New | ContextState::Negotiating => Ok(()),
            ContextState::Established => Err(Error::new(
                ErrorKind::ProtocolViolation,
                "the context is already established",
            )),
            ContextState::Failed => Err(Error::new(
                ErrorKind::ProtocolViolation,
                "the context has failed and must not be stepped again",
            )),
        }
    }

    fn ensure_established(&self, operation: &str) -> Result<()> {
        match self.state {
            ContextState::Established => Ok(()),
            ContextState::Failed => Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!("{} called on a failed context", operation),
            )),
            _ => Err(Error::new(
                ErrorKind::NotYetAvailable,
                format!("{} requires an established context", operation),
            )),
        }
    }

    fn ensure_direction(&self, role: Role) -> Result<()> {
        let inner = self.credential.upgrade().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidHandle,
                "the credential backing this context has been released",
            )
        })?;

        let allowed = match role {
            Role::Initiator => inner.direction.can_initiate(),
            Role::Acceptor => inner.direction.can_accept(),
        };
        if !allowed {
            return Err(Error::new(
                ErrorKind::UnsupportedOperation,
                format!("the credential direction {:?} does not allow {:?}", inner.direction, role),
            ));
        }

        Ok(())
    }

    /// Advances the handshake on the initiating side. The first call passes
    /// no input token; each subsequent call supplies the peer's most recent
    /// reply. On a fatal error the context transitions to `Failed`; a
    /// truncated token is reported with [`ErrorKind::IncompleteToken`], leaves
    /// the state untouched and annotates the input descriptor with a
    /// `Missing` buffer.
    #[instrument(level = "debug", ret, fields(state = ?self.state), skip_all)]
    pub fn step_initiate(
        &mut self,
        target_name: Option<&str>,
        flags_requested: ContextFlags,
        mut input_token: Option<&mut BufferDescriptor>,
        output_token: &mut BufferDescriptor,
    ) -> Result<StepOutcome> {
        self.ensure_live()?;
        self.ensure_negotiable()?;
        self.ensure_direction(Role::Initiator)?;

        if let Some(input) = input_token.as_deref_mut() {
            input.clear_missing();
        }

        let params = NegotiateParams {
            target_name,
            requested_flags: flags_requested,
        };
        let outcome = self
            .mechanism
            .negotiate_step(Role::Initiator, &params, input_token.as_deref(), output_token);

        self.conclude_step(outcome, input_token)
    }

    /// Advances the handshake on the accepting side. The acceptor always
    /// receives a token first. Same state machine and error contract as
    /// [`SecurityContext::step_initiate`], mirrored.
    #[instrument(level = "debug", ret, fields(state = ?self.state), skip_all)]
    pub fn step_accept(
        &mut self,
        input_token: &mut BufferDescriptor,
        output_token: &mut BufferDescriptor,
    ) -> Result<StepOutcome> {
        self.ensure_live()?;
        self.ensure_negotiable()?;
        self.ensure_direction(Role::Acceptor)?;

        input_token.clear_missing();

        let params = NegotiateParams {
            target_name: None,
            requested_flags: ContextFlags::empty(),
        };
        let outcome = self
            .mechanism
            .negotiate_step(Role::Acceptor, &params, Some(input_token), output_token);

        self.conclude_step(outcome, Some(input_token))
    }

    fn conclude_step(
        &mut self,
        outcome: Result<StepOutcome>,
        input_token: Option<&mut BufferDescriptor>,
    ) -> Result<StepOutcome> {
        match outcome {
            Ok(StepOutcome::Continue) => {
                self.state = ContextState::Negotiating;
                Ok(StepOutcome::Continue)
            }
            Ok(outcome) => {
                match self.mechanism.attribute(AttributeId::NegotiatedFlags) {
                    Ok(AttributeValue::Flags(flags)) => self.flags = flags,
                    Ok(_) | Err(_) => {
                        self.state = ContextState::Failed;
                        return Err(Error::new(
                            ErrorKind::ProtocolViolation,
                            "the mechanism did not report its negotiated flags",
                        ));
                    }
                }

                self.state = ContextState::Established;
                debug!(flags = ?self.flags, "context established");
                Ok(outcome)
            }
            Err(err) if err.is_retryable() => {
                // A framing retry, not a handshake round trip. Neither the
                // state nor the sequence counters move.
                if let ErrorKind::IncompleteToken { bytes_needed } = err.kind {
                    if let Some(input) = input_token {
                        input.set_missing(bytes_needed);
                    }
                }
                Err(err)
            }
            Err(err) => {
                self.state = ContextState::Failed;
                Err(err)
            }
        }
    }

    /// Protects the `Data` buffers in place and appends the integrity
    /// trailer, consuming one send sequence number. With [`QoP::SignOnly`]
    /// the data stays readable but is still authenticated.
    #[instrument(level = "debug", fields(state = ?self.state, seq = self.send_seq), skip_all)]
    pub fn encrypt_message(&mut self, message: &mut BufferDescriptor, qop: QoP) -> Result<()> {
        self.ensure_live()?;
        self.ensure_established("encrypt_message")?;

        if qop == QoP::Confidential && !self.flags.contains(ContextFlags::CONFIDENTIALITY) {
            return Err(Error::new(
                ErrorKind::UnsupportedOperation,
                "confidentiality was not negotiated for this context",
            ));
        }

        self.mechanism
            .protect(ProtectionOp::Seal(qop), self.send_seq, message)
            .map_err(|err| self.note_protection_error(err))?;
        self.send_seq += 1;

        Ok(())
    }

    /// Verifies and decrypts a protected message in place, consuming one
    /// receive sequence number on success. Distinguishes tampering
    /// ([`ErrorKind::MessageAltered`]) from reordering
    /// ([`ErrorKind::OutOfSequence`]); the latter leaves the expected
    /// sequence number unchanged so a retransmission can resynchronize.
    #[instrument(level = "debug", fields(state = ?self.state, seq = self.recv_seq), skip_all)]
    pub fn decrypt_message(&mut self, message: &mut BufferDescriptor) -> Result<QoP> {
        self.ensure_live()?;
        self.ensure_established("decrypt_message")?;

        let qop = self
            .mechanism
            .unprotect(UnprotectionOp::Unseal, self.recv_seq, message)
            .map_err(|err| self.note_protection_error(err))?;

        if qop == QoP::Confidential && !self.flags.contains(ContextFlags::CONFIDENTIALITY) {
            self.state = ContextState::Failed;
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                "received an encrypted message on a context without negotiated confidentiality",
            ));
        }

        self.recv_seq += 1;

        Ok(qop)
    }

    /// Appends a signature over the `Data` buffers without altering their
    /// confidentiality, consuming one send sequence number.
    #[instrument(level = "debug", fields(state = ?self.state, seq = self.send_seq), skip_all)]
    pub fn sign_message(&mut self, message: &mut BufferDescriptor) -> Result<()> {
        self.ensure_live()?;
        self.ensure_established("sign_message")?;

        if !self.flags.contains(ContextFlags::INTEGRITY) {
            return Err(Error::new(
                ErrorKind::UnsupportedOperation,
                "integrity was not negotiated for this context",
            ));
        }

        self.mechanism
            .protect(ProtectionOp::Sign, self.send_seq, message)
            .map_err(|err| self.note_protection_error(err))?;
        self.send_seq += 1;

        Ok(())
    }

    /// Verifies a standalone signature, consuming one receive sequence number
    /// on success.
    #[instrument(level = "debug", fields(state = ?self.state, seq = self.recv_seq), skip_all)]
    pub fn verify_signature(&mut self, message: &mut BufferDescriptor) -> Result<()> {
        self.ensure_live()?;
        self.ensure_established("verify_signature")?;

        let qop = self
            .mechanism
            .unprotect(UnprotectionOp::Verify, self.recv_seq, message)
            .map_err(|err| self.note_protection_error(err))?;

        if qop != QoP::SignOnly {
            // The peer sealed a message where a bare signature was required.
            self.state = ContextState::Failed;
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                "expected a signed message but received a sealed one",
            ));
        }

        self.recv_seq += 1;

        Ok(())
    }

    /// Message-protection errors are per-message and leave the context usable,
    /// except a protocol violation, which is fatal.
    fn note_protection_error(&mut self, err: Error) -> Error {
        if err.kind == ErrorKind::ProtocolViolation {
            self.state = ContextState::Failed;
        }

        err
    }

    /// Read-only introspection. The mechanism name is available in any state;
    /// everything else is only meaningful once the context is established and
    /// yields [`ErrorKind::NotYetAvailable`] before that.
    pub fn query_attribute(&self, attr: AttributeId) -> Result<AttributeValue> {
        self.ensure_live()?;

        match attr {
            AttributeId::MechanismName => Ok(AttributeValue::MechanismName(self.mechanism_id.to_string())),
            AttributeId::NegotiatedFlags => {
                self.ensure_established("query_attribute(NegotiatedFlags)")?;
                Ok(AttributeValue::Flags(self.flags))
            }
            attr => {
                self.ensure_established("query_attribute")?;
                self.mechanism.attribute(attr)
            }
        }
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        if !self.disposed {
            self.release_slot();
        }
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("mechanism", &self.mechanism_id)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .field("disposed", &self.disposed)
            .finish()
    }
}
