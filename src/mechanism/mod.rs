pub mod psk;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::{fmt, str};

use bitflags::bitflags;

use crate::{
    AttributeId, AttributeValue, BufferDescriptor, ContextFlags, Direction, Error, ErrorKind, Identity, QoP, Result,
    StepOutcome,
};

/// Identifies one mechanism family (an authentication/encryption protocol).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MechanismId {
    /// The in-tree pre-shared-key mechanism.
    Psk,
    Other(String),
}

impl fmt::Display for MechanismId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MechanismId::Psk => f.write_str(psk::PKG_NAME),
            MechanismId::Other(name) => f.write_str(name),
        }
    }
}

impl str::FromStr for MechanismId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            psk::PKG_NAME => Ok(MechanismId::Psk),
            s => Ok(MechanismId::Other(s.to_string())),
        }
    }
}

bitflags! {
    /// What a mechanism is able to negotiate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MechanismCapabilities: u32 {
        const INTEGRITY = 0x1;
        const CONFIDENTIALITY = 0x2;
        const SIGN_ONLY = 0x4;
        const MUTUAL_AUTH = 0x8;
        const DATAGRAM = 0x10;
        const STREAM = 0x20;
    }
}

/// General information about a registered mechanism.
#[derive(Debug, Clone)]
pub struct MechanismInfo {
    pub name: MechanismId,
    pub capabilities: MechanismCapabilities,
    pub max_token_len: u32,
    pub comment: String,
}

/// Opaque, provider-owned credential state shared by every context created
/// from one credential handle. Providers downcast through [`Any`].
pub trait ProviderCredential: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// A pluggable implementation of one mechanism family. Registered once per
/// [`MechanismId`] at process start; selected at credential acquisition and
/// fixed for the life of every context created from that credential.
pub trait MechanismProvider: Send + Sync {
    fn info(&self) -> MechanismInfo;

    /// Validates the identity material and allocates the provider-level
    /// credential state.
    fn acquire_credential(&self, direction: Direction, identity: &Identity) -> Result<Box<dyn ProviderCredential>>;

    /// Creates the per-conversation mechanism state machine.
    fn new_context(&self, credential: &dyn ProviderCredential, direction: Direction)
        -> Result<Box<dyn MechanismContext>>;
}

/// The side of the handshake a context plays.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Caller-supplied handshake parameters, forwarded to the provider on every
/// negotiation step.
#[derive(Debug)]
pub struct NegotiateParams<'a> {
    pub target_name: Option<&'a str>,
    pub requested_flags: ContextFlags,
}

/// Message protection operation requested from a provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtectionOp {
    /// Encrypt (or, for [`QoP::SignOnly`], authenticate without encrypting)
    /// the `Data` buffers and append the trailer.
    Seal(QoP),
    /// Append a standalone signature without touching the `Data` buffers.
    Sign,
}

/// Inverse of [`ProtectionOp`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnprotectionOp {
    Unseal,
    Verify,
}

/// The per-conversation state machine of one mechanism. Driven exclusively by
/// the generic layer; implementations never perform I/O.
pub trait MechanismContext: Send {
    /// Advances the handshake by one step. Tokens are opaque to the generic
    /// layer; a truncated token is reported with
    /// [`ErrorKind::IncompleteToken`] and must not advance the mechanism
    /// state.
    fn negotiate_step(
        &mut self,
        role: Role,
        params: &NegotiateParams<'_>,
        input: Option<&BufferDescriptor>,
        output: &mut BufferDescriptor,
    ) -> Result<StepOutcome>;

    /// Protects one message with the given send sequence number.
    fn protect(&mut self, op: ProtectionOp, sequence_number: u64, message: &mut BufferDescriptor) -> Result<()>;

    /// Verifies (and for `Unseal` decrypts) one message, checking the embedded
    /// sequence number against the expected receive sequence number.
    fn unprotect(&mut self, op: UnprotectionOp, sequence_number: u64, message: &mut BufferDescriptor) -> Result<QoP>;

    /// Read-only introspection. Most attributes are only meaningful once the
    /// handshake has completed.
    fn attribute(&self, attr: AttributeId) -> Result<AttributeValue>;
}

static REGISTRY: LazyLock<RwLock<HashMap<MechanismId, Arc<dyn MechanismProvider>>>> = LazyLock::new(|| {
    let mut providers: HashMap<MechanismId, Arc<dyn MechanismProvider>> = HashMap::new();
    providers.insert(MechanismId::Psk, Arc::new(psk::PskProvider::default()));

    RwLock::new(providers)
});

/// Registers a mechanism provider. Intended to be called at process start;
/// registering a second provider under an already-taken identifier is
/// rejected, there is no hot-swap.
pub fn register_mechanism(provider: Arc<dyn MechanismProvider>) -> Result<()> {
    let id = provider.info().name;
    let mut registry = REGISTRY
        .write()
        .map_err(|_| Error::new(ErrorKind::InternalError, "mechanism registry lock poisoned"))?;

    if registry.contains_key(&id) {
        return Err(Error::new(
            ErrorKind::InvalidParameter,
            format!("a mechanism provider is already registered for {}", id),
        ));
    }

    registry.insert(id, provider);

    Ok(())
}

pub(crate) fn mechanism_provider(id: &MechanismId) -> Result<Arc<dyn MechanismProvider>> {
    let registry = REGISTRY
        .read()
        .map_err(|_| Error::new(ErrorKind::InternalError, "mechanism registry lock poisoned"))?;

    registry.get(id).cloned().ok_or_else(|| {
        Error::new(
            ErrorKind::UnknownMechanism,
            format!("no mechanism provider is registered for {}", id),
        )
    })
}

pub fn query_mechanism_info(id: &MechanismId) -> Result<MechanismInfo> {
    Ok(mechanism_provider(id)?.info())
}

pub fn enumerate_mechanisms() -> Result<Vec<MechanismInfo>> {
    let registry = REGISTRY
        .read()
        .map_err(|_| Error::new(ErrorKind::InternalError, "mechanism registry lock poisoned"))?;

    Ok(registry.values().map(|provider| provider.info()).collect())
}
