use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::mechanism::{mechanism_provider, MechanismId, ProviderCredential};
use crate::{Error, ErrorKind, Result, Secret};

/// How a credential is going to be used: accepting incoming negotiations,
/// initiating outgoing ones, or both.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Inbound = 1,
    Outbound = 2,
    Both = 3,
}

impl Direction {
    pub fn can_initiate(self) -> bool {
        matches!(self, Direction::Outbound | Direction::Both)
    }

    pub fn can_accept(self) -> bool {
        matches!(self, Direction::Inbound | Direction::Both)
    }
}

/// Opaque identity input, forwarded untouched to the mechanism provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Identity {
    /// A principal name plus the secret that proves it.
    Password {
        principal: String,
        password: Secret<String>,
    },
    /// A reference to a certificate in an external store. Resolution is the
    /// provider's concern.
    Certificate { reference: String },
    /// Use the ambient (process/OS default) identity.
    Ambient,
}

pub(crate) struct CredentialInner {
    pub(crate) mechanism: MechanismId,
    pub(crate) direction: Direction,
    pub(crate) state: Box<dyn ProviderCredential>,
    /// Number of live contexts created from this credential. The credential
    /// cannot be released while this is non-zero.
    pub(crate) contexts: AtomicUsize,
}

/// An opaque, reference-counted capability representing "who we authenticate
/// as". Acquired once and reused across many context negotiations; released
/// exactly once via [`CredentialHandle::release`] (or [`release_credential`]),
/// and only when no context references it anymore.
pub struct CredentialHandle {
    inner: Option<Arc<CredentialInner>>,
}

impl CredentialHandle {
    pub(crate) fn inner(&self) -> Result<&Arc<CredentialInner>> {
        self.inner
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidHandle, "the credential handle has already been released"))
    }

    pub fn mechanism(&self) -> Result<MechanismId> {
        Ok(self.inner()?.mechanism.clone())
    }

    pub fn direction(&self) -> Result<Direction> {
        Ok(self.inner()?.direction)
    }

    /// Number of live contexts currently referencing this credential.
    pub fn live_contexts(&self) -> Result<usize> {
        Ok(self.inner()?.contexts.load(Ordering::Acquire))
    }

    /// Releases the provider-level resource. Rejected while any context still
    /// references the credential, and on a second call.
    #[instrument(level = "debug", skip(self))]
    pub fn release(&mut self) -> Result<()> {
        let inner = self.inner()?;

        let contexts = inner.contexts.load(Ordering::Acquire);
        if contexts != 0 {
            return Err(Error::new(
                ErrorKind::CredentialInUse,
                format!("{} context(s) still reference this credential", contexts),
            ));
        }

        self.inner = None;

        Ok(())
    }
}

impl std::fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => write!(
                f,
                "CredentialHandle {{ mechanism: {}, direction: {:?} }}",
                inner.mechanism, inner.direction
            ),
            None => f.write_str("CredentialHandle {{ released }}"),
        }
    }
}

/// Acquires a credential for one mechanism. The identity material is passed
/// through to the provider, which validates it and allocates its own state.
#[instrument(level = "debug", skip(identity))]
pub fn acquire_credential(mechanism: MechanismId, direction: Direction, identity: Identity) -> Result<CredentialHandle> {
    let provider = mechanism_provider(&mechanism)?;
    let state = provider.acquire_credential(direction, &identity)?;

    Ok(CredentialHandle {
        inner: Some(Arc::new(CredentialInner {
            mechanism,
            direction,
            state,
            contexts: AtomicUsize::new(0),
        })),
    })
}

/// Free-function form of [`CredentialHandle::release`].
pub fn release_credential(credential: &mut CredentialHandle) -> Result<()> {
    credential.release()
}

/// A builder to acquire a [`CredentialHandle`].
///
/// # Requirements for execution
///
/// These methods are required to be called before calling the `execute` method
/// * [`with_mechanism`](AcquireCredential::with_mechanism)
/// * [`with_direction`](AcquireCredential::with_direction)
/// * [`with_identity`](AcquireCredential::with_identity)
#[derive(Debug, Default)]
pub struct AcquireCredential {
    mechanism: Option<MechanismId>,
    direction: Option<Direction>,
    identity: Option<Identity>,
}

impl AcquireCredential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mechanism(self, mechanism: MechanismId) -> Self {
        Self {
            mechanism: Some(mechanism),
            ..self
        }
    }

    pub fn with_direction(self, direction: Direction) -> Self {
        Self {
            direction: Some(direction),
            ..self
        }
    }

    pub fn with_identity(self, identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            ..self
        }
    }

    pub fn execute(self) -> Result<CredentialHandle> {
        let mechanism = self
            .mechanism
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, "mechanism is not specified"))?;
        let direction = self
            .direction
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, "direction is not specified"))?;
        let identity = self
            .identity
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, "identity is not specified"))?;

        acquire_credential(mechanism, direction, identity)
    }
}
