//! Generic security-context negotiation and secure-messaging layer.
//!
//! The crate lets a caller negotiate an authenticated, optionally encrypted
//! channel with a peer through one of several interchangeable mechanisms,
//! without knowing which mechanism is in play. The caller acquires a
//! [`CredentialHandle`], creates a [`SecurityContext`] bound to it, feeds
//! handshake tokens back and forth until the context is established, and then
//! protects application messages with per-direction sequence numbers.
//!
//! Token exchange is entirely the caller's responsibility: no operation in
//! this crate performs I/O, so transport framing, deadlines and cancellation
//! live outside of it. Concrete mechanisms plug in behind the
//! [`mechanism::MechanismProvider`] trait; the in-tree
//! [`mechanism::psk`] provider ships as a complete example and as the
//! mechanism used by the test suite.
//!
//! ```
//! use secchan::{
//!     acquire_credential, BufferDescriptor, ContextFlags, Direction, Identity, MechanismId, QoP, Secret,
//!     SecurityContext, StepOutcome,
//! };
//!
//! # fn main() -> secchan::Result<()> {
//! let identity = Identity::Password {
//!     principal: "client".to_string(),
//!     password: Secret::from("open sesame".to_string()),
//! };
//! let mut client_cred = acquire_credential(MechanismId::Psk, Direction::Outbound, identity.clone())?;
//! let mut server_cred = acquire_credential(MechanismId::Psk, Direction::Inbound, identity)?;
//!
//! let mut client = SecurityContext::new(&client_cred)?;
//! let mut server = SecurityContext::new(&server_cred)?;
//!
//! // One full round trip plus the initiator's final verification.
//! let mut t1 = BufferDescriptor::token(Vec::new());
//! client.step_initiate(Some("service/host"), ContextFlags::CONFIDENTIALITY, None, &mut t1)?;
//! let mut t2 = BufferDescriptor::token(Vec::new());
//! server.step_accept(&mut t1, &mut t2)?;
//! let mut t3 = BufferDescriptor::token(Vec::new());
//! assert_eq!(
//!     client.step_initiate(Some("service/host"), ContextFlags::CONFIDENTIALITY, Some(&mut t2), &mut t3)?,
//!     StepOutcome::CompleteAndFinish,
//! );
//!
//! let mut message = BufferDescriptor::data(b"ping".to_vec());
//! client.encrypt_message(&mut message, QoP::Confidential)?;
//! server.decrypt_message(&mut message)?;
//!
//! client.dispose()?;
//! server.dispose()?;
//! client_cred.release()?;
//! server_cred.release()?;
//! # Ok(())
//! # }
//! ```

mod buffer;
mod context;
mod credential;
mod error;
mod secret;

pub mod mechanism;

pub use crate::buffer::{BufferDescriptor, BufferKind, SecurityBuffer};
pub use crate::context::{
    create_context, AttributeId, AttributeValue, ContextFlags, ContextSizes, ContextState, QoP, SecurityContext,
    StepOutcome,
};
pub use crate::credential::{
    acquire_credential, release_credential, AcquireCredential, CredentialHandle, Direction, Identity,
};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::mechanism::{enumerate_mechanisms, query_mechanism_info, register_mechanism, MechanismId};
pub use crate::secret::Secret;
