use std::sync::Once;

use secchan::{
    acquire_credential, BufferDescriptor, ContextFlags, CredentialHandle, Direction, Identity, MechanismId, Secret,
    SecurityContext, StepOutcome,
};

pub const SHARED_PASSWORD: &str = "correct horse battery staple";
pub const TARGET_NAME: &str = "service/acceptor.example.com";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn identity(principal: &str) -> Identity {
    Identity::Password {
        principal: principal.to_string(),
        password: Secret::from(SHARED_PASSWORD.to_string()),
    }
}

/// One side of a negotiation: the credential plus a context bound to it.
pub struct Peer {
    pub credential: CredentialHandle,
    pub context: SecurityContext,
}

pub fn peer(principal: &str, direction: Direction) -> Peer {
    init_tracing();

    let credential = acquire_credential(MechanismId::Psk, direction, identity(principal)).unwrap();
    let context = SecurityContext::new(&credential).unwrap();

    Peer { credential, context }
}

/// Drives a client and a server through a full handshake, bouncing tokens
/// between them the way a transport would, and returns both established peers.
pub fn establish(requested: ContextFlags) -> (Peer, Peer) {
    let mut client = peer("client", Direction::Outbound);
    let mut server = peer("server", Direction::Inbound);

    let mut client_to_server = BufferDescriptor::token(Vec::new());
    let outcome = client
        .context
        .step_initiate(Some(TARGET_NAME), requested, None, &mut client_to_server)
        .unwrap();
    assert_eq!(outcome, StepOutcome::Continue);

    for _ in 0..5 {
        let mut server_to_client = BufferDescriptor::token(Vec::new());
        server
            .context
            .step_accept(&mut client_to_server, &mut server_to_client)
            .unwrap();

        let mut next = BufferDescriptor::token(Vec::new());
        let outcome = client
            .context
            .step_initiate(Some(TARGET_NAME), requested, Some(&mut server_to_client), &mut next)
            .unwrap();
        match outcome {
            StepOutcome::Continue => client_to_server = next,
            StepOutcome::Complete | StepOutcome::CompleteAndFinish => return (client, server),
        }
    }

    panic!("the PSK handshake should not exceed 5 round trips")
}
