//! SPNEGO (RFC 4178) negotiation of the session-setup security blob
//!
//! The concrete mechanisms (NTLM, Kerberos) are outside this crate and plug in
//! through [`Mechanism`]. NEGOEX is provided here since it is itself a
//! negotiation layer over pluggable [`negoex::AuthScheme`]s.

pub mod context;
pub mod der;
pub mod negoex;
pub mod token;

pub use context::{MechStep, Mechanism, SecurityStatus, SpnegoAcceptor, SpnegoInitiator};
pub use der::Oid;
pub use token::{NegHints, NegState, NegTokenInit, NegTokenResp, NegotiationToken};
