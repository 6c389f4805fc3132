//! Security adapters: event signing and the policy gate.

pub mod policy;
pub mod signer;

pub use policy::PolicySecurityGate;
pub use signer::{HmacEventSigner, SigningError};
