//! Authentication strategies for SSH connections.
//!
//! Each method is an [`AuthStrategy`]; sessions assemble an [`AuthChain`]
//! from their password, the context's identity store and, when enabled, the
//! system ssh-agent.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`IdentityAuth`]: Public keys from an [`IdentityStore`](crate::identity::IdentityStore)
//! - [`AgentAuth`]: System ssh-agent authentication

mod agent;
mod chain;
mod identity;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use identity::IdentityAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
