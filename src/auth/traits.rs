//! The seam every authentication method plugs into.

use async_trait::async_trait;
use russh::client;

use crate::session::SessionHandler;

/// One way of proving the user's identity to the server.
///
/// Strategies are tried in turn by [`super::AuthChain`] on a handle that has
/// finished key exchange but is not yet authenticated.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// `Ok(false)` when the server rejected the credentials, `Err` when the
    /// strategy could not make an attempt at all.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SessionHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Short label for logs and [`super::AuthChain`] listings.
    fn name(&self) -> &'static str;
}
