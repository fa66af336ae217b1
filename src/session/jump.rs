//! Sessions chained through jump hosts.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, info};

use super::Session;
use crate::error::{Error, Result};
use crate::forward;

/// An ordered chain of sessions where each hop after the first is reached
/// through a local port forward on the hop before it.
///
/// The last hop is the target; channels are opened on it through
/// [`JumpSession::target`].
#[derive(Debug)]
pub struct JumpSession {
    hops: Vec<Session>,
}

impl JumpSession {
    /// Chain `hops`, first hop first.
    pub fn new(hops: Vec<Session>) -> Result<Self> {
        if hops.is_empty() {
            return Err(Error::InvalidArguments {
                command: "jump-session".to_string(),
                reason: "at least one session is required".to_string(),
            });
        }
        Ok(Self { hops })
    }

    pub fn hops(&self) -> &[Session] {
        &self.hops
    }

    /// The final hop.
    pub fn target(&self) -> &Session {
        // `new` guarantees at least one hop.
        &self.hops[self.hops.len() - 1]
    }

    /// Connected when every hop is.
    pub fn is_connected(&self) -> bool {
        self.hops.iter().all(Session::is_connected)
    }

    /// Connect every hop in order.
    ///
    /// Hop `n` is dialled at `localhost:<forwarded port>` through hop `n-1`
    /// while its host key is checked under its own host name. If any hop
    /// fails, hops already connected are disconnected again.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.disconnect().await;

        let result = self.connect_hops().await;
        if result.is_err() {
            self.disconnect().await;
        }
        result
    }

    async fn connect_hops(&mut self) -> Result<()> {
        self.hops[0].connect().await?;

        for i in 1..self.hops.len() {
            let (done, rest) = self.hops.split_at_mut(i);
            let previous = &done[i - 1];
            let hop = &mut rest[0];

            let local_port =
                forward::forward_local_port(previous, 0, hop.port(), Some(hop.host())).await?;
            debug!(
                "Hop {} ({}:{}) reachable at localhost:{}",
                i,
                hop.host(),
                hop.port(),
                local_port
            );

            let alias = hop.host().to_string();
            hop.connect_via(Some(("localhost", local_port)), None, Some(&alias))
                .await?;
        }

        info!(
            "Jump session to {}:{} connected through {} hop(s)",
            self.target().host(),
            self.target().port(),
            self.hops.len() - 1
        );
        Ok(())
    }

    /// Disconnect every hop, last hop first.
    pub async fn disconnect(&mut self) {
        for hop in self.hops.iter_mut().rev() {
            hop.disconnect().await;
        }
    }

    /// Run `f` against the target with the whole chain connected.
    ///
    /// Mirrors [`Session::with_connection`]: the chain is only torn down
    /// again when this call connected it.
    pub async fn with_connection<T>(
        &mut self,
        f: impl AsyncFnOnce(&Session) -> Result<T>,
    ) -> Result<T> {
        let connected_here = !self.is_connected();
        if connected_here {
            self.connect().await?;
        }

        let outcome = AssertUnwindSafe(f(self.target())).catch_unwind().await;

        if connected_here {
            self.disconnect().await;
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain_rejected() {
        assert!(matches!(
            JumpSession::new(Vec::new()),
            Err(Error::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_target_is_last_hop() {
        let jump = JumpSession::new(vec![
            Session::new("bastion"),
            Session::new("internal").with_port(2222),
        ])
        .unwrap();
        assert_eq!(jump.target().host(), "internal");
        assert_eq!(jump.target().port(), 2222);
        assert_eq!(jump.hops().len(), 2);
        assert!(!jump.is_connected());
    }

    #[tokio::test]
    async fn test_failed_first_hop_leaves_chain_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let context = crate::context::SshContext::shared().with_config(
            crate::config::ClientConfig::default()
                .with_system_agent(false)
                .with_connect_timeout(std::time::Duration::from_secs(2)),
        );
        let mut jump = JumpSession::new(vec![
            Session::new("127.0.0.1")
                .with_port(port)
                .with_context(context.clone()),
            Session::new("internal").with_context(context),
        ])
        .unwrap();

        assert!(matches!(jump.connect().await, Err(Error::Connection { .. })));
        assert!(!jump.is_connected());
    }
}
