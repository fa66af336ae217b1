//! Password login, over `password` or `keyboard-interactive`.

use async_trait::async_trait;
use russh::MethodKind;
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use tracing::debug;

use crate::session::SessionHandler;

use super::traits::AuthStrategy;

/// Upper bound on info request rounds in one keyboard-interactive exchange.
const MAX_PROMPT_ROUNDS: usize = 8;

/// Sends the session password.
///
/// When the server refuses the `password` method but still offers
/// `keyboard-interactive`, the password is given as the answer to every
/// prompt instead. Servers that disable plain password logins in favour of
/// PAM prompts are reached this way.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    async fn keyboard_interactive(
        &self,
        handle: &mut client::Handle<SessionHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None)
            .await
            .map_err(|e| format!("Keyboard-interactive authentication failed: {}", e))?;

        for _ in 0..MAX_PROMPT_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { ref prompts, .. } => {
                    let replies = answers(prompts.len(), &self.password);
                    response = handle
                        .authenticate_keyboard_interactive_respond(replies)
                        .await
                        .map_err(|e| format!("Keyboard-interactive authentication failed: {}", e))?;
                }
            }
        }
        debug!("Giving up on keyboard-interactive after {} rounds", MAX_PROMPT_ROUNDS);
        Ok(false)
    }
}

/// Replies for one info request: the password for each prompt. An empty
/// request, which some servers send before the real one, gets no replies.
fn answers(prompts: usize, password: &str) -> Vec<String> {
    vec![password.to_string(); prompts]
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SessionHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        match result {
            AuthResult::Success => Ok(true),
            AuthResult::Failure {
                remaining_methods, ..
            } if remaining_methods
                .iter()
                .any(|method| *method == MethodKind::KeyboardInteractive) =>
            {
                debug!("Password refused, retrying over keyboard-interactive");
                self.keyboard_interactive(handle, username).await
            }
            AuthResult::Failure { .. } => Ok(false),
        }
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
