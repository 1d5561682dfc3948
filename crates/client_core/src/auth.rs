//! Sign-in session and the bearer-token capability handed to service clients.

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio_stream::wrappers::WatchStream;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInState {
    /// The identity provider has not reported yet.
    Loading,
    SignedOut,
    SignedIn { email: String },
}

impl SignInState {
    pub fn is_signed_in(&self) -> bool {
        matches!(self, SignInState::SignedIn { .. })
    }
}

/// Supplies the bearer token for the current session, fetched per request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

pub struct AuthSession {
    state: watch::Sender<SignInState>,
    token: RwLock<Option<String>>,
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSession {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SignInState::Loading);
        Self {
            state,
            token: RwLock::new(None),
        }
    }

    pub async fn sign_in(&self, email: impl Into<String>, id_token: impl Into<String>) {
        let email = email.into();
        *self.token.write().await = Some(id_token.into());
        info!(email = %email, "auth: signed in");
        self.state.send_replace(SignInState::SignedIn { email });
    }

    pub async fn sign_out(&self) {
        self.token.write().await.take();
        info!("auth: signed out");
        self.state.send_replace(SignInState::SignedOut);
    }

    pub fn current(&self) -> SignInState {
        self.state.borrow().clone()
    }

    /// Yields the current state immediately, then every change.
    pub fn subscribe(&self) -> WatchStream<SignInState> {
        WatchStream::new(self.state.subscribe())
    }
}

#[async_trait]
impl TokenProvider for AuthSession {
    async fn bearer_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }
}
