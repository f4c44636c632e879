//! Credentials seam
//!
//! The pool never logs in or refreshes tokens itself. It waits for an
//! [`AuthProvider`] to report a login and re-reads the token every time it
//! sends a control message, so rotated tokens are picked up immediately.

use async_trait::async_trait;
use tokio::sync::watch;

/// Snapshot of the credentials in effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub access_token: String,
    pub user_id: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current credentials; called right before every LISTEN/UNLISTEN
    async fn get_auth(&self) -> AuthState;

    /// Suspends until valid credentials exist
    async fn wait_until_login(&self);
}

/// Provider backed by a token set from the outside (CLI, environment, tests)
#[derive(Debug)]
pub struct StaticAuth {
    state: watch::Sender<Option<AuthState>>,
}

impl StaticAuth {
    /// Provider that is logged in from the start
    pub fn new<T: Into<String>, U: Into<String>>(access_token: T, user_id: U) -> Self {
        let (state, _) = watch::channel(Some(AuthState {
            access_token: access_token.into(),
            user_id: user_id.into(),
        }));
        Self { state }
    }

    /// Provider that blocks `wait_until_login` until [`StaticAuth::login`] is called
    pub fn logged_out() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    pub fn login(&self, auth: AuthState) {
        self.state.send_replace(Some(auth));
    }

    /// Swap the access token, keeping the user
    pub fn rotate_token<T: Into<String>>(&self, access_token: T) {
        let access_token = access_token.into();
        self.state.send_modify(|state| match state {
            Some(auth) => auth.access_token = access_token,
            None => {
                *state = Some(AuthState {
                    access_token,
                    user_id: String::new(),
                })
            }
        });
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn get_auth(&self) -> AuthState {
        self.wait_until_login().await;
        self.state
            .borrow()
            .clone()
            .unwrap_or_else(|| AuthState {
                access_token: String::new(),
                user_id: String::new(),
            })
    }

    async fn wait_until_login(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|state| state.is_some()).await;
    }
}
