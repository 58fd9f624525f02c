//! RP-initiated logout.
//!
//! Logging out clears the local session and hands back the provider's
//! end-session URL. The browser follows that URL; no request to the provider
//! is made from here.

use keygate_core::Result;
use tracing::{info, warn};
use url::Url;

use crate::error::ConfigError;
use crate::oidc::OidcConfig;
use crate::session::SessionStore;

/// Builds end-session redirects and clears local session state.
#[derive(Debug, Clone)]
pub struct LogoutCoordinator {
    end_session_url: Url,
}

impl LogoutCoordinator {
    /// Creates a coordinator for the given end-session endpoint.
    pub fn new(
        end_session_endpoint: &str,
        client_id: &str,
        post_logout_redirect_uri: &str,
    ) -> Result<Self, ConfigError> {
        let mut end_session_url =
            Url::parse(end_session_endpoint).map_err(|e| ConfigError::InvalidUrl {
                field: "end_session_endpoint",
                reason: e.to_string(),
            })?;
        end_session_url
            .query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("post_logout_redirect_uri", post_logout_redirect_uri);
        Ok(Self { end_session_url })
    }

    /// Creates a coordinator from OIDC configuration.
    pub fn from_config(config: &OidcConfig) -> Result<Self, ConfigError> {
        Self::new(
            &config.end_session_endpoint(),
            config.client_id(),
            &config.post_logout_redirect_uri()?,
        )
    }

    /// The URL the browser is sent to after local logout.
    #[must_use]
    pub fn end_session_url(&self) -> &Url {
        &self.end_session_url
    }

    /// Clears the session and returns the end-session URL.
    ///
    /// Safe to call on a session that is already logged out. A failure to
    /// clear the store is logged; the URL is returned regardless so the
    /// provider-side session still ends.
    pub async fn logout(&self, store: &dyn SessionStore) -> Url {
        match store.clear().await {
            Ok(()) => info!(session = %store.session_id(), "session logged out"),
            Err(e) => {
                warn!(session = %store.session_id(), error = %e, "failed to clear session at logout");
            }
        }
        self.end_session_url.clone()
    }
}
