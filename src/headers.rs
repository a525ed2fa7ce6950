use base64::prelude::BASE64_STANDARD;
use base64::Engine;

/// Produces the HTTP headers a sync endpoint accepts on the upgrade
/// request: HTTP Basic credentials or a Sync Gateway session cookie.
#[derive(Debug, Clone)]
pub enum Authenticator {
    Basic { user: String, password: String },
    Session { id: String },
}

impl Authenticator {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Authenticator::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Authenticator::Session { id: id.into() }
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            Authenticator::Basic { user, password } => {
                let credentials = BASE64_STANDARD.encode(format!("{}:{}", user, password));
                vec![("Authorization".to_string(), format!("Basic {}", credentials))]
            }
            Authenticator::Session { id } => vec![(
                "Cookie".to_string(),
                format!("SyncGatewaySession={}", id),
            )],
        }
    }
}
