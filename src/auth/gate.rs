//! Access decisions for protected routes.

use super::{SessionBinder, SessionId};
use crate::saml::SamlIdentity;

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Authenticated(SamlIdentity),
    Anonymous,
}

/// Decides whether a request carries a live session.
#[derive(Clone)]
pub struct AccessGate {
    binder: SessionBinder,
}

impl AccessGate {
    pub fn new(binder: SessionBinder) -> Self {
        Self { binder }
    }

    /// Check the raw session cookie value, if any.
    pub async fn check(&self, session_cookie: Option<&str>) -> Access {
        let Some(id) = session_cookie.and_then(SessionId::parse) else {
            return Access::Anonymous;
        };
        match self.binder.resolve(&id).await {
            Some(identity) => Access::Authenticated(identity),
            None => Access::Anonymous,
        }
    }
}
