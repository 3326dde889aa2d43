mod binder;
mod error;
mod gate;
pub mod session_store;

pub use binder::SessionBinder;
pub use error::AuthError;
pub use gate::{Access, AccessGate};
pub use session_store::{
    MemorySessionStore, PendingAuthRequest, SessionError, SessionId, SessionStore,
    SharedSessionStore,
};
