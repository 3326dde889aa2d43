//! Background maintenance jobs.
//!
//! Workers run in a loop at a configured interval and are spawned on the
//! server's task tracker so shutdown can wait for them.

mod session_cleanup;

pub use session_cleanup::start_session_cleanup_worker;
