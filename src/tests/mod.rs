//! End-to-end tests that drive the full router with an in-process test IdP.
