//! Table reader test suites.

mod helpers;
