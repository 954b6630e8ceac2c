//! No library surface of its own; this crate only hosts integration tests
//! under `tests/` that exercise the `warden` crate end to end.
