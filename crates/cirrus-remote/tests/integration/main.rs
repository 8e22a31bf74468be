//! Integration tests for cirrus-remote
//!
//! Uses wiremock to simulate the sync service and verifies the wire
//! format, status mapping and throttling behavior of the HTTP adapter.

mod common;

mod test_exchange;
mod test_notifications;
