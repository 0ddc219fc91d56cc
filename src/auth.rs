//! Pre-shared token authentication for WebSocket connections.
//!
//! Every connection must present a valid auth frame within
//! [`AUTH_TIMEOUT`] of the WebSocket handshake completing. The token check is
//! constant-time, and the non-standard close codes used for admission and
//! authentication failures live here so the gateway and tests agree on them.

use std::time::Duration;

/// Window a connection has to authenticate after the WS handshake.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code: peer address failed the origin filter.
pub const CLOSE_ORIGIN_DENIED: u16 = 4000;
/// Close code: no valid auth frame within [`AUTH_TIMEOUT`].
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
/// Close code: auth frame carried a bad token.
pub const CLOSE_INVALID_TOKEN: u16 = 4003;

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Unequal lengths fold into the accumulator rather than returning early, and
/// the loop always covers the full length of `expected`, so response timing
/// reveals nothing about either the key or the candidate. Bytes of a
/// too-long candidate beyond `expected.len()` are never sampled.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Verify a presented token against the stored one.
pub fn verify_token(expected: &str, provided: &str) -> bool {
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}
