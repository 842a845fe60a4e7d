//! MD5 challenge/response digest for `connect_client_auth`.
//!
//! The digest is MD5 over a fixed 128-byte buffer: the password (up to 32
//! bytes) at the front, the 64-byte server challenge in the middle, and
//! the password again right-aligned at the end, with zero fill elsewhere.
//! This mirrors the scheme NDMP servers implement.

use md5::{Digest, Md5};

pub const MD5_CHALLENGE_LENGTH: usize = 64;
pub const MD5_DIGEST_LENGTH: usize = 16;

pub fn md5_digest(
    password: &str,
    challenge: &[u8; MD5_CHALLENGE_LENGTH],
) -> [u8; MD5_DIGEST_LENGTH] {
    let mut buf = [0u8; 128];
    let pw = password.as_bytes();
    let len = pw.len().min(32);

    buf[..len].copy_from_slice(&pw[..len]);
    buf[32..96].copy_from_slice(challenge);
    buf[128 - len..].copy_from_slice(&pw[..len]);

    let mut digest = [0u8; MD5_DIGEST_LENGTH];
    digest.copy_from_slice(&Md5::digest(buf));
    digest
}
