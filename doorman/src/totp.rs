//! Time-based one-time codes (RFC 6238).
//!
//! Parameters match the usual authenticator apps so clients can enroll by QR
//! code: HMAC-SHA1, 30 second step, 6 digits.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::ConfigError;

type HmacSha1 = Hmac<Sha1>;

/// Length of one code period in seconds.
pub const PERIOD: i64 = 30;
const DIGITS: u32 = 6;

/// Anything that can produce the rotating code valid at a given instant.
pub trait CodeSource {
    fn code_at(&self, epoch: i64) -> String;
}

#[derive(Clone)]
pub struct Totp {
    mac: HmacSha1,
}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Totp").finish_non_exhaustive()
    }
}

impl Totp {
    /// Builds a generator from a base32 secret. Case, whitespace and `=`
    /// padding are ignored.
    pub fn from_base32(secret: &str) -> Result<Self, ConfigError> {
        let cleaned: String = secret
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let key = BASE32_NOPAD
            .decode(cleaned.as_bytes())
            .map_err(|e| ConfigError::InvalidValue {
                field: "secret".into(),
                message: format!("not valid base32: {}", e),
            })?;
        if key.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "secret".into(),
                message: "empty secret".into(),
            });
        }
        let mac = HmacSha1::new_from_slice(&key).map_err(|e| ConfigError::InvalidValue {
            field: "secret".into(),
            message: e.to_string(),
        })?;
        Ok(Self { mac })
    }

    pub fn now(&self) -> String {
        self.code_at(crate::now_unix())
    }
}

impl CodeSource for Totp {
    fn code_at(&self, epoch: i64) -> String {
        let counter = epoch.div_euclid(PERIOD) as u64;
        let mut mac = self.mac.clone();
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let off = (digest[digest.len() - 1] & 0x0f) as usize;
        let bin = u32::from_be_bytes([digest[off], digest[off + 1], digest[off + 2], digest[off + 3]])
            & 0x7fff_ffff;
        format!("{:0width$}", bin % 10u32.pow(DIGITS), width = DIGITS as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // base32("12345678901234567890"), the RFC 6238 SHA-1 test key
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_vectors() {
        let totp = Totp::from_base32(RFC_SECRET).unwrap();
        assert_eq!(totp.code_at(59), "287082");
        assert_eq!(totp.code_at(1111111109), "081804");
        assert_eq!(totp.code_at(1234567890), "005924");
    }

    #[test]
    fn code_is_stable_within_a_period() {
        let totp = Totp::from_base32(RFC_SECRET).unwrap();
        assert_eq!(totp.code_at(1234567890), totp.code_at(1234567919));
        assert_eq!(totp.code_at(1234567920), "590587");
    }

    #[test]
    fn secret_parsing_is_lenient() {
        let a = Totp::from_base32(RFC_SECRET).unwrap();
        let b = Totp::from_base32("gezd gnbv gy3t qojq gezd gnbv gy3t qojq").unwrap();
        assert_eq!(a.code_at(59), b.code_at(59));
    }

    #[test]
    fn bad_secret_is_rejected() {
        assert!(Totp::from_base32("not base32!").is_err());
        assert!(Totp::from_base32("").is_err());
    }
}
