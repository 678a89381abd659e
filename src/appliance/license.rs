//! License token verification
//!
//! A license token is the appliance registration key encrypted with
//! AES-CBC/PKCS#7 and base64 encoded. The first 16 bytes of the key double
//! as the IV; this is a fixed format, not a recommendation.

use aws_lc_rs::cipher::{
    DecryptionContext, PaddedBlockDecryptingKey, UnboundCipherKey, AES_128, AES_192, AES_256,
};
use aws_lc_rs::iv::FixedLength;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use tracing::{info, warn};

use super::Appliance;
use crate::error::LicenseError;
use crate::Error;

/// Result of a successful decryption
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LicenseStatus {
    /// Plaintext equals the registration key
    Match,
    /// Token decrypted but names a different key
    Mismatch,
}

/// Decrypt `token` with `key` and compare it to `registration_key`
pub fn verify(token: &str, key: &str, registration_key: &str) -> Result<LicenseStatus, LicenseError> {
    let plaintext = decrypt(token, key.as_bytes())?;
    if plaintext == registration_key.as_bytes() {
        Ok(LicenseStatus::Match)
    } else {
        Ok(LicenseStatus::Mismatch)
    }
}

/// Fetch the registration key from the appliance and verify against it
pub async fn verify_with(
    appliance: &dyn Appliance,
    token: &str,
    key: &str,
) -> Result<LicenseStatus, Error> {
    let report = appliance.license().await?;
    let registration_key = registration_key(&report)?;
    let status = verify(token, key, &registration_key)?;
    match status {
        LicenseStatus::Match => info!("license verified"),
        LicenseStatus::Mismatch => warn!("license token does not match appliance registration key"),
    }
    Ok(status)
}

/// Extract `entries.*.nestedStats.entries.registrationKey.description`
pub fn registration_key(report: &Value) -> Result<String, LicenseError> {
    report
        .get("entries")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|entries| entries.values())
        .find_map(|entry| {
            entry
                .pointer("/nestedStats/entries/registrationKey/description")
                .and_then(Value::as_str)
        })
        .map(String::from)
        .ok_or_else(|| LicenseError::Registration("no registrationKey entry".to_string()))
}

fn decrypt(token: &str, key: &[u8]) -> Result<Vec<u8>, LicenseError> {
    let mut buf = STANDARD
        .decode(token.trim())
        .map_err(|e| LicenseError::Decode(e.to_string()))?;

    let algorithm = match key.len() {
        16 => &AES_128,
        24 => &AES_192,
        32 => &AES_256,
        n => return Err(LicenseError::KeyLength(n)),
    };
    let iv: [u8; 16] = key[..16]
        .try_into()
        .map_err(|_| LicenseError::KeyLength(key.len()))?;

    let cipher_key = UnboundCipherKey::new(algorithm, key).map_err(|_| LicenseError::Decrypt)?;
    let decrypting =
        PaddedBlockDecryptingKey::cbc_pkcs7(cipher_key).map_err(|_| LicenseError::Decrypt)?;
    let plaintext = decrypting
        .decrypt(&mut buf, DecryptionContext::Iv128(FixedLength::from(iv)))
        .map_err(|_| LicenseError::Decrypt)?;
    Ok(plaintext.to_vec())
}
