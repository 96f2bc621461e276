//! Opening the sealed upstream credentials stored on channels.
//!
//! Stored values carry a scheme prefix. `plain:` and unprefixed values are used
//! as-is; `b64:` values are base64-decoded. Deployments with a real KMS plug in
//! their own [`CredentialDecryptor`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("credential is empty")]
    Empty,
    #[error("invalid base64 credential: {0}")]
    Base64(String),
    #[error("credential is not valid UTF-8")]
    Utf8,
    #[error("unsupported credential scheme: {0}")]
    UnsupportedScheme(String),
}

pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, sealed: &str) -> Result<String, DecryptError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeDecryptor;

impl CredentialDecryptor for EnvelopeDecryptor {
    fn decrypt(&self, sealed: &str) -> Result<String, DecryptError> {
        let sealed = sealed.trim();
        let opened = match sealed.split_once(':') {
            Some(("plain", rest)) => rest.to_string(),
            Some(("b64", rest)) => {
                let bytes = STANDARD
                    .decode(rest.trim())
                    .map_err(|e| DecryptError::Base64(e.to_string()))?;
                String::from_utf8(bytes).map_err(|_| DecryptError::Utf8)?
            }
            Some((scheme, _)) if is_scheme(scheme) => {
                return Err(DecryptError::UnsupportedScheme(scheme.to_string()))
            }
            _ => sealed.to_string(),
        };
        if opened.is_empty() {
            return Err(DecryptError::Empty);
        }
        Ok(opened)
    }
}

/// Short lowercase tags like `kms` or `aes256`; anything else is a bare key
/// that happens to contain a colon.
fn is_scheme(tag: &str) -> bool {
    (2..=8).contains(&tag.len())
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelopes() {
        let d = EnvelopeDecryptor;
        assert_eq!(d.decrypt("sk-live-123").unwrap(), "sk-live-123");
        assert_eq!(d.decrypt("plain:sk-live-123").unwrap(), "sk-live-123");
        assert_eq!(d.decrypt("b64:c2stbGl2ZS0xMjM=").unwrap(), "sk-live-123");
    }

    #[test]
    fn test_failures() {
        let d = EnvelopeDecryptor;
        assert_eq!(d.decrypt(""), Err(DecryptError::Empty));
        assert_eq!(d.decrypt("plain:"), Err(DecryptError::Empty));
        assert!(matches!(d.decrypt("b64:!!!"), Err(DecryptError::Base64(_))));
        assert_eq!(
            d.decrypt("kms:arn-123"),
            Err(DecryptError::UnsupportedScheme("kms".to_string()))
        );
    }
}
