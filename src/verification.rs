use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Checks GitHub-style `X-Hub-Signature-256` headers against a shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    mac: HmacSha256,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    /// Returns `None` for an empty secret; an empty key would accept any
    /// sender that also knows it is empty.
    pub fn new(secret: impl AsRef<[u8]>) -> Option<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return None;
        }
        let mac = HmacSha256::new_from_slice(secret).ok()?;
        Some(Self { mac })
    }

    /// Verify a header value like "sha256=<hex>" over the raw body.
    pub fn verify(&self, body: &[u8], signature_header: &str) -> bool {
        let expected_hex = match signature_header.trim().strip_prefix(SIGNATURE_PREFIX) {
            Some(h) => h,
            None => return false,
        };

        let expected = match hex::decode(expected_hex) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        let mut mac = self.mac.clone();
        mac.update(body);

        // verify_slice compares in constant time
        mac.verify_slice(&expected).is_ok()
    }

    /// Produce the header value a sender would attach for `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
    }
}
