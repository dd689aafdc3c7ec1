use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// `code_challenge_method` sent alongside every challenge.
pub const CHALLENGE_METHOD: &str = "S256";

/// Generates a cryptographically random PKCE code verifier.
///
/// 48 random bytes encode to 64 URL-safe characters (RFC 7636 allows 43-128).
#[must_use]
pub fn generate_code_verifier() -> String {
    let mut random_bytes = [0u8; 48];
    rand::rng().fill(&mut random_bytes);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
