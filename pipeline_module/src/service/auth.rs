use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Checks the caller's worker credential against the configured token.
/// An unconfigured token rejects every caller.
pub(super) fn verify_worker_credential(
    headers: &HeaderMap,
    expected: Option<&str>,
) -> Result<(), &'static str> {
    let Some(expected) = expected.filter(|value| !value.trim().is_empty()) else {
        return Err("worker_token_not_configured");
    };
    let provided = headers
        .get("x-worker-token")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| bearer_token(headers))
        .ok_or("missing_token")?;
    if !tokens_match(provided, expected)? {
        return Err("invalid_token");
    }
    Ok(())
}

/// Compares fixed-length MACs keyed by the expected token, so the check
/// takes the same time wherever the inputs first differ.
fn tokens_match(provided: &str, expected: &str) -> Result<bool, &'static str> {
    let mut reference =
        Hmac::<Sha256>::new_from_slice(expected.as_bytes()).map_err(|_| "bad_secret")?;
    reference.update(expected.as_bytes());
    let reference = reference.finalize().into_bytes();

    let mut mac = Hmac::<Sha256>::new_from_slice(expected.as_bytes()).map_err(|_| "bad_secret")?;
    mac.update(provided.as_bytes());
    Ok(mac.verify_slice(&reference).is_ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|token| !token.is_empty())
}
