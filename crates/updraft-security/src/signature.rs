use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use sha2::Sha224;

type HmacSha224 = Hmac<Sha224>;

/// Hex HMAC-SHA224 of `license_key + site_url` keyed with `secret`.
///
/// The license server recomputes this value to bind a download to the
/// installation that requested it.
pub fn license_signature(license_key: &str, site_url: &str, secret: &str) -> Result<String> {
    let mut mac = HmacSha224::new_from_slice(secret.as_bytes())
        .map_err(|err| anyhow!("invalid license signing secret: {err}"))?;
    mac.update(license_key.as_bytes());
    mac.update(site_url.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
