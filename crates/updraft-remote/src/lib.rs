mod client;
mod types;

pub use client::LicenseServerClient;
pub use types::{
    is_newer_version, parse_envelope, ChunkHeaders, ChunkManifest, Credentials, RemoteSource,
    UpdateCheck,
};

#[cfg(test)]
mod tests;
