mod checksum;
mod signature;

pub use checksum::{
    hashes_match, sha256_file_hex, sha256_hex, sha256_reader_hex, verify_sha256_file,
};
pub use signature::license_signature;
