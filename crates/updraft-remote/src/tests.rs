use std::time::Duration;

use updraft_core::{UpdateConfig, UpdateError};

use super::*;

fn sample_client() -> LicenseServerClient {
    LicenseServerClient::new(
        "https://licenses.example.test/api/",
        Credentials {
            license_key: "LIC-123".to_string(),
            product_uid: "shop".to_string(),
            site_url: "https://shop.example.test".to_string(),
            signing_secret: "secret".to_string(),
        },
        Duration::from_secs(30),
        Duration::from_secs(300),
    )
    .expect("client must build")
}

#[test]
fn endpoint_urls_follow_v2_layout() {
    let client = sample_client();
    assert_eq!(
        client.update_info_url(),
        "https://licenses.example.test/api/v2/update-info/LIC-123/shop"
    );
    assert_eq!(
        client.chunk_manifest_url(),
        "https://licenses.example.test/api/v2/update-manifest/LIC-123/shop/chunks"
    );
    assert_eq!(
        client.chunk_url(7),
        "https://licenses.example.test/api/v2/download-chunk/LIC-123/shop/7"
    );
}

#[test]
fn every_request_carries_site_and_signature() {
    let client = sample_client();
    let params = client.query_params(&[("version", "2.1.0")]);
    assert_eq!(
        params,
        vec![
            ("site", "https://shop.example.test"),
            ("has", "693c2ad371efd125ea2a10d1bbd39074f9b429176823bb175dc2b977"),
            ("version", "2.1.0"),
        ]
    );
}

#[test]
fn client_builds_from_config() {
    let mut config = UpdateConfig::default();
    config.server.base_url = "https://licenses.example.test".to_string();
    config.server.license_key = "LIC-1".to_string();
    config.server.product_uid = "p".to_string();
    let client = LicenseServerClient::from_config(&config).expect("client must build");
    assert_eq!(
        client.chunk_url(0),
        "https://licenses.example.test/v2/download-chunk/LIC-1/p/0"
    );
}

#[test]
fn envelope_yields_data_on_success() {
    let body = r#"{"success":true,"data":{"total_chunks":3,"chunk_size":10,"total_size":25,"zip_hash":"abc"}}"#;
    let manifest: ChunkManifest = parse_envelope(body, "chunk manifest").expect("must parse");
    assert_eq!(manifest.total_chunks, 3);
    assert_eq!(manifest.total_size, 25);
    assert_eq!(manifest.archive_hash.as_deref(), Some("abc"));
    assert_eq!(manifest.total_files, None);
}

#[test]
fn envelope_failure_surfaces_server_message() {
    let body = r#"{"success":false,"message":"license expired"}"#;
    let err = parse_envelope::<UpdateCheck>(body, "update check").expect_err("must fail");
    assert!(matches!(err, UpdateError::Network(ref message) if message == "license expired"));
    assert!(err.is_recoverable());

    let err = parse_envelope::<UpdateCheck>("<html>", "update check").expect_err("must fail");
    assert!(err.to_string().contains("invalid update check response"));

    let err =
        parse_envelope::<UpdateCheck>(r#"{"success":true}"#, "update check").expect_err("must fail");
    assert!(err.to_string().contains("has no data"));
}

#[test]
fn newer_version_uses_semver_ordering() {
    assert!(is_newer_version("2.0.0", "2.1.0"));
    assert!(is_newer_version("v2.9.0", "2.10.0"));
    assert!(!is_newer_version("2.1.0", "2.1.0"));
    assert!(!is_newer_version("2.1.0", "2.0.9"));
    assert!(!is_newer_version("2.1.0", ""));
    assert!(is_newer_version("unknown", "1.0"));
}
