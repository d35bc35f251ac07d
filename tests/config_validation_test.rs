use std::time::Duration;

use coursemedia::config::{
    AppConfig, CacheSection, S3StorageSection, StorageBackendKind, StorageSection,
};
use coursemedia::storage::StorageConfig;

fn s3_section(bucket: &str) -> S3StorageSection {
    S3StorageSection {
        bucket: bucket.into(),
        region: Some("eu-west-1".into()),
        endpoint: Some("https://minio.internal:9000".into()),
        ..Default::default()
    }
}

#[test]
fn defaults_resolve_to_local_backend() {
    let config = AppConfig::default();
    let (media, storage) = config
        .media_runtime()
        .expect("default configuration should be valid");

    assert!(matches!(storage, StorageConfig::Local { ref root_path } if root_path == "./data"));
    assert_eq!(media.location, "");
    assert!(media.file_overwrite);
    assert_eq!(media.default_acl.as_deref(), Some("public-read"));
    assert_eq!(media.expire, Duration::from_secs(3600));
    assert_eq!(media.file_buffer_size, 5 * 1024 * 1024);
    assert!(media.cache.enabled);
    assert!(media.cache.ttl.is_none());
}

#[test]
fn s3_backend_requires_bucket() {
    let config = AppConfig {
        storage: StorageSection {
            backend: StorageBackendKind::S3,
            s3: Some(s3_section("  ")),
            ..Default::default()
        },
        ..Default::default()
    };

    let result = config.media_runtime();
    assert!(result.is_err(), "Expected empty bucket to fail validation");
}

#[test]
fn s3_backend_requires_section() {
    let config = AppConfig {
        storage: StorageSection {
            backend: StorageBackendKind::S3,
            s3: None,
            ..Default::default()
        },
        ..Default::default()
    };

    assert!(config.media_runtime().is_err());
}

#[test]
fn s3_settings_are_propagated() {
    let config = AppConfig {
        storage: StorageSection {
            backend: StorageBackendKind::S3,
            s3: Some(s3_section("course-media")),
            location: "/media/".into(),
            custom_domain: Some(" ".into()),
            default_acl: Some(String::new()),
            ..Default::default()
        },
        ..Default::default()
    };

    let (media, storage) = config
        .media_runtime()
        .expect("S3 configuration should be valid");

    assert_eq!(media.location, "media");
    assert!(media.custom_domain.is_none());
    assert!(media.default_acl.is_none());

    match storage {
        StorageConfig::S3(settings) => {
            assert_eq!(settings.bucket, "course-media");
            assert_eq!(settings.region.as_deref(), Some("eu-west-1"));
            assert_eq!(
                settings.endpoint.as_deref(),
                Some("https://minio.internal:9000")
            );
            assert!(settings.use_ssl);
        }
        other => panic!("Unexpected storage config: {other:?}"),
    }
}

#[test]
fn s3_credentials_must_be_paired() {
    let config = AppConfig {
        storage: StorageSection {
            backend: StorageBackendKind::S3,
            s3: Some(S3StorageSection {
                access_key: Some("AKIA".into()),
                ..s3_section("course-media")
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    assert!(config.media_runtime().is_err());
}

#[test]
fn s3_buffer_size_below_part_minimum_is_rejected() {
    let config = AppConfig {
        storage: StorageSection {
            backend: StorageBackendKind::S3,
            s3: Some(s3_section("course-media")),
            file_buffer_size: 1024,
            ..Default::default()
        },
        ..Default::default()
    };

    assert!(config.media_runtime().is_err());
}

#[test]
fn unknown_charset_is_rejected() {
    let config = AppConfig {
        storage: StorageSection {
            file_name_charset: "latin-1".into(),
            ..Default::default()
        },
        ..Default::default()
    };

    assert!(config.media_runtime().is_err());
}

#[test]
fn cache_ttl_is_converted() {
    let config = AppConfig {
        cache: CacheSection {
            preload_metadata: false,
            ttl_secs: Some(30),
        },
        ..Default::default()
    };

    let (media, _) = config.media_runtime().unwrap();
    assert!(!media.cache.enabled);
    assert_eq!(media.cache.ttl, Some(Duration::from_secs(30)));

    let zero_ttl = AppConfig {
        cache: CacheSection {
            preload_metadata: true,
            ttl_secs: Some(0),
        },
        ..Default::default()
    };
    assert!(zero_ttl.media_runtime().is_err());
}
