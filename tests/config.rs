use std::fs;

use assert_matches::assert_matches;

use ggd_manager::config::{ChannelSettings, Config, ConfigLoader, DEFAULT_CHANNEL};
use ggd_manager::error::GgdError;

#[test]
fn resolve_reads_shorthand_and_detailed_channels() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("config.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "cache_dir": "/tmp/ggd-cache",
            "catalog_timeout_secs": 30,
            "extra_channels": ["conda-forge"],
            "channels": [
                "genomics",
                {"name": "proteomics", "catalog_url": "file:///mirror/proteomics.json"}
            ]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();

    assert_eq!(resolved.default_channel, DEFAULT_CHANNEL);
    assert_eq!(resolved.cache_dir, "/tmp/ggd-cache");
    assert_eq!(resolved.catalog_timeout.map(|timeout| timeout.as_secs()), Some(30));
    assert_eq!(
        resolved.channels,
        vec![
            ChannelSettings {
                name: "genomics".to_string(),
                catalog_url: None,
            },
            ChannelSettings {
                name: "proteomics".to_string(),
                catalog_url: Some("file:///mirror/proteomics.json".to_string()),
            },
        ]
    );
    assert_eq!(
        resolved.catalog_url_for("proteomics"),
        "file:///mirror/proteomics.json"
    );
    assert!(resolved.catalog_url_for("genomics").ends_with("/genomics/channeldata.json"));
    assert_eq!(
        resolved.conda_channels("genomics"),
        vec!["ggd-genomics".to_string(), "conda-forge".to_string()]
    );
}

#[test]
fn unreadable_and_malformed_configs_fail() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(missing.to_str()).unwrap_err();
    assert_matches!(err, GgdError::ConfigRead(_));

    let broken = temp.path().join("broken.json");
    fs::write(&broken, "{\"channels\": [1, 2]").unwrap();
    let err = ConfigLoader::resolve(broken.to_str()).unwrap_err();
    assert_matches!(err, GgdError::ConfigParse(_));
}

#[test]
fn path_like_channel_or_namespace_is_rejected() {
    let err = ConfigLoader::resolve_config(Config {
        default_channel: Some("../../etc".to_string()),
        cache_dir: Some("/tmp/ggd-cache".to_string()),
        ..Config::default()
    })
    .unwrap_err();
    assert_matches!(err, GgdError::InvalidChannel(ref channel) if channel == "../../etc");

    let err = ConfigLoader::resolve_config(Config {
        namespace: Some("ggd/../..".to_string()),
        cache_dir: Some("/tmp/ggd-cache".to_string()),
        ..Config::default()
    })
    .unwrap_err();
    assert_matches!(err, GgdError::ConfigParse(_));
}
