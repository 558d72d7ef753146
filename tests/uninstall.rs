mod common;

use std::fs;

use assert_matches::assert_matches;

use common::{Fixture, GAPS, MAPPING, META, StaticCatalog, snapshot};
use ggd_manager::app::{InstallOptions, UninstallOptions};
use ggd_manager::catalog::Catalog;
use ggd_manager::domain::RequestedVersion;
use ggd_manager::error::GgdError;
use ggd_manager::output::JsonOutput;
use ggd_manager::package_manager::RemoveOutcome;
use ggd_manager::sync::MirrorStatus;
use ggd_manager::uninstall::{UninstallState, UninstallStatus};

fn install(fixture: &Fixture, name: &str, version: &str) {
    fixture
        .app()
        .install(
            InstallOptions {
                name: name.parse().unwrap(),
                version: version.parse::<RequestedVersion>().unwrap(),
                prefix: Some(fixture.env_a.clone()),
                channel: None,
                meta_recipe_id: None,
            },
            &JsonOutput,
        )
        .unwrap();
}

fn uninstall_options(fixture: &Fixture, name: &str) -> UninstallOptions {
    UninstallOptions {
        name: name.parse().unwrap(),
        prefix: Some(fixture.env_a.clone()),
        channel: None,
    }
}

/// Unrelated content a user already had in the environment.
fn seed_environment(fixture: &Fixture) {
    let activate = fixture.env_a.join("etc/conda/activate.d");
    let deactivate = fixture.env_a.join("etc/conda/deactivate.d");
    fs::create_dir_all(&activate).unwrap();
    fs::create_dir_all(&deactivate).unwrap();
    fs::write(activate.join("env_vars.sh"), "export JAVA_HOME=/opt/java\n").unwrap();
    fs::write(deactivate.join("env_vars.sh"), "unset JAVA_HOME\n").unwrap();
    let pkgs = fixture.env_a.join("pkgs");
    fs::create_dir_all(&pkgs).unwrap();
    fs::write(pkgs.join("samtools-1.9-h8571acd_11.tar.bz2"), b"samtools").unwrap();
}

#[test]
fn install_then_uninstall_restores_the_prefix() {
    let fixture = Fixture::new();
    seed_environment(&fixture);
    let before = snapshot(&fixture.env_a);

    install(&fixture, GAPS, "latest");
    assert_ne!(snapshot(&fixture.env_a), before);

    let result = fixture
        .app()
        .uninstall(uninstall_options(&fixture, GAPS), &JsonOutput)
        .unwrap();

    assert_eq!(result.status, UninstallStatus::Removed);
    assert_eq!(result.package_record, RemoveOutcome::Removed);
    assert!(result.in_catalog);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(
        result.states,
        vec![
            UninstallState::Requested,
            UninstallState::CatalogResolved,
            UninstallState::ExternalRecordRemoved,
            UninstallState::ResidueCleaned,
            UninstallState::MetadataSynced,
            UninstallState::Done,
        ]
    );
    assert!(
        result
            .removed_env_vars
            .contains(&"ggd_hg19_gaps_ucsc_v1_file".to_string())
    );
    assert!(fixture.conda.records(&fixture.env_a).is_empty());
    assert_eq!(snapshot(&fixture.env_a), before);
    assert!(!fixture.env_a.join("share").exists());
}

#[test]
fn fresh_prefix_round_trip_leaves_no_empty_directories() {
    let fixture = Fixture::new();
    let before = snapshot(&fixture.env_a);
    install(&fixture, MAPPING, "latest");
    install(&fixture, MAPPING, "1");
    assert!(fixture.env_a.join("share/ggd_info/channeldata.json").exists());

    let result = fixture
        .app()
        .uninstall(uninstall_options(&fixture, MAPPING), &JsonOutput)
        .unwrap();

    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(snapshot(&fixture.env_a), before);
    for leftover in ["share", "pkgs", "etc"] {
        assert!(!fixture.env_a.join(leftover).exists(), "{leftover} left behind");
    }
    let listed = fixture
        .app()
        .list(Some(fixture.env_a.clone()), &JsonOutput)
        .unwrap();
    assert!(listed.packages.is_empty());
    assert!(listed.generated_at.is_none());
}

#[test]
fn second_uninstall_is_a_no_op() {
    let fixture = Fixture::new();
    install(&fixture, GAPS, "latest");
    let app = fixture.app();
    app.uninstall(uninstall_options(&fixture, GAPS), &JsonOutput)
        .unwrap();

    let again = app
        .uninstall(uninstall_options(&fixture, GAPS), &JsonOutput)
        .unwrap();

    assert_eq!(again.status, UninstallStatus::NotInstalled);
    assert_eq!(again.package_record, RemoveOutcome::NotInstalled);
    assert!(again.removed_paths.is_empty());
}

#[test]
fn side_by_side_versions_are_all_removed() {
    let fixture = Fixture::new();
    install(&fixture, MAPPING, "latest");
    install(&fixture, MAPPING, "1");

    let result = fixture
        .app()
        .uninstall(uninstall_options(&fixture, MAPPING), &JsonOutput)
        .unwrap();

    assert_eq!(result.status, UninstallStatus::Removed);
    assert!(
        !fixture
            .storage_dir(&fixture.env_a, "Homo_sapiens", "hg38", MAPPING)
            .exists()
    );
    let activate = fixture.env_a.join("etc/conda/activate.d/env_vars.sh");
    assert!(!activate.exists());
}

#[test]
fn recipe_dropped_from_catalog_is_still_removed() {
    let fixture = Fixture::new();
    install(&fixture, GAPS, "latest");

    let result = fixture
        .app_with(StaticCatalog(Some(Catalog::empty(common::CHANNEL))))
        .uninstall(uninstall_options(&fixture, GAPS), &JsonOutput)
        .unwrap();

    assert_eq!(result.status, UninstallStatus::Removed);
    assert!(!result.in_catalog);
    assert!(
        !fixture
            .storage_dir(&fixture.env_a, "Homo_sapiens", "hg19", GAPS)
            .exists()
    );
}

#[test]
fn uninstall_proceeds_without_a_catalog() {
    let fixture = Fixture::new();
    install(&fixture, GAPS, "latest");

    let result = fixture
        .app_with(StaticCatalog(None))
        .uninstall(uninstall_options(&fixture, GAPS), &JsonOutput)
        .unwrap();

    assert_eq!(result.status, UninstallStatus::Removed);
    assert!(fixture.conda.records(&fixture.env_a).is_empty());
    assert!(
        !fixture
            .storage_dir(&fixture.env_a, "Homo_sapiens", "hg19", GAPS)
            .exists()
    );
}

#[test]
fn meta_recipe_instances_are_removed_with_their_package() {
    let fixture = Fixture::new();
    fixture
        .app()
        .install(
            InstallOptions {
                name: META.parse().unwrap(),
                version: RequestedVersion::Latest,
                prefix: Some(fixture.env_a.clone()),
                channel: None,
                meta_recipe_id: Some("GSE123".to_string()),
            },
            &JsonOutput,
        )
        .unwrap();

    let result = fixture
        .app()
        .uninstall(uninstall_options(&fixture, META), &JsonOutput)
        .unwrap();

    assert_eq!(result.status, UninstallStatus::Removed);
    assert!(
        !fixture
            .storage_dir(
                &fixture.env_a,
                "meta-recipe",
                "meta-recipe",
                "gse123-geo-accession-geo-v1"
            )
            .exists()
    );
    assert!(
        result
            .removed_env_vars
            .contains(&"ggd_gse123_geo_accession_geo_v1_dir".to_string())
    );
}

#[test]
fn uninstall_leaves_neighbouring_prefix_alone() {
    let fixture = Fixture::new();
    let app = fixture.app();
    install(&fixture, GAPS, "latest");
    app.install(
        InstallOptions {
            name: GAPS.parse().unwrap(),
            version: RequestedVersion::Latest,
            prefix: Some(fixture.env_ab.clone()),
            channel: None,
            meta_recipe_id: None,
        },
        &JsonOutput,
    )
    .unwrap();
    let before_ab = snapshot(&fixture.env_ab);

    app.uninstall(uninstall_options(&fixture, GAPS), &JsonOutput)
        .unwrap();

    assert_eq!(snapshot(&fixture.env_ab), before_ab);
    assert_eq!(fixture.conda.records(&fixture.env_ab).len(), 1);
}

#[test]
fn uninstall_rejects_an_invalid_prefix() {
    let fixture = Fixture::new();
    let mut options = uninstall_options(&fixture, GAPS);
    options.prefix = Some(fixture.root.join("missing"));

    let err = fixture.app().uninstall(options, &JsonOutput).unwrap_err();

    assert_matches!(err, GgdError::InvalidPrefix(_));
}

#[test]
fn list_reads_the_mirror_written_by_install() {
    let fixture = Fixture::new();
    let app = fixture.app();
    let empty = app.list(Some(fixture.env_a.clone()), &JsonOutput).unwrap();
    assert!(empty.packages.is_empty());
    assert!(empty.generated_at.is_none());

    install(&fixture, GAPS, "latest");
    let listed = app.list(Some(fixture.env_a.clone()), &JsonOutput).unwrap();

    assert_eq!(listed.packages.len(), 1);
    let entry = &listed.packages[0];
    assert_eq!(entry.name, GAPS);
    assert_eq!(entry.status, MirrorStatus::Installed);
    assert_eq!(entry.version.as_deref(), Some("1"));
    assert_eq!(entry.genome_build.as_deref(), Some("hg19"));
    assert!(
        listed
            .env_vars
            .iter()
            .any(|var| var.name == "ggd_hg19_gaps_ucsc_v1_dir")
    );
    assert_eq!(listed.inconsistent().count(), 0);
}

#[test]
fn refresh_flags_storage_deleted_behind_our_back() {
    let fixture = Fixture::new();
    install(&fixture, GAPS, "latest");
    fs::remove_dir_all(fixture.storage_dir(&fixture.env_a, "Homo_sapiens", "hg19", GAPS))
        .unwrap();

    let listed = fixture
        .app()
        .refresh_and_list(Some(fixture.env_a.clone()), None, &JsonOutput)
        .unwrap();

    let flagged: Vec<_> = listed.inconsistent().collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].status, MirrorStatus::MissingStorage);
}
