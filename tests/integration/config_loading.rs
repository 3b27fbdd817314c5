//! Integration tests for layered configuration loading

use netricsa::config::{global_config_path, ConfigLoader, MarkerScope};
use netricsa::error::CoreError;
use std::fs;
use tempfile::TempDir;

use crate::integration::test_utils::with_config_env;

fn write(path: &std::path::Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

#[test]
fn test_defaults_without_any_file() {
    let test_dir = TempDir::new().unwrap();
    let workspace = test_dir.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let config = with_config_env(&test_dir, &[], || ConfigLoader::load(&workspace)).unwrap();
    assert_eq!(config.stream.flush_interval_ms, 2000);
    assert_eq!(config.stream.max_segment_chars, 1900);
    assert_eq!(config.persona.name, "Netricsa");
    assert_eq!(config.image_service.marker_scope, MarkerScope::All);
    assert!(config.validate().is_ok());
}

#[test]
fn test_workspace_file_overrides_global_file() {
    let test_dir = TempDir::new().unwrap();
    let workspace = test_dir.path().join("ws");
    write(
        &test_dir.path().join("xdg").join("netricsa").join("config.toml"),
        "[ollama]\nmodel = \"global-model\"\n\n[stream]\nsettle_delay_ms = 100\n",
    );
    write(
        &workspace.join("config").join("config.toml"),
        "[ollama]\nmodel = \"workspace-model\"\n",
    );

    let config = with_config_env(&test_dir, &[], || {
        assert_eq!(
            global_config_path().unwrap(),
            test_dir.path().join("xdg").join("netricsa").join("config.toml")
        );
        ConfigLoader::load(&workspace)
    })
    .unwrap();
    assert_eq!(config.ollama.model, "workspace-model");
    assert_eq!(config.stream.settle_delay_ms, 100);
}

#[test]
fn test_environment_file_selected_by_env_name() {
    let test_dir = TempDir::new().unwrap();
    let workspace = test_dir.path().join("ws");
    write(
        &workspace.join("config").join("config.toml"),
        "[stream]\nmax_segment_chars = 1500\n",
    );
    write(
        &workspace.join("config").join("production.toml"),
        "[stream]\nmax_segment_chars = 1800\n\n[image_service]\nmarker_scope = \"owner\"\n",
    );

    let config = with_config_env(&test_dir, &[("NETRICSA_ENV", "production")], || {
        ConfigLoader::load(&workspace)
    })
    .unwrap();
    assert_eq!(config.stream.max_segment_chars, 1800);
    assert_eq!(config.image_service.marker_scope, MarkerScope::Owner);
}

#[test]
fn test_environment_variable_wins_over_files() {
    let test_dir = TempDir::new().unwrap();
    let workspace = test_dir.path().join("ws");
    write(
        &workspace.join("config").join("config.toml"),
        "[stream]\nflush_interval_ms = 1000\n",
    );

    let config = with_config_env(
        &test_dir,
        &[("NETRICSA__STREAM__FLUSH_INTERVAL_MS", "500")],
        || ConfigLoader::load(&workspace),
    )
    .unwrap();
    assert_eq!(config.stream.flush_interval_ms, 500);
}

#[test]
fn test_explicit_missing_file_is_an_error() {
    let test_dir = TempDir::new().unwrap();
    let missing = test_dir.path().join("nope.toml");

    let err = with_config_env(&test_dir, &[], || ConfigLoader::load_from_file(&missing))
        .unwrap_err();
    assert!(matches!(err, CoreError::Config(msg) if msg.contains("not found")));
}

#[test]
fn test_invalid_values_are_reported_by_validate() {
    let config = ConfigLoader::from_toml_str(
        "[stream]\nmax_segment_chars = 10\nmin_first_unit_chars = 50\n\n[ollama]\nbase_url = \"ftp://x\"\n",
    )
    .unwrap();

    let problems = config.validate().unwrap_err();
    assert_eq!(problems.len(), 2);
}
