//! Unit tests for tool settings.

use super::*;
use crate::test_support::settings;
use rstest::{fixture, rstest};

#[fixture]
fn base_settings() -> KisoSettings {
    settings()
}

fn assert_validation_rejects_field<F>(mut cfg: KisoSettings, field_name: &str, set_field: F)
where
    F: Fn(&mut KisoSettings, String),
{
    for invalid in ["", "  "] {
        set_field(&mut cfg, invalid.to_owned());
        let Err(err) = cfg.validate() else {
            panic!("{field_name} '{invalid}' should fail");
        };
        let SettingsError::InvalidConfig { ref field } = err else {
            panic!("expected InvalidConfig for {field_name}, got {err:?}");
        };
        assert_eq!(field, field_name, "expected invalid field {field_name}");
    }
}

#[rstest]
fn validate_accepts_defaults(base_settings: KisoSettings) {
    assert!(base_settings.validate().is_ok());
}

#[rstest]
#[case("ssh_bin")]
#[case("rsync_bin")]
#[case("scp_bin")]
#[case("ssh_user")]
#[case("remote_root")]
fn validate_rejects_blank_values(base_settings: KisoSettings, #[case] field: &str) {
    assert_validation_rejects_field(base_settings, field, |cfg, value| match field {
        "ssh_bin" => cfg.ssh_bin = value,
        "rsync_bin" => cfg.rsync_bin = value,
        "scp_bin" => cfg.scp_bin = value,
        "ssh_user" => cfg.ssh_user = value,
        _ => cfg.remote_root = value,
    });
}

#[rstest]
fn validate_rejects_blank_identity_file(base_settings: KisoSettings) {
    assert_validation_rejects_field(base_settings, "ssh_identity_file", |cfg, value| {
        cfg.ssh_identity_file = Some(value);
    });
}

#[rstest]
fn validate_rejects_zero_workers(base_settings: KisoSettings) {
    let cfg = KisoSettings {
        max_workers: 0,
        ..base_settings
    };
    let err = cfg.validate().err();
    assert_eq!(
        err,
        Some(SettingsError::ZeroLimit {
            field: String::from("max_workers")
        })
    );
}

#[rstest]
fn invalid_config_message_names_environment_variable() {
    let err = SettingsError::InvalidConfig {
        field: String::from("ssh_bin"),
    };
    assert_eq!(
        err.to_string(),
        "missing ssh_bin: set KISO_SSH_BIN or add ssh_bin to kiso.toml"
    );
}

#[rstest]
fn lifecycle_options_carry_retry_budget(base_settings: KisoSettings) {
    let cfg = KisoSettings {
        package_retries: 4,
        package_retry_delay_secs: 2,
        max_workers: 8,
        ..base_settings
    };
    let options = cfg.lifecycle_options();
    assert_eq!(options.max_workers, 8);
    assert_eq!(options.retry.attempts(), 4);
    assert_eq!(options.retry.delay(), Duration::from_secs(2));
    assert_eq!(options.remote_root, "kiso");
}
