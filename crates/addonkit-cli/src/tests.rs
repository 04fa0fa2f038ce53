use super::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use addonkit_core::{
    Addon, AddonError, AddonLog, AddonVersion, ErrorKind, LogStatus, LogType, OperationOutcome,
};
use addonkit_lifecycle::{ConsistencyIssue, ConsistencyProblem, ConsistencyReport};
use clap::error::ErrorKind as ClapErrorKind;
use clap::{CommandFactory, Parser};

use crate::completion::{write_completions_script, CliCompletionShell};
use crate::config::{resolve_config, AddonsConfig, CONFIG_FILE_NAME};
use crate::render::{
    format_addon_lines, format_consistency_lines, format_log_lines, format_version_lines,
    render_outcome_line, render_status_line, resolve_output_style, OutputStyle,
};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "addonkit-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn sample_addon() -> Addon {
    Addon {
        id: 1,
        name: "demo".to_string(),
        thumb: String::new(),
        author: "local install".to_string(),
        path: PathBuf::from("/srv/addons/demo"),
        real_path: PathBuf::from("/srv/content/demo/2.0.0"),
        current_version_id: Some(2),
        prev_version_id: Some(1),
        created_at_unix: 100,
        updated_at_unix: 200,
    }
}

fn sample_version(id: i64, label: &str) -> AddonVersion {
    AddonVersion {
        id,
        addon_id: 1,
        version: label.to_string(),
        path: PathBuf::from(format!("/srv/content/demo/{label}")),
        archive_sha256: None,
        created_at_unix: 100 + id as u64,
    }
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn parses_switch_with_global_flags() {
    let cli = Cli::try_parse_from(["addonkit", "--plain", "switch", "demo", "7", "--root", "/tmp/a"])
        .expect("must parse");
    assert!(cli.plain);
    assert_eq!(cli.root.as_deref(), Some(Path::new("/tmp/a")));
    match cli.command {
        Commands::Switch { name, version_id } => {
            assert_eq!(name, "demo");
            assert_eq!(version_id, 7);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parses_logs_filters_and_default_limit() {
    let cli = Cli::try_parse_from(["addonkit", "logs", "demo", "--type", "dependency-install"])
        .expect("must parse");
    match cli.command {
        Commands::Logs {
            name,
            log_type,
            limit,
        } => {
            assert_eq!(name, "demo");
            assert_eq!(log_type, Some(LogType::DependencyInstall));
            assert_eq!(limit, 20);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn rejects_unknown_log_type_and_bad_version_id() {
    let err = Cli::try_parse_from(["addonkit", "logs", "demo", "--type", "upgrade"])
        .expect_err("unknown type");
    assert_eq!(err.kind(), ClapErrorKind::ValueValidation);

    let err = Cli::try_parse_from(["addonkit", "switch", "demo", "latest"])
        .expect_err("version id must be numeric");
    assert_eq!(err.kind(), ClapErrorKind::ValueValidation);
}

#[test]
fn config_parses_all_keys() {
    let config = AddonsConfig::from_toml_str(
        r#"
root = "/var/lib/addonkit"
database = "db/addons.sqlite3"
staging_dir = "/uploads"
content_dir = "content"
alias_dir = "public/addons"
log_filter = "debug"

[worker]
concurrency = 4
max_attempts = 5
retry_backoff_ms = 250
"#,
    )
    .expect("must parse");
    assert_eq!(config.root.as_deref(), Some(Path::new("/var/lib/addonkit")));
    assert_eq!(config.log_filter(), "debug");
    let options = config.worker_options();
    assert_eq!(options.concurrency, 4);
    assert_eq!(options.max_attempts, 5);
    assert_eq!(options.retry_backoff, Duration::from_millis(250));
}

#[test]
fn config_rejects_unknown_keys() {
    let err = AddonsConfig::from_toml_str("stagin_dir = \"typo\"\n").expect_err("typo");
    assert!(format!("{err:#}").contains("stagin_dir"), "{err:#}");

    let err = AddonsConfig::from_toml_str("[worker]\nthreads = 2\n").expect_err("typo");
    assert!(format!("{err:#}").contains("threads"), "{err:#}");
}

#[test]
fn config_defaults_clamp_worker_options() {
    let config = AddonsConfig::from_toml_str("[worker]\nconcurrency = 0\nmax_attempts = 0\n")
        .expect("must parse");
    let options = config.worker_options();
    assert_eq!(options.concurrency, 1);
    assert_eq!(options.max_attempts, 1);
    assert_eq!(options.retry_backoff, Duration::from_millis(500));
    assert_eq!(AddonsConfig::default().log_filter(), "info");
}

#[test]
fn resolve_reads_config_from_root_and_resolves_relative_paths() {
    let root = test_dir();
    fs::write(
        root.join(CONFIG_FILE_NAME),
        "database = \"db/addons.sqlite3\"\nalias_dir = \"/app/addons\"\nstaging_dir = \"uploads\"\n",
    )
    .expect("must write config");

    let resolved = resolve_config(Some(&root), None).expect("must resolve");
    assert_eq!(resolved.root, root);
    assert_eq!(resolved.source, Some(root.join(CONFIG_FILE_NAME)));
    let layout = resolved.layout();
    assert_eq!(layout.staging_dir(), root.join("uploads"));
    assert_eq!(layout.alias_dir(), Path::new("/app/addons"));
    assert_eq!(layout.content_dir(), root.join("content"));
    assert_eq!(
        resolved.database_path(&layout),
        root.join("db/addons.sqlite3")
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn resolve_without_config_uses_defaults() {
    let root = test_dir();
    let resolved = resolve_config(Some(&root), None).expect("must resolve");
    assert_eq!(resolved.source, None);
    assert_eq!(resolved.config, AddonsConfig::default());
    let layout = resolved.layout();
    assert_eq!(resolved.database_path(&layout), layout.database_path());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn explicit_config_supplies_root_unless_flag_overrides() {
    let dir = test_dir();
    let config_path = dir.join("custom.toml");
    let configured_root = dir.join("configured");
    fs::write(
        &config_path,
        format!("root = {:?}\n", configured_root.display().to_string()),
    )
    .expect("must write config");

    let resolved = resolve_config(None, Some(&config_path)).expect("must resolve");
    assert_eq!(resolved.root, configured_root);
    assert_eq!(resolved.source.as_deref(), Some(config_path.as_path()));

    let flagged = dir.join("flagged");
    let resolved = resolve_config(Some(&flagged), Some(&config_path)).expect("must resolve");
    assert_eq!(resolved.root, flagged);

    let err = resolve_config(None, Some(&dir.join("missing.toml"))).expect_err("missing");
    assert!(format!("{err:#}").contains("missing.toml"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn output_style_is_plain_off_terminal_or_on_request() {
    assert_eq!(resolve_output_style(true, true), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, false), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, true), OutputStyle::Rich);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "installed demo 1.0.0"),
        "installed demo 1.0.0"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "installed demo 1.0.0"),
        "[OK] installed demo 1.0.0"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "alias missing"),
        "[WARN] alias missing"
    );
}

#[test]
fn render_outcome_line_includes_error_kind() {
    let failure = OperationOutcome::failure(&AddonError::NoOpSwitch(3));
    assert_eq!(failure.error_kind, Some(ErrorKind::NoOpSwitch));
    assert_eq!(
        render_outcome_line(OutputStyle::Plain, &failure),
        "version 3 is already the active version (error=noop_switch)"
    );
    assert_eq!(
        render_outcome_line(OutputStyle::Rich, &OperationOutcome::success("done")),
        "[OK] done"
    );
}

#[test]
fn version_lines_mark_current_and_previous() {
    let addon = sample_addon();
    let versions = vec![
        sample_version(3, "3.0.0"),
        sample_version(2, "2.0.0"),
        sample_version(1, "1.0.0"),
    ];
    assert_eq!(
        format_version_lines(&addon, &versions),
        vec![
            "  3 3.0.0 created_at=103 path=/srv/content/demo/3.0.0".to_string(),
            "* 2 2.0.0 created_at=102 path=/srv/content/demo/2.0.0".to_string(),
            "- 1 1.0.0 created_at=101 path=/srv/content/demo/1.0.0".to_string(),
        ]
    );
}

#[test]
fn addon_lines_show_active_version() {
    let addon = sample_addon();
    assert_eq!(format_addon_lines(&[]), vec!["no addons installed".to_string()]);
    assert_eq!(
        format_addon_lines(&[(addon, Some(sample_version(2, "2.0.0")))]),
        vec!["demo 2.0.0 (version_id=2) author=local install alias=/srv/addons/demo".to_string()]
    );
}

#[test]
fn log_lines_render_status_badges() {
    let logs = vec![AddonLog {
        id: 9,
        addon_id: Some(1),
        addon_name: "demo".to_string(),
        log_type: LogType::Switch,
        status: LogStatus::Failure,
        message: "version 2 is already the active version".to_string(),
        created_at_unix: 500,
    }];
    assert_eq!(
        format_log_lines(OutputStyle::Rich, &logs),
        vec!["[ERR] 500 switch failure: version 2 is already the active version".to_string()]
    );
}

#[test]
fn consistency_lines_report_issues_or_clean_state() {
    let clean = ConsistencyReport {
        checked_addons: 2,
        ..ConsistencyReport::default()
    };
    assert_eq!(
        format_consistency_lines(OutputStyle::Plain, &clean),
        vec!["2 addon(s) consistent".to_string()]
    );

    let drifted = ConsistencyReport {
        checked_addons: 1,
        issues: vec![ConsistencyIssue {
            addon: "demo".to_string(),
            problem: ConsistencyProblem::AliasMissing {
                alias: PathBuf::from("/srv/addons/demo"),
            },
        }],
        unfinished_operations: Vec::new(),
    };
    assert_eq!(
        format_consistency_lines(OutputStyle::Rich, &drifted),
        vec!["[WARN] demo: alias /srv/addons/demo is missing".to_string()]
    );
}

#[test]
fn completions_script_names_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output).expect("must generate");
    let script = String::from_utf8(output).expect("utf8");
    assert!(script.contains("addonkit"));
    assert!(script.contains("add-version"));
}
