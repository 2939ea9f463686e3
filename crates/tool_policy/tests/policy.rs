use std::fs;
use std::path::Path;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use tool_policy::{CommandPolicy, PolicyConfig, PolicyError, Verdict};

fn project() -> (TempDir, CommandPolicy) {
    let dir = TempDir::new().expect("tempdir");
    fs::create_dir_all(dir.path().join("src")).expect("src dir");
    fs::create_dir_all(dir.path().join(".git")).expect("git dir");
    fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").expect("main.rs");
    let policy = CommandPolicy::new(&PolicyConfig::default(), dir.path()).expect("policy");
    (dir, policy)
}

fn root(policy: &CommandPolicy) -> &Path {
    policy.root()
}

#[test]
fn relative_paths_inside_the_project_are_allowed() {
    let (_dir, policy) = project();
    let cwd = root(&policy);

    assert_eq!(
        policy.validate("read_file", &json!({"path": "src/main.rs"}), cwd),
        Verdict::Allow
    );
    assert_eq!(
        policy.validate("write_file", &json!({"path": "src/new/mod.rs", "content": ""}), cwd),
        Verdict::Allow
    );
    assert_eq!(
        policy.validate(
            "read_file",
            &json!({"path": "src/../src/./main.rs"}),
            &cwd.join("src")
        ),
        Verdict::Allow
    );
}

#[test]
fn traversal_absolute_and_malformed_paths_are_denied() {
    let (_dir, policy) = project();
    let cwd = root(&policy);

    for path in ["../outside.txt", "src/../../etc/passwd", "/etc/passwd", "", "a\0b"] {
        assert!(
            policy
                .validate("read_file", &json!({"path": path}), cwd)
                .is_denied(),
            "expected deny for {path:?}"
        );
    }

    let inside_absolute = cwd.join("src/main.rs");
    assert_eq!(
        policy.validate(
            "read_file",
            &json!({"path": inside_absolute.to_string_lossy()}),
            cwd
        ),
        Verdict::Allow
    );
}

#[cfg(unix)]
#[test]
fn symlink_escaping_the_project_is_denied() {
    let (dir, policy) = project();
    let outside = TempDir::new().expect("outside");
    fs::write(outside.path().join("secret.txt"), "s").expect("secret");
    std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).expect("symlink");

    let verdict = policy.validate(
        "read_file",
        &json!({"path": "link/secret.txt"}),
        root(&policy),
    );
    assert!(matches!(verdict, Verdict::Deny(reason) if reason.contains("outside the project root")));
}

#[cfg(unix)]
#[test]
fn dangling_symlink_pointing_outside_is_denied_for_reads_and_writes() {
    let (dir, policy) = project();
    let outside = TempDir::new().expect("outside");
    let target = outside.path().join("escaped.txt");
    std::os::unix::fs::symlink(&target, dir.path().join("evil")).expect("dangling symlink");
    fs::create_dir_all(dir.path().join("notes")).expect("notes dir");
    std::os::unix::fs::symlink(outside.path().join("gone"), dir.path().join("notes/link"))
        .expect("nested dangling symlink");
    let cwd = root(&policy);

    for (tool, args) in [
        ("write_file", json!({"path": "evil", "content": "pwned"})),
        ("edit_file", json!({"path": "evil", "edits": []})),
        ("read_file", json!({"path": "evil"})),
        ("write_file", json!({"path": "notes/link/deeper.txt", "content": "x"})),
    ] {
        let verdict = policy.validate(tool, &args, cwd);
        assert!(
            matches!(&verdict, Verdict::Deny(reason) if reason.contains("outside the project root")),
            "{tool} {args}: {verdict:?}"
        );
    }
    assert!(!target.exists());
}

#[cfg(unix)]
#[test]
fn dangling_symlink_inside_the_project_is_allowed() {
    let (dir, policy) = project();
    std::os::unix::fs::symlink("src/generated.rs", dir.path().join("alias.rs"))
        .expect("dangling in-project symlink");

    assert_eq!(
        policy.validate(
            "write_file",
            &json!({"path": "alias.rs", "content": ""}),
            root(&policy)
        ),
        Verdict::Allow
    );
}

#[test]
fn protected_paths_block_writes_but_not_reads() {
    let (_dir, policy) = project();
    let cwd = root(&policy);

    assert!(policy
        .validate("write_file", &json!({"path": ".git/config", "content": "x"}), cwd)
        .is_denied());
    assert!(policy
        .validate("edit_file", &json!({"path": ".agent/sessions/x.jsonl", "edits": []}), cwd)
        .is_denied());
    assert_eq!(
        policy.validate("read_file", &json!({"path": ".git/HEAD"}), cwd),
        Verdict::Allow
    );
}

#[test]
fn extra_protected_path_applies_after_construction() {
    let (_dir, mut policy) = project();
    policy.protect(Path::new("state"));
    let cwd = root(&policy).to_path_buf();

    assert!(policy
        .validate("write_file", &json!({"path": "state/data.json", "content": "{}"}), &cwd)
        .is_denied());
}

#[test]
fn plan_mode_denies_every_mutating_tool() {
    let (_dir, mut policy) = project();
    policy.set_read_only(true);
    let cwd = root(&policy).to_path_buf();

    for (tool, args) in [
        ("write_file", json!({"path": "a.txt", "content": "x"})),
        ("edit_file", json!({"path": "a.txt", "edits": []})),
        ("bash", json!({"command": "ls"})),
    ] {
        assert!(
            matches!(policy.validate(tool, &args, &cwd), Verdict::Deny(reason) if reason.contains("plan mode")),
            "{tool} should be denied in plan mode"
        );
    }
    assert_eq!(
        policy.validate("glob_files", &json!({"pattern": "src/**/*.rs"}), &cwd),
        Verdict::Allow
    );
}

#[test]
fn glob_and_grep_scopes_are_confined() {
    let (_dir, policy) = project();
    let cwd = root(&policy);

    assert!(policy
        .validate("glob_files", &json!({"pattern": "../**/*.rs"}), cwd)
        .is_denied());
    assert!(policy
        .validate("glob_files", &json!({"pattern": "/etc/*"}), cwd)
        .is_denied());
    assert!(policy
        .validate("grep_files", &json!({"pattern": "x", "path_scope": "../"}), cwd)
        .is_denied());
    assert_eq!(
        policy.validate("grep_files", &json!({"pattern": "fn main"}), cwd),
        Verdict::Allow
    );
}

#[test]
fn root_delete_is_denied_and_verdicts_are_deterministic() {
    let (_dir, policy) = project();
    let cwd = root(&policy);
    let args = json!({"command": "rm -rf /"});

    let first = policy.validate("bash", &args, cwd);
    let second = policy.validate("bash", &args, cwd);

    assert!(first.is_denied());
    assert_eq!(first, second);
}

#[test]
fn disabled_bash_is_denied() {
    let dir = TempDir::new().expect("tempdir");
    let policy = CommandPolicy::new(
        &PolicyConfig {
            allow_bash: false,
            ..PolicyConfig::default()
        },
        dir.path(),
    )
    .expect("policy");

    assert!(policy
        .validate("bash", &json!({"command": "ls"}), dir.path())
        .is_denied());
}

#[test]
fn invalid_patterns_and_missing_roots_fail_construction() {
    let dir = TempDir::new().expect("tempdir");
    let error = CommandPolicy::new(
        &PolicyConfig {
            deny_patterns: vec!["(unclosed".to_string()],
            ..PolicyConfig::default()
        },
        dir.path(),
    )
    .expect_err("invalid regex");
    assert!(matches!(error, PolicyError::InvalidPattern { list: "deny", .. }));

    let missing = dir.path().join("missing");
    let error =
        CommandPolicy::new(&PolicyConfig::default(), &missing).expect_err("missing root");
    assert!(matches!(error, PolicyError::ProjectRoot { .. }));
}

#[test]
fn policy_config_reads_toml_shaped_json_and_rejects_unknown_fields() {
    let config: PolicyConfig = serde_json::from_value(json!({
        "strict": true,
        "bash_checkpoint": "always"
    }))
    .expect("config");
    assert!(config.strict);
    assert!(!config.deny_patterns.is_empty());

    assert!(serde_json::from_value::<PolicyConfig>(json!({"sandbox": true})).is_err());
}
