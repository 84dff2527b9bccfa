use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dix_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dix");
    path
}

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    config_path: PathBuf,
}

fn setup_test_env(revision: &str) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let alice = root.join("alice");
    fs::create_dir_all(alice.join("posts")).unwrap();
    fs::write(alice.join("profile.json"), r#"{"name": "alice"}"#).unwrap();
    fs::write(
        alice.join("posts/1.json"),
        r#"{"text": "hello", "createdAt": 1, "tags": ["intro"]}"#,
    )
    .unwrap();
    fs::write(
        alice.join("posts/2.json"),
        r#"{"text": "again", "createdAt": 2}"#,
    )
    .unwrap();
    fs::write(alice.join("posts/draft.json"), r#"{"title": "no text"}"#).unwrap();

    let config_path = config_dir.join("dix.toml");
    write_config(&config_path, &root, revision);

    TestEnv {
        _tmp: tmp,
        root,
        config_path,
    }
}

fn write_config(config_path: &Path, root: &Path, revision: &str) {
    let config_content = format!(
        r#"[db]
path = "{}/data/dix.sqlite"

[tables.profiles]
file_pattern = "/profile.json"
index = ["name"]

[tables.posts]
file_pattern = ["/posts/*.json"]
index = ["createdAt", "*tags"]
required = ["text"]
defaults = {{ tags = [] }}
revision = "{}"
"#,
        root.display(),
        revision
    );
    fs::write(config_path, config_content).unwrap();
}

fn run_dix(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dix_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dix binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn init_drive(env: &TestEnv) -> String {
    let dir = env.root.join("alice");
    let (stdout, stderr, success) = run_dix(&env.config_path, &["drive", "init", dir.to_str().unwrap()]);
    assert!(success, "drive init failed: stdout={}, stderr={}", stdout, stderr);
    let origin = stdout.trim().to_string();
    assert!(origin.starts_with("drive://"), "unexpected origin {}", origin);
    origin
}

fn index_alice(env: &TestEnv) -> String {
    let dir = env.root.join("alice");
    let (stdout, stderr, success) = run_dix(
        &env.config_path,
        &["index", dir.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn test_init_creates_database() {
    let env = setup_test_env("1");
    let (stdout, stderr, success) = run_dix(&env.config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(stdout.contains("rebuilt: posts"));
    assert!(env.root.join("data/dix.sqlite").exists());

    let (stdout, _, again) = run_dix(&env.config_path, &["init"]);
    assert!(again, "Second init failed (not idempotent)");
    assert!(!stdout.contains("rebuilt"));
}

#[test]
fn test_index_and_query() {
    let env = setup_test_env("1");
    let origin = init_drive(&env);

    let stdout = index_alice(&env);
    assert!(stdout.contains(&origin));

    let (stdout, _, success) = run_dix(&env.config_path, &["tables"]);
    assert!(success);
    let posts_line = stdout.lines().find(|l| l.starts_with("posts")).unwrap();
    assert!(posts_line.contains(" 2 "), "unexpected tables output: {}", stdout);

    let (stdout, _, success) = run_dix(
        &env.config_path,
        &["query", "posts", "--where", "createdAt", "--above", "1"],
    );
    assert!(success);
    assert_eq!(stdout.lines().count(), 1);
    assert!(stdout.contains("posts/2.json"));
    // defaults fill in missing fields
    assert!(stdout.contains(r#""tags":[]"#));

    let (stdout, _, success) = run_dix(
        &env.config_path,
        &["query", "posts", "--order-by", "createdAt", "--reverse", "--keys"],
    );
    assert!(success);
    assert_eq!(stdout.lines().collect::<Vec<_>>(), vec!["2", "1"]);

    let (stdout, _, success) = run_dix(
        &env.config_path,
        &["query", "posts", "--where", "tags", "--equals", "intro", "--count"],
    );
    assert!(success);
    assert_eq!(stdout.trim(), "1");

    let (stdout, _, success) = run_dix(&env.config_path, &["query", "profiles", "--urls"]);
    assert!(success);
    assert_eq!(stdout.trim(), format!("{}/profile.json", origin));

    let url = format!("{}/profile.json", origin);
    let (stdout, stderr, success) = run_dix(&env.config_path, &["get", "profiles", &url]);
    assert!(success, "get failed: {}", stderr);
    assert!(stdout.contains("\"alice\""));
}

#[test]
fn test_index_is_incremental() {
    let env = setup_test_env("1");
    let origin = init_drive(&env);
    index_alice(&env);

    let (stdout, _, _) = run_dix(&env.config_path, &["sources"]);
    let line = stdout.lines().find(|l| l.starts_with(&origin)).unwrap();
    assert!(line.trim_end().ends_with(" 4"), "unexpected sources output: {}", stdout);

    fs::remove_file(env.root.join("alice/posts/1.json")).unwrap();
    fs::write(
        env.root.join("alice/posts/3.json"),
        r#"{"text": "third", "createdAt": 3}"#,
    )
    .unwrap();
    index_alice(&env);

    let (stdout, _, _) = run_dix(&env.config_path, &["query", "posts", "--keys"]);
    let urls: Vec<&str> = stdout.lines().collect();
    assert_eq!(urls.len(), 2);
    assert!(urls.iter().all(|u| !u.contains("posts/1.json")));

    let (stdout, _, _) = run_dix(&env.config_path, &["sources"]);
    let line = stdout.lines().find(|l| l.starts_with(&origin)).unwrap();
    assert!(line.trim_end().ends_with(" 6"), "unexpected sources output: {}", stdout);
}

#[test]
fn test_config_change_rebuilds() {
    let env = setup_test_env("1");
    init_drive(&env);
    index_alice(&env);

    write_config(&env.config_path, &env.root, "2");
    let (stdout, _, _) = run_dix(&env.config_path, &["tables"]);
    let posts_line = stdout.lines().find(|l| l.starts_with("posts")).unwrap();
    assert!(posts_line.contains(" 0 "), "expected reset: {}", stdout);

    index_alice(&env);
    let (stdout, _, _) = run_dix(&env.config_path, &["query", "posts"]);
    assert_eq!(stdout.lines().count(), 2);
}

#[test]
fn test_unindex_removes_records() {
    let env = setup_test_env("1");
    init_drive(&env);
    index_alice(&env);

    let dir = env.root.join("alice");
    let (stdout, stderr, success) = run_dix(&env.config_path, &["unindex", dir.to_str().unwrap()]);
    assert!(success, "unindex failed: {}", stderr);
    assert!(stdout.contains("unindexed"));

    let (stdout, _, _) = run_dix(&env.config_path, &["query", "profiles"]);
    assert!(stdout.trim().is_empty());
    let (stdout, _, _) = run_dix(&env.config_path, &["sources"]);
    assert!(stdout.contains("no drives indexed"));
}

#[test]
fn test_errors_exit_nonzero() {
    let env = setup_test_env("1");

    let (_, _, success) = run_dix(&env.config_path, &["get", "nope", "drive://x/a.json"]);
    assert!(!success);

    let (_, _, success) = run_dix(&env.config_path, &["query", "posts", "--where", "missing", "--equals", "1"]);
    assert!(!success);

    let not_a_drive = env.root.join("plain");
    fs::create_dir_all(&not_a_drive).unwrap();
    let (_, stderr, success) = run_dix(&env.config_path, &["index", not_a_drive.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("not a drive"));
}
