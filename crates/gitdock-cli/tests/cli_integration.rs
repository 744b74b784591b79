//! Integration tests for the gd CLI.
//!
//! Every test runs against its own registry and config directory, with
//! local `file://` remotes only.
//!
//! Run with: `cargo test --package gitdock-cli --test cli_integration`

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use git2::{Repository, RepositoryInitOptions, Signature};
use tempfile::TempDir;

/// An isolated environment for the gd binary.
struct Env {
    root: TempDir,
}

impl Env {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        for dir in ["data", "config", "clones", "work"] {
            fs::create_dir_all(root.path().join(dir)).unwrap();
        }
        Self { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Helper to run gd with given arguments.
    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_gd"))
            .current_dir(self.path("work"))
            .env("GITDOCK_DATA_DIR", self.path("data"))
            .env("GITDOCK_CLONE_ROOT", self.path("clones"))
            .env("XDG_CONFIG_HOME", self.path("config"))
            .env("HOME", self.root.path())
            .env_remove("GITHUB_TOKEN")
            .env_remove("GITDOCK_TIMEOUT_SECS")
            .args(args)
            .output()
            .expect("Failed to execute gd command")
    }

    fn stdout(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "gd {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).to_string()
    }
}

/// Create a repository with one commit on `main`.
fn create_repo(dir: &Path) -> Repository {
    let mut options = RepositoryInitOptions::new();
    options.initial_head("main");
    let repo = Repository::init_opts(dir, &options).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
    }

    fs::write(dir.join("README.md"), "hello\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    {
        let tree = repo.find_tree(tree_id).unwrap();
        let signature = Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
            .unwrap();
    }
    repo
}

/// A bare remote seeded with one commit, as a `file://` URL.
fn create_remote(env: &Env) -> String {
    let seed = env.path("seed");
    create_repo(&seed);
    let bare = env.path("remote.git");
    git2::build::RepoBuilder::new()
        .bare(true)
        .clone(seed.to_str().unwrap(), &bare)
        .unwrap();
    format!("file://{}", bare.display())
}

/// Id of the only managed repository, taken from `status --json`.
fn only_handle(env: &Env) -> String {
    let json: serde_json::Value = serde_json::from_str(&env.stdout(&["status", "--json"])).unwrap();
    let snapshots = json.as_array().unwrap();
    assert_eq!(snapshots.len(), 1);
    snapshots[0]["handle"].as_str().unwrap().to_string()
}

// =============================================================================
// Registry commands
// =============================================================================

#[test]
fn test_list_empty_registry() {
    let env = Env::new();
    let stdout = env.stdout(&["list"]);
    assert!(stdout.contains("No repositories managed yet"));
}

#[test]
fn test_import_list_remove() {
    let env = Env::new();
    let repo_dir = env.path("project");
    create_repo(&repo_dir);

    let stdout = env.stdout(&["import", repo_dir.to_str().unwrap()]);
    assert!(stdout.contains("Imported"));
    assert!(stdout.contains("main"));

    let stdout = env.stdout(&["list"]);
    assert!(stdout.contains("1 repositories"));
    assert!(stdout.contains("project"));

    // Importing twice is rejected.
    let output = env.run(&["import", repo_dir.to_str().unwrap()]);
    assert!(!output.status.success());

    let id = only_handle(&env);
    let stdout = env.stdout(&["remove", &id[..8]]);
    assert!(stdout.contains("Removed"));
    assert!(repo_dir.join("README.md").exists());
    assert!(env.stdout(&["list"]).contains("No repositories managed yet"));
}

#[test]
fn test_registry_survives_restart() {
    let env = Env::new();
    let repo_dir = env.path("project");
    create_repo(&repo_dir);
    env.stdout(&["import", repo_dir.to_str().unwrap()]);

    assert!(env.path("data").join("registry.json").exists());
    let stdout = env.stdout(&["status", repo_dir.to_str().unwrap()]);
    assert!(stdout.contains("Branch:    main"));
    assert!(stdout.contains("clean"));
}

#[test]
fn test_unknown_reference_fails() {
    let env = Env::new();
    let output = env.run(&["status", "deadbeef"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No managed repository"));
}

// =============================================================================
// Clone and sync
// =============================================================================

#[test]
fn test_clone_into_clone_root() {
    let env = Env::new();
    let url = create_remote(&env);

    let stdout = env.stdout(&["clone", &url]);
    assert!(stdout.contains("Clone complete"));
    assert!(env.path("clones").join("remote").join("README.md").exists());

    let stdout = env.stdout(&["fetch"]);
    assert!(stdout.contains("up to date"));
}

#[test]
fn test_commit_and_push() {
    let env = Env::new();
    let url = create_remote(&env);
    let target = env.path("checkout");
    env.stdout(&["clone", &url, target.to_str().unwrap()]);
    let id = only_handle(&env);

    fs::write(target.join("README.md"), "changed\n").unwrap();
    let stdout = env.stdout(&["status", &id]);
    assert!(stdout.contains("modified"));

    let stdout = env.stdout(&["commit", &id, "-m", "change readme"]);
    assert!(stdout.contains("Committed"));
    assert!(env.stdout(&["status", &id]).contains("↑1 ↓0"));

    let stdout = env.stdout(&["push", &id]);
    assert!(stdout.contains("Pushed main"));
    assert!(env.stdout(&["status", &id]).contains("up to date"));
}

#[test]
fn test_checkout_requires_force_with_changes() {
    let env = Env::new();
    let repo_dir = env.path("project");
    create_repo(&repo_dir);
    env.stdout(&["import", repo_dir.to_str().unwrap()]);
    let id = only_handle(&env);

    env.stdout(&["branch", "create", &id, "topic"]);
    fs::write(repo_dir.join("README.md"), "edited\n").unwrap();

    let output = env.run(&["checkout", &id, "topic"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--force"));
    assert_eq!(
        fs::read_to_string(repo_dir.join("README.md")).unwrap(),
        "edited\n"
    );

    env.stdout(&["checkout", &id, "topic", "--force"]);
    assert!(env.stdout(&["status", &id]).contains("Branch:    topic"));

    let output = env.run(&["branch", "delete", &id, "topic"]);
    assert!(!output.status.success(), "checked-out branch must not be deleted");
}

// =============================================================================
// History commands
// =============================================================================

#[test]
fn test_log_tag_and_diff() {
    let env = Env::new();
    let repo_dir = env.path("project");
    create_repo(&repo_dir);
    env.stdout(&["import", repo_dir.to_str().unwrap()]);
    let id = only_handle(&env);

    fs::write(repo_dir.join("README.md"), "hello\nworld\n").unwrap();
    let stdout = env.stdout(&["diff", &id]);
    assert!(stdout.contains("M README.md  +1 -0"), "{stdout}");
    assert!(stdout.contains("+world"), "{stdout}");
    assert!(env.stdout(&["diff", &id, "--staged"]).contains("No changes"));

    env.stdout(&["commit", &id, "-m", "add world"]);
    let stdout = env.stdout(&["log", &id]);
    let first = stdout.find("add world").unwrap();
    let second = stdout.find("initial").unwrap();
    assert!(first < second, "newest first: {stdout}");
    assert!(!env.stdout(&["log", &id, "-n", "1"]).contains("initial"));

    env.stdout(&["tag", "create", &id, "v1.0", "-m", "first release"]);
    let stdout = env.stdout(&["tag", "list", &id]);
    assert!(stdout.contains("v1.0"));
    assert!(stdout.contains("first release"));
    assert!(!env.run(&["tag", "create", &id, "v1.0"]).status.success());

    env.stdout(&["tag", "delete", &id, "v1.0"]);
    assert!(env.stdout(&["tag", "list", &id]).contains("No tags"));
}

#[test]
fn test_stash_save_and_pop() {
    let env = Env::new();
    let repo_dir = env.path("project");
    create_repo(&repo_dir);
    env.stdout(&["import", repo_dir.to_str().unwrap()]);
    let id = only_handle(&env);

    assert!(!env.run(&["stash", "save", &id]).status.success());

    fs::write(repo_dir.join("README.md"), "work in progress\n").unwrap();
    env.stdout(&["stash", "save", &id, "-m", "halfway"]);
    assert_eq!(
        fs::read_to_string(repo_dir.join("README.md")).unwrap(),
        "hello\n"
    );
    let stdout = env.stdout(&["stash", "list", &id]);
    assert!(stdout.contains("stash@{0}"));
    assert!(stdout.contains("halfway"));

    env.stdout(&["stash", "pop", &id]);
    assert_eq!(
        fs::read_to_string(repo_dir.join("README.md")).unwrap(),
        "work in progress\n"
    );
    assert!(env.stdout(&["stash", "list", &id]).contains("No stashes"));
}

// =============================================================================
// Config commands
// =============================================================================

#[test]
fn test_config_set_and_get() {
    let env = Env::new();
    env.stdout(&["config", "set", "max_retries", "5"]);
    assert_eq!(env.stdout(&["config", "get", "max_retries"]).trim(), "5");

    let output = env.run(&["config", "set", "max_retries", "many"]);
    assert!(!output.status.success());

    let output = env.run(&["config", "get", "no_such_key"]);
    assert!(!output.status.success());
}

#[test]
fn test_config_never_stores_token() {
    let env = Env::new();
    let output = env.run(&["config", "set", "github_token", "ghp_secret"]);
    assert!(!output.status.success());

    let stdout = env.stdout(&["config", "show"]);
    assert!(stdout.contains("(not set)"));
    assert!(!stdout.contains("ghp_secret"));
}
