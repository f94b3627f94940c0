//! CLI tests: run the `docqa` binary against a backend started with
//! `docqa serve` in a child process.

use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn docqa_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docqa"))
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Writes a config and a three-page contract. Returns the temp root, the
/// config path, and the backend port.
fn setup_env() -> (TempDir, PathBuf, u16) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    fs::write(
        root.join("contract.txt"),
        "SUPPLY AGREEMENT\n\nThis Supply Agreement is made between Initech LLC and \
         Umbrella Holdings. The parties agree as follows.\x0c\
         Delivery. Initech LLC shall deliver goods within ten business days.\x0c\
         Termination. Either party may terminate with sixty days written notice. \
         The termination notice period starts on delivery of the notice.",
    )
    .unwrap();

    let port = free_port();
    let config = format!(
        r#"[db]
path = "{root}/data/docqa.sqlite"

[cache]
path = "{root}/data/cache.sqlite"

[server]
bind = "127.0.0.1:{port}"

[backend]
url = "http://127.0.0.1:{port}"
probe_timeout_secs = 2
"#,
        root = root.display(),
        port = port
    );
    let config_path = root.join("config").join("docqa.toml");
    fs::write(&config_path, config).unwrap();
    (tmp, config_path, port)
}

fn run_docqa(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(docqa_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docqa: {}", e));
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// Kills the server when the test ends, pass or fail.
struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_server(config_path: &Path, port: u16) -> Server {
    let child = Command::new(docqa_binary())
        .arg("--config")
        .arg(config_path)
        .arg("serve")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn docqa serve");
    let server = Server(child);

    let deadline = Instant::now() + Duration::from_secs(15);
    while TcpStream::connect(("127.0.0.1", port)).is_err() {
        assert!(Instant::now() < deadline, "server did not start");
        sleep(Duration::from_millis(50));
    }
    server
}

#[test]
fn test_init_creates_databases() {
    let (tmp, config_path, _) = setup_env();
    let (stdout, stderr, ok) = run_docqa(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/docqa.sqlite").exists());
    assert!(tmp.path().join("data/cache.sqlite").exists());

    let (_, _, ok) = run_docqa(&config_path, &["init"]);
    assert!(ok, "init should be idempotent");
}

#[test]
fn test_load_without_backend_records_error() {
    let (tmp, config_path, _) = setup_env();
    run_docqa(&config_path, &["init"]);
    let file = tmp.path().join("contract.txt");

    let (_, stderr, ok) = run_docqa(&config_path, &["load", "c1", file.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("backend unavailable"), "stderr: {}", stderr);

    let (stdout, _, ok) = run_docqa(&config_path, &["cache", "list"]);
    assert!(ok);
    assert!(stdout.contains("ERROR") && stdout.contains("c1"), "list: {}", stdout);

    // The stored failure is returned until the entry is reset.
    let (_, stderr, _) = run_docqa(&config_path, &["load", "c1", file.to_str().unwrap()]);
    assert!(stderr.contains("previous load failed"), "stderr: {}", stderr);

    let (stdout, _, ok) = run_docqa(&config_path, &["cache", "reset", "c1"]);
    assert!(ok && stdout.contains("Reset c1"));
    let (stdout, _, _) = run_docqa(&config_path, &["cache", "list"]);
    assert!(stdout.contains("No cache entries."));
}

#[test]
fn test_load_ask_and_search_against_server() {
    let (tmp, config_path, port) = setup_env();
    let (_, stderr, ok) = run_docqa(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let _server = start_server(&config_path, port);
    let file = tmp.path().join("contract.txt");

    let (stdout, stderr, ok) = run_docqa(
        &config_path,
        &["load", "supply-1", file.to_str().unwrap(), "--name", "Supply"],
    );
    assert!(ok, "load failed: {}", stderr);
    assert!(stdout.contains("Loaded supply-1 (Supply)"), "load: {}", stdout);

    let (stdout, _, ok) = run_docqa(&config_path, &["cache", "list"]);
    assert!(ok);
    assert!(stdout.contains("LOADED") && stdout.contains("supply-1"));

    let (stdout, stderr, ok) = run_docqa(
        &config_path,
        &[
            "ask",
            "supply-1",
            "1. Who are the parties? 2. What is the termination notice period?",
        ],
    );
    assert!(ok, "ask failed: {}", stderr);
    assert!(stdout.contains("[src:"), "answer: {}", stdout);
    assert!(stdout.contains("Sources:"), "answer: {}", stdout);

    let (stdout, stderr, ok) = run_docqa(
        &config_path,
        &["search", "supply-1", "termination notice period"],
    );
    assert!(ok, "search failed: {}", stderr);
    assert!(stdout.contains("Selected"), "search: {}", stdout);
    assert!(stdout.contains("p3"), "search: {}", stdout);
}
