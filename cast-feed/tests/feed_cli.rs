//! Integration tests for the cast-feed CLI

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Castkit Blog</title>
    <link>https://blog.example.com</link>
    <description>Release notes</description>
    <item>
      <guid>post-2</guid>
      <title>Version 0.2 is out</title>
      <link>https://blog.example.com/0-2</link>
      <description>Now with &lt;b&gt;video&lt;/b&gt; uploads</description>
      <pubDate>Tue, 02 Jan 2024 10:00:00 GMT</pubDate>
    </item>
    <item>
      <guid>post-1</guid>
      <title>Hello castkit</title>
      <link>https://blog.example.com/hello</link>
      <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>
"#;

struct TestEnv {
    temp_dir: TempDir,
    config_path: PathBuf,
    feed_path: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let feed_path = temp_dir.path().join("feed.xml");
        fs::write(&feed_path, FEED).unwrap();

        let escape = |p: &std::path::Path| p.to_string_lossy().replace('\\', "\\\\");
        let config_content = format!(
            r#"
[credentials]
storage = "encrypted"
path = "{}"

[database]
path = "{}"

[[feeds]]
name = "blog"
url = "{}"
networks = ["telegram"]
template = "New: {{title}} ({{link}})"
"#,
            escape(&temp_dir.path().join("credentials")),
            escape(&temp_dir.path().join("history.db")),
            escape(&feed_path),
        );
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, config_content).unwrap();

        Self {
            temp_dir,
            config_path,
            feed_path,
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("cast-feed").unwrap();
        cmd.env("CASTKIT_CONFIG", &self.config_path);
        cmd.env("CASTKIT_MASTER_PASSWORD", "test-password-12345");
        cmd.env_remove("RUST_LOG");
        cmd
    }
}

#[test]
fn test_list_prints_items_newest_first() {
    let env = TestEnv::new();
    let output = env
        .cmd()
        .arg(env.feed_path.to_str().unwrap())
        .arg("--list")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("Version 0.2 is out"));
    assert!(lines[1].starts_with("2024-01-01 10:00\tHello castkit"));
}

#[test]
fn test_dry_run_uses_named_feed_template() {
    let env = TestEnv::new();
    env.cmd()
        .args(["--name", "blog", "--dry-run"])
        .assert()
        .success()
        .stdout("New: Version 0.2 is out (https://blog.example.com/0-2)\n");
}

#[test]
fn test_dry_run_all_new_is_oldest_first() {
    let env = TestEnv::new();
    env.cmd()
        .arg(env.feed_path.to_str().unwrap())
        .args(["--all-new", "--dry-run", "--template", "{title}"])
        .assert()
        .success()
        .stdout("Hello castkit\nVersion 0.2 is out\n");
}

#[test]
fn test_max_age_filters_old_items() {
    let env = TestEnv::new();
    env.cmd()
        .arg(env.feed_path.to_str().unwrap())
        .args(["--max-age", "1h", "--dry-run"])
        .assert()
        .success()
        .stdout("")
        .stderr(predicate::str::contains("No new items"));
}

#[test]
fn test_unknown_feed_name() {
    let env = TestEnv::new();
    env.cmd()
        .args(["--name", "podcast", "--dry-run"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("No feed named 'podcast'"));
}

#[test]
fn test_missing_source_is_invalid_input() {
    let env = TestEnv::new();
    env.cmd()
        .arg("--dry-run")
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("--name"));
}

#[test]
fn test_invalid_pick() {
    let env = TestEnv::new();
    env.cmd()
        .arg(env.feed_path.to_str().unwrap())
        .args(["--pick", "oldest", "--dry-run"])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn test_unreadable_local_feed() {
    let env = TestEnv::new();
    let missing = env.temp_dir.path().join("nope.xml");
    env.cmd()
        .arg(missing.to_str().unwrap())
        .arg("--list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot read feed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_list_fetches_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(FEED),
        )
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let url = format!("{}/feed.xml", server.uri());
    let output = tokio::task::spawn_blocking(move || env.cmd().arg(url).arg("--list").output().unwrap())
        .await
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Hello castkit"));
}
