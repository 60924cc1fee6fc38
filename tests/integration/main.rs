//! Integration tests for tiercache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    const JOB_ENV: [&str; 10] = [
        "ACTIONS_RUNTIME_TOKEN",
        "ACTIONS_CACHE_URL",
        "ACTIONS_RESULTS_URL",
        "ACTIONS_CACHE_SERVICE_V2",
        "GITHUB_TOKEN",
        "GITHUB_REPOSITORY",
        "GITHUB_REF",
        "TIERCACHE_PREFIX",
        "TIERCACHE_LOG_FORMAT",
        "RUST_LOG",
    ];

    /// Command isolated from the job environment and the user's config
    fn tiercache(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("tiercache");
        for var in JOB_ENV {
            cmd.env_remove(var);
        }
        cmd.env("TIERCACHE_CONFIG", temp.path().join("config.toml"));
        cmd
    }

    /// Serve against an unreachable cache service; only local hits and
    /// failed background uploads are possible.
    fn serve(temp: &TempDir) -> Command {
        let mut cmd = tiercache(temp);
        cmd.args(["serve", "--no-listing", "--dir"])
            .arg(temp.path().join("cache"))
            .env("ACTIONS_RUNTIME_TOKEN", "test-token")
            .env("ACTIONS_CACHE_URL", "http://127.0.0.1:9/");
        cmd
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        tiercache(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("GitHub Actions cache"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        tiercache(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("tiercache"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        tiercache(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        tiercache(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[remote]"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[remote\n").unwrap();
        tiercache(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn serve_requires_runtime_token() {
        let temp = TempDir::new().unwrap();
        tiercache(&temp)
            .args(["serve", "--cache-url", "https://cache.example/"])
            .write_stdin("")
            .assert()
            .failure()
            .stderr(predicate::str::contains("ACTIONS_RUNTIME_TOKEN"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn serve_handshakes_and_closes() {
        let temp = TempDir::new().unwrap();
        serve(&temp)
            .write_stdin("{\"ID\":1,\"Command\":\"close\"}\n")
            .assert()
            .success()
            .stdout(predicate::str::starts_with(
                "{\"ID\":0,\"KnownCommands\":[\"get\",\"put\",\"close\"]}\n",
            ))
            .stdout(predicate::str::contains("{\"ID\":1}\n"));
    }

    #[test]
    fn put_is_served_locally_by_the_next_process() {
        let temp = TempDir::new().unwrap();
        // "aGVsbG8=" is "hello"
        let put = concat!(
            "{\"ID\":1,\"Command\":\"put\",\"ActionID\":\"AQI=\",\"OutputID\":\"qrs=\",\"BodySize\":5}\n",
            "\"aGVsbG8=\"\n",
            "{\"ID\":2,\"Command\":\"close\"}\n",
        );
        serve(&temp)
            .write_stdin(put)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"DiskPath\""));

        serve(&temp)
            .write_stdin("{\"ID\":1,\"Command\":\"get\",\"ActionID\":\"AQI=\"}\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"OutputID\":\"qrs=\""))
            .stdout(predicate::str::contains("\"Size\":5"));
    }

    #[test]
    fn piped_logs_carry_no_color_codes() {
        let temp = TempDir::new().unwrap();
        serve(&temp)
            .arg("-vv")
            .write_stdin("{\"ID\":1,\"Command\":\"close\"}\n")
            .assert()
            .success()
            .stderr(predicate::str::contains("Cache session finished"))
            .stderr(predicate::str::contains("\u{1b}[").not());
    }

    /// Interrupt while the build tool still holds stdin open
    #[cfg(unix)]
    #[test]
    fn interrupt_exits_with_stdin_open() {
        use std::io::{BufRead, BufReader, Write};
        use std::process::{Command as StdCommand, Stdio};
        use std::time::{Duration, Instant};

        let temp = TempDir::new().unwrap();
        let mut child = StdCommand::new(env!("CARGO_BIN_EXE_tiercache"))
            .args(["serve", "--no-listing", "--dir"])
            .arg(temp.path().join("cache"))
            .env_remove("GITHUB_TOKEN")
            .env("TIERCACHE_CONFIG", temp.path().join("config.toml"))
            .env("ACTIONS_RUNTIME_TOKEN", "test-token")
            .env("ACTIONS_CACHE_URL", "http://127.0.0.1:9/")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let mut stdin = child.stdin.take().unwrap();
        let mut stdout = BufReader::new(child.stdout.take().unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).unwrap();
        assert!(line.contains("KnownCommands"));

        // An answered request means the interrupt listener is installed.
        stdin
            .write_all(b"{\"ID\":1,\"Command\":\"get\",\"ActionID\":\"AQI=\"}\n")
            .unwrap();
        stdin.flush().unwrap();
        line.clear();
        stdout.read_line(&mut line).unwrap();
        assert!(line.contains("\"ID\":1"));

        let killed = StdCommand::new("kill")
            .args(["-INT", &child.id().to_string()])
            .status()
            .unwrap();
        assert!(killed.success());

        let deadline = Instant::now() + Duration::from_secs(10);
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            if Instant::now() > deadline {
                let _ = child.kill();
                panic!("server still running after interrupt");
            }
            std::thread::sleep(Duration::from_millis(50));
        };
        drop(stdin);
        assert!(status.success());
    }
}
