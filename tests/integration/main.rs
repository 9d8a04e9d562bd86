//! Integration tests for imagecache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn imagecache() -> Command {
        cargo_bin_cmd!("imagecache")
    }

    /// Write a config that keeps every path inside `dir`
    fn write_config(dir: &Path, master_dir: Option<&Path>) -> PathBuf {
        let mut content = String::from("[cache]\n");
        if let Some(master_dir) = master_dir {
            content.push_str(&format!("master_dir = {:?}\n", master_dir.display().to_string()));
        }
        content.push_str(&format!(
            "\n[locks]\ndir = {:?}\n",
            dir.join("locks").display().to_string()
        ));

        let path = dir.join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    fn with_config(config: &Path) -> Command {
        let mut cmd = imagecache();
        cmd.env("IMAGECACHE_CONFIG", config);
        cmd
    }

    #[test]
    fn help_displays() {
        imagecache()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("master image cache"));
    }

    #[test]
    fn version_displays() {
        imagecache()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("imagecache"));
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("custom.toml");
        imagecache()
            .args(["--config", config.to_str().unwrap(), "config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), None);
        with_config(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("size_mb = 20480"));
    }

    #[test]
    fn config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("nested").join("config.toml");

        with_config(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(config.exists());

        with_config(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        fs::write(&config, "[cache\nsize_mb = ").unwrap();

        with_config(&config)
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn status_on_empty_cache() {
        let dir = TempDir::new().unwrap();
        let master = dir.path().join("master");
        let config = write_config(dir.path(), Some(&master));

        with_config(&config)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No master images cached"));
        assert!(master.is_dir());
    }

    #[test]
    fn status_json_on_disabled_cache() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), None);

        with_config(&config)
            .args(["status", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"enabled\": false"));
    }

    #[test]
    fn clean_on_disabled_cache() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), None);

        with_config(&config)
            .arg("clean")
            .assert()
            .success()
            .stdout(predicate::str::contains("Caching disabled"));
    }

    #[test]
    fn fetch_local_image_through_cache() {
        let dir = TempDir::new().unwrap();
        let master = dir.path().join("master");
        let config = write_config(dir.path(), Some(&master));
        let source = dir.path().join("deploy.img");
        fs::write(&source, b"image bytes").unwrap();

        for dest in ["node-1.img", "node-2.img"] {
            with_config(&config)
                .args(["fetch", "--no-raw", source.to_str().unwrap()])
                .arg(dir.path().join(dest))
                .assert()
                .success();
        }

        assert_eq!(fs::read(dir.path().join("node-2.img")).unwrap(), b"image bytes");
        assert_eq!(fs::read_dir(&master).unwrap().count(), 1);

        with_config(&config)
            .args(["status", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty().not());
    }

    #[test]
    fn fetch_missing_image_fails() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), Some(&dir.path().join("master")));

        with_config(&config)
            .args(["fetch", "--no-raw", "/nonexistent/deploy.img"])
            .arg(dir.path().join("dest"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
        assert!(!dir.path().join("dest").exists());
    }

    #[test]
    fn reclaim_with_plenty_of_space() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), Some(&dir.path().join("master")));

        with_config(&config)
            .args(["reclaim", dir.path().to_str().unwrap(), "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("available"));
    }

    #[test]
    fn clean_reports_freed_space() {
        let dir = TempDir::new().unwrap();
        let master = dir.path().join("master");
        let config = write_config(dir.path(), Some(&master));
        fs::create_dir_all(&master).unwrap();
        fs::write(master.join("stale"), b"abc").unwrap();

        with_config(&config)
            .args(["clean", "--amount", "3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Freed"));
        assert!(!master.join("stale").exists());
    }
}
