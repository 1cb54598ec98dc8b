//! Shared test environment for CLI integration tests.
//!
//! Each environment owns an isolated temp directory holding a config file,
//! formula directory, cellar, and download cache, so tests never touch the
//! user's real `~/.malt` and can run in parallel.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub struct TestEnvironment {
    root: tempfile::TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("failed to create test environment");
        for sub in ["formulas", "cellar", "cache", "sources", "bottles"] {
            std::fs::create_dir_all(root.path().join(sub)).unwrap();
        }
        let config = format!(
            "cellar_dir = {:?}\ncache_dir = {:?}\nformula_dir = {:?}\nmax_jobs = 2\nnetwork_retries = 2\n",
            root.path().join("cellar"),
            root.path().join("cache"),
            root.path().join("formulas"),
        );
        std::fs::write(root.path().join("config.toml"), config).unwrap();
        Self { root }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.root.path().join("cellar")
    }

    /// A `malt` command wired to this environment's config.
    pub fn malt_command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("malt").unwrap();
        cmd.arg("--config").arg(self.root.path().join("config.toml"));
        cmd
    }

    /// Write a formula file verbatim.
    pub fn add_formula(&self, name: &str, toml: &str) {
        std::fs::write(self.root.path().join("formulas").join(format!("{name}.toml")), toml)
            .unwrap();
    }

    /// Write a source blob and return (path, sha256 hex digest).
    pub fn write_source(&self, file_name: &str, content: &[u8]) -> (PathBuf, String) {
        let path = self.root.path().join("sources").join(file_name);
        std::fs::write(&path, content).unwrap();
        (path, sha256_hex(content))
    }

    /// Write a bottle blob under the bottles root and return its digest.
    pub fn write_bottle(&self, file_name: &str, content: &[u8]) -> String {
        let path = self.root.path().join("bottles").join(file_name);
        std::fs::write(&path, content).unwrap();
        sha256_hex(content)
    }

    pub fn bottles_root(&self) -> String {
        self.root.path().join("bottles").display().to_string()
    }

    /// A simple formula that copies its staged source into the keg.
    pub fn add_simple_formula(&self, name: &str, deps: &[&str]) {
        let (source, digest) = self.write_source(
            &format!("{name}.tar.gz"),
            format!("source of {name}").as_bytes(),
        );
        let dep_tables: String = deps
            .iter()
            .map(|d| format!("[[dependencies]]\nname = \"{d}\"\n"))
            .collect();
        let toml = format!(
            r#"name = "{name}"
version = "1.0.0"
desc = "test formula {name}"

[source]
url = "{}"
sha256 = "{digest}"

{dep_tables}
[[install]]
run = {{ command = ["sh", "-c", "cp {name}.tar.gz {{prefix}}/payload"] }}
"#,
            source.display()
        );
        self.add_formula(name, &toml);
    }
}

pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
