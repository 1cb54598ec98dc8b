//! The `list` and `info` commands.

use predicates::prelude::*;

mod fixtures;
use fixtures::TestEnvironment;

#[test]
fn test_list_empty_cellar() {
    let env = TestEnvironment::new();

    env.malt_command()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No formulas installed"));
}

#[test]
fn test_list_after_install() {
    let env = TestEnvironment::new();
    env.add_simple_formula("libx", &[]);
    env.add_simple_formula("app", &["libx"]);
    env.malt_command().arg("build").arg("app").assert().success();

    env.malt_command()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("app 1.0.0"))
        .stdout(predicate::str::contains("libx 1.0.0"));
}

#[test]
fn test_list_details_show_install_source() {
    let env = TestEnvironment::new();
    env.add_simple_formula("aom", &[]);
    env.malt_command().arg("build").arg("aom").assert().success();

    env.malt_command()
        .arg("list")
        .arg("--details")
        .assert()
        .success()
        .stdout(predicate::str::contains("source"));
}

#[test]
fn test_info_shows_metadata_and_install_status() {
    let env = TestEnvironment::new();
    env.add_simple_formula("aom", &[]);

    env.malt_command()
        .arg("info")
        .arg("aom")
        .assert()
        .success()
        .stdout(predicate::str::contains("aom: 1.0.0"))
        .stdout(predicate::str::contains("test formula aom"))
        .stdout(predicate::str::contains("not installed"));

    env.malt_command().arg("build").arg("aom").assert().success();

    env.malt_command()
        .arg("info")
        .arg("aom")
        .assert()
        .success()
        .stdout(predicate::str::contains("built from source"));
}

#[test]
fn test_info_unknown_formula_fails() {
    let env = TestEnvironment::new();

    env.malt_command()
        .arg("info")
        .arg("ghost")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
