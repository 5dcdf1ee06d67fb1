use assert_cmd::prelude::*;
use predicates::str::contains;
use std::fs;
use std::process::Command;
use tempfile::TempDir;

const QUAD_OBJ: &str = r#"
mtllib quad.mtl
v -1 0 -1
v 1 0 -1
v 1 0 1
v -1 0 1
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 1 0
usemtl floor
f 1/1/1 4/4/1 3/3/1 2/2/1
"#;

const QUAD_MTL: &str = r#"
newmtl floor
map_Kd floor.png
"#;

fn build_scene(scene: &str) -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    fs::write(dir.path().join("quad.obj"), QUAD_OBJ).expect("write obj");
    fs::write(dir.path().join("quad.mtl"), QUAD_MTL).expect("write mtl");
    fs::write(dir.path().join("scene.xml"), scene).expect("write scene");
    dir
}

#[test]
fn summary_reports_models_and_probe() {
    let dir = build_scene(
        r#"<scene>
  <model name="floor" path="quad.obj"/>
  <instance model="floor" scale="2"/>
  <instance model="floor" position="0 4 0"/>
  <lights count="8" seed="3"/>
  <renderer vpl_count="32" indirect="on"/>
</scene>
"#,
    );
    let mut cmd = Command::cargo_bin("deferred-rsm").expect("binary exists");
    cmd.arg(dir.path().join("scene.xml")).arg("--summary-only");
    cmd.assert()
        .success()
        .stdout(contains("Scene with 1 models, 2 instances, 8 lights"))
        .stdout(contains(" - floor: 1 groups, 1 materials, 2 triangles"))
        .stdout(contains("Indirect: on (32 VPLs"))
        .stdout(contains("Probe pixel: ("));
}

#[test]
fn out_of_range_parameters_are_reported_clamped() {
    let dir = build_scene(r#"<scene><renderer vpl_count="5000" indirect="off"/></scene>"#);
    let mut cmd = Command::cargo_bin("deferred-rsm").expect("binary exists");
    cmd.arg(dir.path().join("scene.xml")).arg("--summary-only");
    cmd.assert()
        .success()
        .stdout(contains("Indirect: off (256 VPLs"));
}

#[test]
fn unknown_model_reference_fails() {
    let dir = build_scene(r#"<scene><instance model="missing"/></scene>"#);
    let mut cmd = Command::cargo_bin("deferred-rsm").expect("binary exists");
    cmd.arg(dir.path().join("scene.xml")).arg("--summary-only");
    cmd.assert()
        .failure()
        .stderr(contains("Error:"))
        .stderr(contains("missing"));
}

#[test]
fn missing_scene_file_fails() {
    let dir = TempDir::new().expect("temp dir");
    let mut cmd = Command::cargo_bin("deferred-rsm").expect("binary exists");
    cmd.arg(dir.path().join("nope.xml")).arg("--summary-only");
    cmd.assert()
        .failure()
        .stderr(contains("failed to read scene"));
}

#[test]
fn usage_is_printed_without_arguments() {
    let mut cmd = Command::cargo_bin("deferred-rsm").expect("binary exists");
    cmd.assert().failure().stderr(contains("Usage: deferred-rsm"));
}
