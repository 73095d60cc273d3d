use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::json;
use std::path::*;
use std::process::Command;
use tempfile::tempdir;

fn cube() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/cube.obj")
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(path, serde_json::to_string(value)?)?;
    Ok(())
}

// Scene of `frames` frames, each with one instance of object 1 ten units in front of the camera.
fn write_scene(dir: &Path, frames: u64) -> Result<(), Box<dyn std::error::Error>> {
    for sub in &["rgb", "depth", "mask", "mask_visib"] {
        std::fs::create_dir_all(dir.join(sub))?;
    }
    let mut camera = serde_json::Map::new();
    let mut gt = serde_json::Map::new();
    let mut info = serde_json::Map::new();
    let mut images = Vec::new();
    let mut annotations = Vec::new();
    for i in 0..frames {
        let name = format!("{:06}", i);
        std::fs::write(dir.join("rgb").join(format!("{}.png", name)), "rgb")?;
        std::fs::write(dir.join("depth").join(format!("{}.png", name)), "depth")?;
        std::fs::write(dir.join("mask").join(format!("{}_000000.png", name)), "m")?;
        std::fs::write(dir.join("mask_visib").join(format!("{}_000000.png", name)), "v")?;
        camera.insert(
            i.to_string(),
            json!({"cam_K": [100, 0, 50, 0, 100, 40, 0, 0, 1], "depth_scale": 1.0}),
        );
        gt.insert(
            i.to_string(),
            json!([{
                "cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1],
                "cam_t_m2c": [0, 0, 10 + i],
                "obj_id": 1
            }]),
        );
        info.insert(i.to_string(), json!([{"visib_fract": 1.0}]));
        images.push(json!({"id": i, "file_name": format!("rgb/{}.png", name)}));
        annotations.push(json!({"id": i, "image_id": i, "category_id": 1}));
    }
    write_json(&dir.join("scene_camera.json"), &camera.into())?;
    write_json(&dir.join("scene_gt.json"), &gt.into())?;
    write_json(&dir.join("scene_gt_info.json"), &info.into())?;
    write_json(
        &dir.join("scene_gt_coco.json"),
        &json!({"images": images, "annotations": annotations}),
    )?;
    Ok(())
}

#[test]
fn models_info_cube() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let models = dir.path().join("models");
    std::fs::create_dir(&models)?;
    std::fs::copy(cube(), models.join("obj_000001.obj"))?;

    let mut cmd = Command::cargo_bin("models_info")?;
    cmd.arg(&models).arg("--quiet");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Wrote info for 1 models"));

    let text = std::fs::read_to_string(dir.path().join("models_info.json"))?;
    let info: serde_json::Value = serde_json::from_str(&text)?;
    assert_eq!(info["1"]["min_x"], json!(-1000.0));
    assert_eq!(info["1"]["size_z"], json!(2000.0));
    let diameter = info["1"]["diameter"].as_f64().unwrap_or_default();
    assert!((diameter - 3464.1016).abs() < 1e-3);

    Ok(())
}

#[test]
fn models_info_bad_name() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    std::fs::copy(cube(), dir.path().join("cube.obj"))?;
    let out = dir.path().join("info.json");

    let mut cmd = Command::cargo_bin("models_info")?;
    cmd.arg(dir.path()).arg("--output").arg(&out).arg("--quiet");
    cmd.assert().failure();
    assert!(!out.exists());

    Ok(())
}

#[test]
fn merge_label_split() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("train_pbr");
    let merged = dir.path().join("merged");
    write_scene(&input.join("000000"), 3)?;
    write_scene(&input.join("000001"), 2)?;

    let mut cmd = Command::cargo_bin("merge_scenes")?;
    cmd.arg(&input).arg(&merged).arg("--quiet");
    cmd.assert().success().stdout(predicate::str::contains(
        "Merged 2 scenes into 5 frames with 10 masks, 5 COCO images and 5 COCO annotations",
    ));
    assert!(merged.join("rgb").join("000004.png").is_file());
    assert!(merged.join("mask_visib").join("000003_000000.png").is_file());

    let camera = dir.path().join("camera.json");
    write_json(
        &camera,
        &json!({"cx": 50.0, "cy": 40.0, "fx": 100.0, "fy": 100.0, "width": 100, "height": 80}),
    )?;
    let mut cmd = Command::cargo_bin("ssp_labels")?;
    cmd.arg(&merged)
        .arg("--camera")
        .arg(&camera)
        .arg("--model")
        .arg(cube())
        .arg("--quiet");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Wrote 5 labels"));
    // global frame 3 is the first frame of the second scene
    let label = std::fs::read_to_string(merged.join("labels").join("000003.txt"))?;
    assert!(label.starts_with("1.000000 0.500000 0.500000 "));
    assert!(label.ends_with('\n'));
    assert_eq!(label.split_whitespace().count(), 21);

    let mut cmd = Command::cargo_bin("split_dataset")?;
    cmd.arg(&merged)
        .arg("0.6")
        .arg("0.2")
        .arg("0.2")
        .arg("--quiet");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Train: 3, Val: 1, Test: 1"));
    let count = |split: &str, sub: &str| {
        std::fs::read_dir(merged.join(split).join(sub))
            .map(|x| x.count())
            .unwrap_or_default()
    };
    assert_eq!(count("train", "rgb") + count("val", "rgb") + count("test", "rgb"), 5);
    assert_eq!(count("train", "labels"), 3);
    assert_eq!(count("val", "mask"), 1);
    assert_eq!(count("test", "depth"), 1);

    Ok(())
}

#[test]
fn labels_reject_multiple_instances() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let merged = dir.path().join("merged");
    std::fs::create_dir_all(merged.join("rgb"))?;
    std::fs::write(merged.join("rgb").join("000000.png"), "rgb")?;
    let instance = json!({
        "cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1],
        "cam_t_m2c": [0, 0, 10],
        "obj_id": 1
    });
    write_json(
        &merged.join("scene_gt.json"),
        &json!({"0": [instance.clone(), instance]}),
    )?;
    let camera = dir.path().join("camera.json");
    write_json(
        &camera,
        &json!({"cx": 50.0, "cy": 40.0, "fx": 100.0, "fy": 100.0, "width": 100, "height": 80}),
    )?;

    let mut cmd = Command::cargo_bin("ssp_labels")?;
    cmd.arg(&merged)
        .arg("--camera")
        .arg(&camera)
        .arg("--model")
        .arg(cube())
        .arg("--quiet");
    cmd.assert().failure();

    Ok(())
}

#[test]
fn split_rejects_bad_ratio() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mut cmd = Command::cargo_bin("split_dataset")?;
    cmd.arg(dir.path()).arg("1.5").arg("0.2").arg("0.0");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("between 0.0 and 1.0"));

    Ok(())
}
