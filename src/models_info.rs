//! Generation of BOP `models_info.json`.
//!
//! Example usage:
//! ```no_run
//! use bop2ssp::models_info::*;
//! use std::path::Path;
//!
//! let dir = Path::new("bop_data/itodd/models");
//! let info = models_info(dir, METERS_TO_MILLIMETERS, false).unwrap();
//! write_models_info(&default_output(dir), &info).unwrap();
//! ```
extern crate serde_json;

use serde::{Deserialize, Serialize};
use serde_json::ser::{PrettyFormatter, Serializer};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::bop::parse_frame_stem;
use crate::mesh::Mesh;
use crate::{progress_bar, Error};

/// BOP stores model extents in millimeters, synthetic scenes are usually modelled in meters.
pub const METERS_TO_MILLIMETERS: f64 = 1000.0;

/// Mesh formats read by [models_info].
pub const MESH_FORMATS: &[&str] = &["ply", "obj"];

/// Extents of one model, already scaled to output units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub diameter: f64,
    pub min_x: f64,
    pub min_y: f64,
    pub min_z: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub max_z: f64,
    pub size_x: f64,
    pub size_y: f64,
    pub size_z: f64,
}

impl ModelInfo {
    /// Bounding box and bounding sphere diameter of `mesh`, multiplied by `scale`.
    pub fn from_mesh(mesh: &Mesh, scale: f64) -> Self {
        let (lo, hi) = mesh.bounds();
        ModelInfo {
            diameter: mesh.bounding_sphere().diameter() * scale,
            min_x: lo.x * scale,
            min_y: lo.y * scale,
            min_z: lo.z * scale,
            max_x: hi.x * scale,
            max_y: hi.y * scale,
            max_z: hi.z * scale,
            size_x: (hi.x - lo.x) * scale,
            size_y: (hi.y - lo.y) * scale,
            size_z: (hi.z - lo.z) * scale,
        }
    }
}

/// Model id embedded in a mesh file name: the digits after the last `_` of the stem
/// (`obj_000012.ply -> 12`), or the whole stem if it has no `_`.
pub fn model_id(path: &Path) -> Result<u64, Error> {
    let invalid = || Error::InvalidModelId(path.display().to_string());
    let stem = path.file_stem().and_then(|x| x.to_str()).ok_or_else(invalid)?;
    stem.rsplit('_')
        .next()
        .and_then(parse_frame_stem)
        .ok_or_else(invalid)
}

/// Mesh files in `dir`, sorted by file name.
pub fn list_models(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut models = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|x| x.to_str())
                    .map(|x| MESH_FORMATS.contains(&x.to_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    models.sort();
    Ok(models)
}

/// Compute [ModelInfo] for every mesh in `dir`. Meshes are loaded one at a time.
pub fn models_info(
    dir: &Path,
    scale: f64,
    verbose: bool,
) -> Result<BTreeMap<u64, ModelInfo>, Error> {
    let models = list_models(dir)?;
    let pb = progress_bar(models.len(), "Computing model info", verbose);

    let mut info = BTreeMap::new();
    for path in models {
        let id = model_id(&path)?;
        let mesh = Mesh::from_file(&path)?;
        if info.insert(id, ModelInfo::from_mesh(&mesh, scale)).is_some() {
            log::warn!("Model id {} appears more than once, keeping {}", id, path.display());
        }
        log::info!("Processed {} (id {})", path.display(), id);
        pb.inc(1);
    }
    pb.finish();

    Ok(info)
}

/// Default output location, next to the models directory.
pub fn default_output(models_dir: &Path) -> PathBuf {
    models_dir.join("..").join("models_info.json")
}

/// Write the model table as JSON indented by 4 spaces. An existing file is replaced.
pub fn write_models_info(path: &Path, info: &BTreeMap<u64, ModelInfo>) -> Result<(), Error> {
    let mut writer = BufWriter::new(File::create(path)?);
    {
        let mut ser =
            Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(b"    "));
        info.serialize(&mut ser)?;
    }
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[test]
fn test_model_id() {
    assert_eq!(model_id(Path::new("models/obj_000012.ply")).unwrap(), 12);
    assert_eq!(model_id(Path::new("7.obj")).unwrap(), 7);
    assert_eq!(model_id(Path::new("my_obj_3.ply")).unwrap(), 3);
    match model_id(Path::new("models/apple.ply")) {
        Err(Error::InvalidModelId(name)) => assert!(name.contains("apple.ply")),
        x => panic!("expected InvalidModelId, got {:?}", x),
    }
    assert!(model_id(Path::new("obj_.ply")).is_err());
}

#[test]
fn test_cube_in_millimeters() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/cube.obj");
    let mesh = Mesh::from_file(&path).unwrap();
    let info = ModelInfo::from_mesh(&mesh, METERS_TO_MILLIMETERS);
    assert_eq!(info.min_x, -1000.0);
    assert_eq!(info.max_z, 1000.0);
    assert_eq!(info.size_y, 2000.0);
    assert!((info.diameter - 3464.1016).abs() < 1e-3);
}

#[test]
fn test_models_info_directory() {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir(&models).unwrap();
    let cube = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/cube.obj");
    std::fs::copy(&cube, models.join("obj_000002.obj")).unwrap();
    std::fs::copy(&cube, models.join("obj_000010.obj")).unwrap();
    std::fs::write(models.join("notes.txt"), "not a mesh").unwrap();

    let info = models_info(&models, 1.0, false).unwrap();
    assert_eq!(info.keys().cloned().collect::<Vec<_>>(), vec![2, 10]);
    for m in info.values() {
        assert!(m.min_x <= m.max_x && m.min_y <= m.max_y && m.min_z <= m.max_z);
        assert!(m.diameter > 0.0);
    }

    let out = default_output(&models);
    write_models_info(&out, &info).unwrap();
    let text = std::fs::read_to_string(dir.path().join("models_info.json")).unwrap();
    assert!(text.starts_with("{\n    \"2\": {\n        \"diameter\""));
    let back: BTreeMap<u64, ModelInfo> = serde_json::from_str(&text).unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!(back[&10].max_y, 1.0);
    assert!((back[&10].diameter - info[&10].diameter).abs() < 1e-9);
}

#[test]
fn test_models_info_bad_name_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cube = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/cube.obj");
    std::fs::copy(&cube, dir.path().join("obj_000001.obj")).unwrap();
    std::fs::copy(&cube, dir.path().join("apple.obj")).unwrap();
    assert!(models_info(dir.path(), 1.0, false).is_err());
}
