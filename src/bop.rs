//! Record types and file naming of the BOP dataset layout.
//!
//! A scene directory looks like
//! ```txt
//! scene_camera.json   {"<frame>": {"cam_K": [...], "depth_scale": ..}, ...}
//! scene_gt.json       {"<frame>": [{"cam_R_m2c": [...], "cam_t_m2c": [...], "obj_id": ..}], ...}
//! scene_gt_info.json  {"<frame>": [{"bbox_obj": [...], "px_count_all": .., ..}], ...}
//! scene_gt_coco.json  {"images": [...], "annotations": [...], "categories": [...]}
//! rgb/000000.jpg
//! depth/000000.png
//! mask/000000_000000.png
//! mask_visib/000000_000000.png
//! ```
//! Frame maps are read into `BTreeMap<u64, _>` so that they are written back in numeric order.
extern crate nom;
extern crate serde;
extern crate serde_json;

use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::{all_consuming, map_res};
use nom::IResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::Error;

pub const SCENE_CAMERA: &str = "scene_camera.json";
pub const SCENE_GT: &str = "scene_gt.json";
pub const SCENE_GT_INFO: &str = "scene_gt_info.json";
pub const SCENE_GT_COCO: &str = "scene_gt_coco.json";

pub const RGB_DIR: &str = "rgb";
pub const DEPTH_DIR: &str = "depth";
pub const MASK_DIR: &str = "mask";
pub const MASK_VISIB_DIR: &str = "mask_visib";
pub const LABELS_DIR: &str = "labels";

/// Image extensions accepted for color frames.
pub const IMG_FORMATS: &[&str] = &["jpg", "jpeg", "png"];

/// Frame map with untyped entries. Used when entries are only moved around.
pub type FrameMap = BTreeMap<u64, Value>;

/// One object instance of `scene_gt.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtInstance {
    /// Row-major rotation from model to camera coordinates.
    #[serde(rename = "cam_R_m2c")]
    pub cam_r_m2c: [f64; 9],
    /// Translation from model to camera coordinates.
    pub cam_t_m2c: [f64; 3],
    pub obj_id: u64,
}

/// One frame of `scene_camera.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraEntry {
    /// Row-major 3x3 intrinsic matrix.
    #[serde(rename = "cam_K")]
    pub cam_k: [f64; 9],
    #[serde(default)]
    pub depth_scale: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: u64,
    pub image_id: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `scene_gt_coco.json`. Anything besides images and annotations (info, licenses,
/// categories) is kept in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CocoDataset {
    #[serde(default)]
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Zero padded frame name, `12 -> "000012"`.
pub fn frame_name(frame: u64) -> String {
    format!("{:06}", frame)
}

/// Name of the mask of `instance` in `frame`, `(12, 3) -> "000012_000003"`.
pub fn mask_name(frame: u64, instance: u64) -> String {
    format!("{:06}_{:06}", frame, instance)
}

fn unsigned(input: &str) -> IResult<&str, u64> {
    map_res(digit1, u64::from_str)(input)
}

fn frame_instance(input: &str) -> IResult<&str, (u64, u64)> {
    let (input, frame) = unsigned(input)?;
    let (input, _) = tag("_")(input)?;
    let (input, instance) = unsigned(input)?;
    Ok((input, (frame, instance)))
}

/// Parse a purely numeric file stem like `000012`.
pub fn parse_frame_stem(stem: &str) -> Option<u64> {
    all_consuming(unsigned)(stem).ok().map(|x| x.1)
}

/// Parse a mask file stem like `000012_000003` into `(frame, instance)`.
pub fn parse_mask_stem(stem: &str) -> Option<(u64, u64)> {
    all_consuming(frame_instance)(stem).ok().map(|x| x.1)
}

/// Frame index encoded in the last path component of `file_name`, e.g. `rgb/000012.jpg -> 12`.
pub fn file_name_frame(file_name: &str) -> Option<u64> {
    Path::new(file_name)
        .file_stem()
        .and_then(|x| x.to_str())
        .and_then(parse_frame_stem)
}

/// Replace the frame index in `file_name`, keeping the directory prefix and extension.
/// `("rgb/000002.jpg", 17) -> "rgb/000017.jpg"`.
pub fn rename_file_name(file_name: &str, frame: u64) -> String {
    let (prefix, last) = match file_name.rfind('/') {
        Some(i) => file_name.split_at(i + 1),
        None => ("", file_name),
    };
    match Path::new(last).extension().and_then(|x| x.to_str()) {
        Some(ext) => format!("{}{}.{}", prefix, frame_name(frame), ext),
        None => format!("{}{}", prefix, frame_name(frame)),
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|x| x.to_str())
        .map(|x| IMG_FORMATS.contains(&x.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// All images in `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut images = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| p.is_file() && has_image_extension(p))
        .collect::<Vec<_>>();
    images.sort();
    Ok(images)
}

/// Images in `dir` whose stem is a frame index, sorted by frame index. Other images are skipped,
/// as is every image after the first (by file name) with the same frame index.
pub fn list_frames(dir: &Path) -> Result<Vec<(u64, PathBuf)>, Error> {
    let mut frames = list_images(dir)?
        .into_iter()
        .filter_map(|p| {
            let frame = p
                .file_stem()
                .and_then(|x| x.to_str())
                .and_then(parse_frame_stem);
            match frame {
                Some(f) => Some((f, p)),
                None => {
                    log::warn!("Skipping {}, name is not a frame index", p.display());
                    None
                }
            }
        })
        .collect::<Vec<_>>();
    frames.sort_by_key(|x| x.0);
    frames.dedup_by(|later, kept| {
        let repeated = later.0 == kept.0;
        if repeated {
            log::warn!(
                "Skipping {}, frame {} is already taken by {}",
                later.1.display(),
                later.0,
                kept.1.display()
            );
        }
        repeated
    });
    Ok(frames)
}

/// Read a JSON file. Parse errors name the offending file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let reader = BufReader::new(File::open(path).map_err(|e| {
        Error::IOError(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })?);
    serde_json::from_reader(reader)
        .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
}

/// Write compact JSON, replacing `path` if it exists.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

#[test]
fn test_frame_names() {
    assert_eq!(frame_name(12), "000012");
    assert_eq!(mask_name(12, 3), "000012_000003");
    assert_eq!(frame_name(1234567), "1234567");
}

#[test]
fn test_parse_stems() {
    assert_eq!(parse_frame_stem("000012"), Some(12));
    assert_eq!(parse_frame_stem("000012_000001"), None);
    assert_eq!(parse_frame_stem("abc"), None);
    assert_eq!(parse_frame_stem(""), None);
    assert_eq!(parse_mask_stem("000012_000003"), Some((12, 3)));
    assert_eq!(parse_mask_stem("000012"), None);
    assert_eq!(parse_mask_stem("000012_000003_x"), None);
}

#[test]
fn test_file_name_frame() {
    assert_eq!(file_name_frame("rgb/000007.jpg"), Some(7));
    assert_eq!(file_name_frame("000007.png"), Some(7));
    assert_eq!(file_name_frame("rgb/frame7.png"), None);
}

#[test]
fn test_rename_file_name() {
    assert_eq!(rename_file_name("rgb/000002.jpg", 17), "rgb/000017.jpg");
    assert_eq!(rename_file_name("000002.png", 3), "000003.png");
    assert_eq!(rename_file_name("000002", 3), "000003");
}

#[test]
fn test_gt_instance_from_json() {
    let gt: BTreeMap<u64, Vec<GtInstance>> = serde_json::from_str(
        r#"{"0": [{"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [0, 0, 500], "obj_id": 3}],
            "10": []}"#,
    )
    .unwrap();
    assert_eq!(gt[&0][0].obj_id, 3);
    assert_eq!(gt[&0][0].cam_t_m2c[2], 500.0);
    assert!(gt[&10].is_empty());
}

#[test]
fn test_coco_keeps_unknown_fields() {
    let coco: CocoDataset = serde_json::from_str(
        r#"{"info": {"description": "x"}, "categories": [{"id": 1, "name": "apple"}],
            "images": [{"id": 0, "file_name": "rgb/000000.jpg", "width": 640, "height": 480}],
            "annotations": [{"id": 0, "image_id": 0, "category_id": 1, "bbox": [1, 2, 3, 4]}]}"#,
    )
    .unwrap();
    assert!(coco.extra.contains_key("categories"));
    assert_eq!(coco.images[0].extra["width"], 640);
    let back = serde_json::to_value(&coco).unwrap();
    assert_eq!(back["annotations"][0]["bbox"][3], 4);
    assert_eq!(back["info"]["description"], "x");
}

#[test]
fn test_frame_map_is_numerically_ordered() {
    let mut map = FrameMap::new();
    map.insert(10, Value::from(1));
    map.insert(2, Value::from(2));
    assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"2":2,"10":1}"#);
}

#[test]
fn test_list_frames_skips_repeated_index() {
    let dir = tempfile::tempdir().unwrap();
    for name in &["000002.png", "000000.png", "000000.jpg", "notes.jpg", "000001.txt"] {
        std::fs::write(dir.path().join(name), "").unwrap();
    }
    let frames = list_frames(dir.path()).unwrap();
    assert_eq!(
        frames.iter().map(|x| x.0).collect::<Vec<_>>(),
        vec![0, 2]
    );
    assert_eq!(frames[0].1, dir.path().join("000000.jpg"));
}
