//! Merging independently rendered BOP scenes into one bundle with a global frame numbering.
//!
//! Scenes are visited in lexicographic order and frames in ascending order, so the global index
//! of a frame is the number of frames merged before it. For every frame the color, depth and mask
//! images are copied under the new index and the entries of `scene_camera.json`,
//! `scene_gt.json`, `scene_gt_info.json` and `scene_gt_coco.json` are renumbered.
//!
//! Example usage:
//! ```no_run
//! use bop2ssp::merge::merge_scenes;
//! use std::path::Path;
//!
//! let summary = merge_scenes(
//!     Path::new("bop_data/itodd/train_pbr"),
//!     Path::new("bop_data/itodd/merged"),
//!     false,
//! )
//! .unwrap();
//! println!("{}", summary);
//! ```
extern crate glob;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::bop::*;
use crate::{copy_file, progress_bar, Error};

/// Counts of everything written by [merge_scenes].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeSummary {
    pub scenes: usize,
    pub frames: u64,
    pub masks: usize,
    pub coco_images: usize,
    pub coco_annotations: u64,
    /// Frames that had no matching image record in `scene_gt_coco.json`.
    pub frames_without_detection: usize,
}

impl std::fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Merged {} scenes into {} frames with {} masks, {} COCO images and {} COCO annotations",
            self.scenes, self.frames, self.masks, self.coco_images, self.coco_annotations
        )?;
        if self.frames_without_detection > 0 {
            write!(
                f,
                " ({} frames without COCO image record)",
                self.frames_without_detection
            )?;
        }
        Ok(())
    }
}

/// Annotations of a single input scene, with COCO records indexed by frame.
struct Scene {
    dir: PathBuf,
    camera: FrameMap,
    gt: FrameMap,
    gt_info: FrameMap,
    coco_images: HashMap<u64, CocoImage>,
    coco_annotations: HashMap<u64, Vec<CocoAnnotation>>,
    coco_extra: serde_json::Map<String, serde_json::Value>,
}

impl Scene {
    fn load(dir: &Path) -> Result<Self, Error> {
        let coco: CocoDataset = read_json(&dir.join(SCENE_GT_COCO))?;

        // Join images to frames on the frame index of their file name.
        let mut coco_images = HashMap::new();
        for image in coco.images {
            match file_name_frame(&image.file_name) {
                Some(frame) => {
                    if coco_images.contains_key(&frame) {
                        log::warn!(
                            "{}: duplicate COCO image record for frame {}, keeping the first",
                            dir.display(),
                            frame
                        );
                    } else {
                        coco_images.insert(frame, image);
                    }
                }
                None => log::warn!(
                    "{}: COCO image {} has no frame index in its file name",
                    dir.display(),
                    image.file_name
                ),
            }
        }

        let mut coco_annotations = HashMap::new();
        for annotation in coco.annotations {
            coco_annotations
                .entry(annotation.image_id)
                .or_insert_with(Vec::new)
                .push(annotation);
        }

        Ok(Scene {
            dir: dir.to_path_buf(),
            camera: read_json(&dir.join(SCENE_CAMERA))?,
            gt: read_json(&dir.join(SCENE_GT))?,
            gt_info: read_json(&dir.join(SCENE_GT_INFO))?,
            coco_images,
            coco_annotations,
            coco_extra: coco.extra,
        })
    }
}

/// Take the entry of `frame` out of the frame map read from `dir/file`.
fn take_entry(
    dir: &Path,
    map: &mut FrameMap,
    file: &str,
    frame: u64,
) -> Result<serde_json::Value, Error> {
    map.remove(&frame).ok_or_else(|| Error::MissingFrame {
        file: dir.join(file).display().to_string(),
        frame,
    })
}

/// Scene directories under `input_root`, in lexicographic order.
pub fn list_scenes(input_root: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut scenes = std::fs::read_dir(input_root)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect::<Vec<_>>();
    scenes.sort();
    Ok(scenes)
}

/// Accumulates scenes into the merged output. Files are copied as frames are added, the JSON
/// files are written by [Merger::finish].
pub struct Merger {
    output_root: PathBuf,
    scene_camera: FrameMap,
    scene_gt: FrameMap,
    scene_gt_info: FrameMap,
    coco: CocoDataset,
    summary: MergeSummary,
}

impl Merger {
    /// Create the output directory tree. Existing files are left in place.
    pub fn new(output_root: &Path) -> Result<Self, Error> {
        for sub in &[DEPTH_DIR, MASK_DIR, MASK_VISIB_DIR, RGB_DIR] {
            std::fs::create_dir_all(output_root.join(sub))?;
        }
        Ok(Merger {
            output_root: output_root.to_path_buf(),
            scene_camera: FrameMap::new(),
            scene_gt: FrameMap::new(),
            scene_gt_info: FrameMap::new(),
            coco: CocoDataset::default(),
            summary: MergeSummary::default(),
        })
    }

    /// Next unused global frame index.
    pub fn next_frame(&self) -> u64 {
        self.summary.frames
    }

    /// Append all frames of the scene in `scene_dir`.
    pub fn add_scene(&mut self, scene_dir: &Path) -> Result<(), Error> {
        let mut scene = Scene::load(scene_dir)?;
        for (key, value) in std::mem::replace(&mut scene.coco_extra, serde_json::Map::new()) {
            self.coco.extra.entry(key).or_insert(value);
        }

        let frames = list_frames(&scene_dir.join(RGB_DIR))?;
        if frames.is_empty() {
            log::warn!("{}: no frames found", scene_dir.display());
        }
        for (local, rgb) in frames {
            self.add_frame(&mut scene, local, &rgb)?;
        }
        self.summary.scenes += 1;
        Ok(())
    }

    fn add_frame(&mut self, scene: &mut Scene, local: u64, rgb: &Path) -> Result<(), Error> {
        let global = self.next_frame();

        // annotation entries first, so a malformed scene fails before files are copied
        let camera = take_entry(&scene.dir, &mut scene.camera, SCENE_CAMERA, local)?;
        let gt = take_entry(&scene.dir, &mut scene.gt, SCENE_GT, local)?;
        let gt_info = take_entry(&scene.dir, &mut scene.gt_info, SCENE_GT_INFO, local)?;
        self.scene_camera.insert(global, camera);
        self.scene_gt.insert(global, gt);
        self.scene_gt_info.insert(global, gt_info);

        let rgb_name = match rgb.extension().and_then(|x| x.to_str()) {
            Some(ext) => format!("{}.{}", frame_name(global), ext),
            None => frame_name(global),
        };
        copy_file(rgb, &self.output_root.join(RGB_DIR).join(rgb_name))?;

        let depth = scene
            .dir
            .join(DEPTH_DIR)
            .join(format!("{}.png", frame_name(local)));
        if depth.exists() {
            copy_file(
                &depth,
                &self
                    .output_root
                    .join(DEPTH_DIR)
                    .join(format!("{}.png", frame_name(global))),
            )?;
        } else {
            log::warn!("{}: depth not found for frame {}", scene.dir.display(), local);
        }

        for mask_dir in &[MASK_DIR, MASK_VISIB_DIR] {
            let copied = self.copy_masks(&scene.dir.join(mask_dir), mask_dir, local, global)?;
            if copied == 0 {
                log::warn!(
                    "{}: {} not found for frame {}",
                    scene.dir.display(),
                    mask_dir,
                    local
                );
            }
            self.summary.masks += copied;
        }

        match scene.coco_images.remove(&local) {
            Some(mut image) => {
                image.id = global;
                image.file_name = rename_file_name(&image.file_name, global);
                self.coco.images.push(image);
                self.summary.coco_images += 1;
            }
            None => {
                log::warn!(
                    "{}: no COCO image record for frame {}, skipping its detections",
                    scene.dir.display(),
                    local
                );
                self.summary.frames_without_detection += 1;
            }
        }
        for mut annotation in scene.coco_annotations.remove(&local).unwrap_or_default() {
            annotation.id = self.summary.coco_annotations;
            annotation.image_id = global;
            self.coco.annotations.push(annotation);
            self.summary.coco_annotations += 1;
        }

        self.summary.frames += 1;
        Ok(())
    }

    /// Copy every `{local}_{instance}.png` of `src_dir` to `{global}_{instance}.png` in the output
    /// directory `sub`. Returns the number of copied masks.
    fn copy_masks(
        &self,
        src_dir: &Path,
        sub: &str,
        local: u64,
        global: u64,
    ) -> Result<usize, Error> {
        let pattern = format!(
            "{}/{}_*.png",
            glob::Pattern::escape(&src_dir.to_string_lossy()),
            frame_name(local)
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| Error::ParseError(format!("{}: {}", pattern, e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::IOError(e.into()))?;

        for path in paths.iter() {
            let instance = path
                .file_stem()
                .and_then(|x| x.to_str())
                .and_then(parse_mask_stem)
                .map(|(_, instance)| instance)
                .ok_or_else(|| {
                    Error::ParseError(format!(
                        "{}: mask name is not <frame>_<instance>.png",
                        path.display()
                    ))
                })?;
            let dst = self
                .output_root
                .join(sub)
                .join(format!("{}.png", mask_name(global, instance)));
            copy_file(path, &dst)?;
        }
        Ok(paths.len())
    }

    /// Write the four merged JSON files.
    pub fn finish(self) -> Result<MergeSummary, Error> {
        write_json(&self.output_root.join(SCENE_CAMERA), &self.scene_camera)?;
        write_json(&self.output_root.join(SCENE_GT), &self.scene_gt)?;
        write_json(&self.output_root.join(SCENE_GT_INFO), &self.scene_gt_info)?;
        write_json(&self.output_root.join(SCENE_GT_COCO), &self.coco)?;
        Ok(self.summary)
    }
}

/// Merge every scene directory of `input_root` into `output_root`.
///
/// There is no rollback: an error part way through leaves the files copied so far. Running twice
/// into the same output overwrites files of the same name.
pub fn merge_scenes(
    input_root: &Path,
    output_root: &Path,
    verbose: bool,
) -> Result<MergeSummary, Error> {
    let scenes = list_scenes(input_root)?;
    let mut merger = Merger::new(output_root)?;

    let pb = progress_bar(scenes.len(), "Scenes", verbose);
    for scene in scenes.iter() {
        merger.add_scene(scene)?;
        log::info!(
            "Merged {}, {} frames so far",
            scene.display(),
            merger.next_frame()
        );
        pb.inc(1);
    }
    pb.finish();

    merger.finish()
}

#[cfg(test)]
fn write_scene(dir: &Path, frames: u64, tag: u64, with_coco_image: &dyn Fn(u64) -> bool) {
    use serde_json::json;
    for sub in &[RGB_DIR, DEPTH_DIR, MASK_DIR, MASK_VISIB_DIR] {
        std::fs::create_dir_all(dir.join(sub)).unwrap();
    }
    let mut camera = FrameMap::new();
    let mut gt = FrameMap::new();
    let mut info = FrameMap::new();
    let mut images = Vec::new();
    let mut annotations = Vec::new();
    for i in 0..frames {
        let name = frame_name(i);
        let write = |sub: &str, file: String, contents: String| {
            std::fs::write(dir.join(sub).join(file), contents).unwrap()
        };
        write(RGB_DIR, format!("{}.jpg", name), format!("rgb {} {}", tag, i));
        write(DEPTH_DIR, format!("{}.png", name), "depth".to_string());
        // frame i has i % 2 + 1 instances
        for k in 0..(i % 2 + 1) {
            write(MASK_DIR, format!("{}.png", mask_name(i, k)), "m".to_string());
            write(MASK_VISIB_DIR, format!("{}.png", mask_name(i, k)), "v".to_string());
            annotations.push(json!({"id": annotations.len(), "image_id": i, "category_id": 1}));
        }
        camera.insert(
            i,
            json!({"cam_K": [1, 0, 0, 0, 1, 0, 0, 0, 1], "depth_scale": 0.1}),
        );
        gt.insert(
            i,
            json!([{"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [tag, i, 1], "obj_id": 1}]),
        );
        info.insert(i, json!([{"px_count_all": 10}]));
        if with_coco_image(i) {
            images.push(json!({
                "id": i,
                "file_name": format!("rgb/{}.jpg", name),
                "width": 4,
                "height": 3
            }));
        }
    }
    write_json(&dir.join(SCENE_CAMERA), &camera).unwrap();
    write_json(&dir.join(SCENE_GT), &gt).unwrap();
    write_json(&dir.join(SCENE_GT_INFO), &info).unwrap();
    let coco = json!({
        "categories": [{"id": 1, "name": "apple"}],
        "images": images,
        "annotations": annotations
    });
    write_json(&dir.join(SCENE_GT_COCO), &coco).unwrap();
}

#[test]
fn test_merge_two_scenes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("train_pbr");
    let output = dir.path().join("merged");
    write_scene(&input.join("000001"), 5, 2, &|_| true);
    write_scene(&input.join("000000"), 3, 1, &|_| true);

    let summary = merge_scenes(&input, &output, false).unwrap();
    assert_eq!(summary.scenes, 2);
    assert_eq!(summary.frames, 8);
    assert_eq!(summary.frames_without_detection, 0);

    let gt: FrameMap = read_json(&output.join(SCENE_GT)).unwrap();
    assert_eq!(gt.keys().cloned().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
    // local frame 0 of the second scene is global frame 3
    assert_eq!(gt[&3][0]["cam_t_m2c"], serde_json::json!([2, 0, 1]));
    assert_eq!(gt[&2][0]["cam_t_m2c"], serde_json::json!([1, 2, 1]));
    assert_eq!(
        std::fs::read_to_string(output.join(RGB_DIR).join("000003.jpg")).unwrap(),
        "rgb 2 0"
    );
    assert!(output.join(DEPTH_DIR).join("000007.png").exists());

    let camera: FrameMap = read_json(&output.join(SCENE_CAMERA)).unwrap();
    let info: FrameMap = read_json(&output.join(SCENE_GT_INFO)).unwrap();
    assert_eq!(camera.len(), 8);
    assert_eq!(info.len(), 8);
}

#[test]
fn test_merge_masks_are_renumbered_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    write_scene(&input.join("a"), 3, 1, &|_| true);
    write_scene(&input.join("b"), 5, 2, &|_| true);

    let summary = merge_scenes(&input, &output, false).unwrap();
    // instances per frame: 1 2 1 | 1 2 1 2 1, in both mask directories
    assert_eq!(summary.masks, 2 * 11);
    let mut masks = std::fs::read_dir(output.join(MASK_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect::<Vec<_>>();
    masks.sort();
    assert_eq!(masks.len(), 11);
    assert_eq!(
        &masks[..4],
        &[
            "000000_000000.png",
            "000001_000000.png",
            "000001_000001.png",
            "000002_000000.png"
        ]
    );
    assert!(masks.contains(&"000004_000001.png".to_string()));
    assert!(output.join(MASK_VISIB_DIR).join("000006_000001.png").exists());
}

#[test]
fn test_merge_coco_ids() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    write_scene(&input.join("a"), 3, 1, &|_| true);
    write_scene(&input.join("b"), 2, 2, &|_| true);

    let summary = merge_scenes(&input, &output, false).unwrap();
    let coco: CocoDataset = read_json(&output.join(SCENE_GT_COCO)).unwrap();
    assert_eq!(summary.coco_images, 5);
    assert_eq!(
        coco.images.iter().map(|x| x.id).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );
    assert_eq!(coco.images[3].file_name, "rgb/000003.jpg");
    assert_eq!(coco.images[3].extra["width"], 4);
    // 1 2 1 | 1 2 instances
    assert_eq!(coco.annotations.len(), 7);
    assert_eq!(
        coco.annotations.iter().map(|x| x.id).collect::<Vec<_>>(),
        (0..7).collect::<Vec<_>>()
    );
    assert_eq!(
        coco.annotations.iter().map(|x| x.image_id).collect::<Vec<_>>(),
        vec![0, 1, 1, 2, 3, 4, 4]
    );
    assert!(coco.extra.contains_key("categories"));
}

#[test]
fn test_merge_missing_coco_image_keeps_frame() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    write_scene(&input.join("a"), 3, 1, &|i| i != 1);

    let summary = merge_scenes(&input, &output, false).unwrap();
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.frames_without_detection, 1);
    let coco: CocoDataset = read_json(&output.join(SCENE_GT_COCO)).unwrap();
    assert_eq!(coco.images.iter().map(|x| x.id).collect::<Vec<_>>(), vec![0, 2]);
    // annotations still reference the merged frame
    assert_eq!(coco.annotations.iter().filter(|x| x.image_id == 1).count(), 2);
    let gt: FrameMap = read_json(&output.join(SCENE_GT)).unwrap();
    assert!(gt.contains_key(&1));
}

#[test]
fn test_merge_missing_gt_entry_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let scene = input.join("a");
    write_scene(&scene, 2, 1, &|_| true);
    let mut gt: FrameMap = read_json(&scene.join(SCENE_GT)).unwrap();
    gt.remove(&1);
    write_json(&scene.join(SCENE_GT), &gt).unwrap();

    match merge_scenes(&input, &dir.path().join("out"), false) {
        Err(Error::MissingFrame { frame, file }) => {
            assert_eq!(frame, 1);
            assert!(file.ends_with(SCENE_GT));
        }
        x => panic!("expected MissingFrame, got {:?}", x),
    }
}

#[test]
fn test_merge_missing_depth_and_masks() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    let scene = input.join("a");
    write_scene(&scene, 3, 1, &|_| true);
    std::fs::remove_file(scene.join(DEPTH_DIR).join("000001.png")).unwrap();
    std::fs::remove_dir_all(scene.join(MASK_VISIB_DIR)).unwrap();

    let summary = merge_scenes(&input, &output, false).unwrap();
    assert_eq!(summary.frames, 3);
    // instances per frame: 1 2 1, mask/ only
    assert_eq!(summary.masks, 4);
    assert!(output.join(DEPTH_DIR).join("000000.png").exists());
    assert!(!output.join(DEPTH_DIR).join("000001.png").exists());
    assert!(output.join(DEPTH_DIR).join("000002.png").exists());
    assert_eq!(std::fs::read_dir(output.join(MASK_VISIB_DIR)).unwrap().count(), 0);
    let gt: FrameMap = read_json(&output.join(SCENE_GT)).unwrap();
    assert_eq!(gt.len(), 3);
}
