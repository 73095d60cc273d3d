//! SingleShotPose labels: the bounding box of a model projected into every merged frame.
//!
//! A label file holds a single line of 21 numbers
//! ```txt
//! <class> <u0> <v0> ... <u8> <v8> <u extent> <v extent>
//! ```
//! where point 0 is the center of the model's bounding box, points 1-8 are its corners and all
//! coordinates are divided by the image width (u) or height (v).
extern crate cgmath;
extern crate nom;

use cgmath::{Point2, Point3};
use itertools::Itertools;
use nom::character::complete::{multispace0, space0};
use nom::combinator::all_consuming;
use nom::multi::count;
use nom::number::complete::double;
use nom::sequence::preceded;
use nom::IResult;

use std::collections::BTreeMap;
use std::path::Path;

use crate::bop::*;
use crate::camera::{PinholeCamera, Pose};
use crate::mesh::Mesh;
use crate::{progress_bar, Error};

/// Number of projected reference points per label.
pub const NUM_REFERENCE_POINTS: usize = 9;

/// Number of values in a label line.
pub const LABEL_FIELDS: usize = 1 + 2 * NUM_REFERENCE_POINTS + 2;

/// Bounding box center followed by the eight bounding box corners of `mesh`.
pub fn reference_points(mesh: &Mesh) -> [Point3<f64>; NUM_REFERENCE_POINTS] {
    let (lo, hi) = mesh.bounds();
    [
        mesh.bounds_center(),
        Point3::new(lo.x, lo.y, lo.z),
        Point3::new(lo.x, lo.y, hi.z),
        Point3::new(lo.x, hi.y, lo.z),
        Point3::new(lo.x, hi.y, hi.z),
        Point3::new(hi.x, lo.y, lo.z),
        Point3::new(hi.x, lo.y, hi.z),
        Point3::new(hi.x, hi.y, lo.z),
        Point3::new(hi.x, hi.y, hi.z),
    ]
}

/// One label line. Points are normalized to the image size.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRecord {
    pub class_id: u64,
    pub points: Vec<Point2<f64>>,
    /// `(max(u) - min(u), max(v) - min(v))` over all points.
    pub extent: (f64, f64),
}

impl LabelRecord {
    pub fn new(class_id: u64, points: Vec<Point2<f64>>) -> Self {
        let (u_lo, u_hi) = points
            .iter()
            .fold((std::f64::INFINITY, std::f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.x), hi.max(p.x))
            });
        let (v_lo, v_hi) = points
            .iter()
            .fold((std::f64::INFINITY, std::f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.y), hi.max(p.y))
            });
        LabelRecord {
            class_id,
            points,
            extent: (u_hi - u_lo, v_hi - v_lo),
        }
    }

    /// Project model points posed by `pose` through `camera`. `frame` is only used for errors.
    pub fn project(
        camera: &PinholeCamera,
        pose: &Pose,
        model_points: &[Point3<f64>],
        class_id: u64,
        frame: u64,
    ) -> Result<Self, Error> {
        let points = model_points
            .iter()
            .map(|p| {
                camera
                    .project(pose.transform_point(*p))
                    .map(|uv| camera.normalize(uv))
                    .ok_or(Error::DegenerateProjection { frame })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LabelRecord::new(class_id, points))
    }

    /// Flat list of all values in file order.
    pub fn values(&self) -> Vec<f64> {
        std::iter::once(self.class_id as f64)
            .chain(self.points.iter().flat_map(|p| vec![p.x, p.y]))
            .chain(vec![self.extent.0, self.extent.1])
            .collect()
    }

    /// Label line, every value with 6 decimals, newline terminated.
    pub fn to_line(&self) -> String {
        format!(
            "{}\n",
            self.values().iter().map(|x| format!("{:.6}", x)).join(" ")
        )
    }

    /// Parse a label line written by [LabelRecord::to_line].
    pub fn parse(line: &str) -> Result<Self, Error> {
        fn parse_internal(input: &str) -> IResult<&str, Vec<f64>> {
            let (input, values) = count(preceded(space0, double), LABEL_FIELDS)(input)?;
            let (input, _) = multispace0(input)?;
            Ok((input, values))
        }

        let values = all_consuming(parse_internal)(line)
            .map(|x| x.1)
            .map_err(|e| Error::ParseError(format!("label line {:?}: {:?}", line, e)))?;
        let class = values[0];
        if class < 0.0 || class.fract() != 0.0 {
            return Err(Error::ParseError(format!(
                "label class {} is not a non-negative integer",
                class
            )));
        }
        let points = values[1..1 + 2 * NUM_REFERENCE_POINTS]
            .chunks(2)
            .map(|uv| Point2::new(uv[0], uv[1]))
            .collect();
        Ok(LabelRecord {
            class_id: class as u64,
            points,
            extent: (values[LABEL_FIELDS - 2], values[LABEL_FIELDS - 1]),
        })
    }

    /// Points in pixel coordinates of `camera`'s image.
    pub fn denormalize(&self, camera: &PinholeCamera) -> Vec<Point2<f64>> {
        self.points.iter().map(|p| camera.denormalize(*p)).collect()
    }
}

/// The single instance of `frame` that the label describes. With `obj_id` only instances of that
/// object are candidates. Zero or several candidates is an error.
pub fn select_instance<'a>(
    instances: &'a [GtInstance],
    obj_id: Option<u64>,
    frame: u64,
) -> Result<&'a GtInstance, Error> {
    let candidates = instances
        .iter()
        .filter(|x| obj_id.map(|id| x.obj_id == id).unwrap_or(true))
        .collect::<Vec<_>>();
    match candidates.as_slice() {
        [instance] => Ok(*instance),
        _ => Err(Error::InstanceCount {
            frame,
            count: candidates.len(),
        }),
    }
}

/// Where the intrinsics of each frame come from.
#[derive(Debug, Clone)]
pub enum Intrinsics {
    /// One camera for all frames.
    Global(PinholeCamera),
    /// `cam_K` of each frame in `scene_camera.json`, image size from the given camera.
    PerFrame(PinholeCamera, BTreeMap<u64, CameraEntry>),
}

impl Intrinsics {
    fn camera(&self, frame: u64) -> Result<PinholeCamera, Error> {
        match self {
            Intrinsics::Global(camera) => Ok(*camera),
            Intrinsics::PerFrame(camera, entries) => entries
                .get(&frame)
                .map(|e| PinholeCamera::from_cam_k(&e.cam_k, camera.img_size))
                .ok_or_else(|| Error::MissingFrame {
                    file: SCENE_CAMERA.to_string(),
                    frame,
                }),
        }
    }
}

/// Write one label file per image in `merged_dir/rgb` into `output_dir`. Returns the number of
/// labels written.
pub fn write_labels(
    merged_dir: &Path,
    output_dir: &Path,
    intrinsics: &Intrinsics,
    mesh: &Mesh,
    obj_id: Option<u64>,
    verbose: bool,
) -> Result<usize, Error> {
    std::fs::create_dir_all(output_dir)?;
    let model_points = reference_points(mesh);
    let gt: BTreeMap<u64, Vec<GtInstance>> = read_json(&merged_dir.join(SCENE_GT))?;
    let frames = list_frames(&merged_dir.join(RGB_DIR))?;

    let pb = progress_bar(frames.len(), "Processing images", verbose);
    for (frame, _) in frames.iter() {
        let instances = gt.get(frame).ok_or_else(|| Error::MissingFrame {
            file: merged_dir.join(SCENE_GT).display().to_string(),
            frame: *frame,
        })?;
        let instance = select_instance(instances, obj_id, *frame)?;
        let record = LabelRecord::project(
            &intrinsics.camera(*frame)?,
            &Pose::from_gt(instance),
            &model_points,
            instance.obj_id,
            *frame,
        )?;
        std::fs::write(
            output_dir.join(format!("{}.txt", frame_name(*frame))),
            record.to_line(),
        )?;
        pb.inc(1);
    }
    pb.finish();

    Ok(frames.len())
}

#[cfg(test)]
fn test_camera() -> PinholeCamera {
    PinholeCamera {
        fx: 100.0,
        fy: 100.0,
        cx: 50.0,
        cy: 40.0,
        img_size: (100, 80),
    }
}

#[cfg(test)]
fn unit_cube() -> Mesh {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/cube.obj");
    Mesh::from_file(&path).unwrap()
}

#[cfg(test)]
fn gt_instance(obj_id: u64, t: [f64; 3]) -> GtInstance {
    GtInstance {
        cam_r_m2c: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        cam_t_m2c: t,
        obj_id,
    }
}

#[test]
fn test_reference_points_order() {
    let points = reference_points(&unit_cube());
    assert_eq!(points[0], Point3::new(0.0, 0.0, 0.0));
    assert_eq!(points[1], Point3::new(-1.0, -1.0, -1.0));
    assert_eq!(points[2], Point3::new(-1.0, -1.0, 1.0));
    assert_eq!(points[3], Point3::new(-1.0, 1.0, -1.0));
    assert_eq!(points[5], Point3::new(1.0, -1.0, -1.0));
    assert_eq!(points[8], Point3::new(1.0, 1.0, 1.0));
}

#[test]
fn test_project_cube() {
    let camera = test_camera();
    let pose = Pose::from_gt(&gt_instance(4, [0.0, 0.0, 10.0]));
    let record =
        LabelRecord::project(&camera, &pose, &reference_points(&unit_cube()), 4, 0).unwrap();

    assert_eq!(record.class_id, 4);
    assert_eq!(record.points.len(), NUM_REFERENCE_POINTS);
    assert_eq!(record.points[0], Point2::new(0.5, 0.5));
    // nearest face at z = 9 spans the largest extent
    let half = 100.0 / 9.0;
    assert!((record.extent.0 - 2.0 * half / 100.0).abs() < 1e-12);
    assert!((record.extent.1 - 2.0 * half / 80.0).abs() < 1e-12);
    assert!((record.points[1].x - (50.0 - half) / 100.0).abs() < 1e-12);
    assert_eq!(record.values().len(), LABEL_FIELDS);
}

#[test]
fn test_label_line_roundtrip_and_denormalize() {
    let camera = test_camera();
    let pose = Pose::from_row_major(
        &[0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        &[0.5, -0.25, 6.0],
    );
    let points = reference_points(&unit_cube());
    let record = LabelRecord::project(&camera, &pose, &points, 1, 0).unwrap();

    let line = record.to_line();
    assert!(line.ends_with('\n'));
    assert!(line.starts_with("1.000000 "));
    assert_eq!(line.trim_end().split(' ').count(), LABEL_FIELDS);

    let parsed = LabelRecord::parse(&line).unwrap();
    assert_eq!(parsed.class_id, 1);
    for (pixel, model) in parsed.denormalize(&camera).iter().zip(points.iter()) {
        let expected = camera.project(pose.transform_point(*model)).unwrap();
        assert!((pixel.x - expected.x).abs() < 1e-4);
        assert!((pixel.y - expected.y).abs() < 1e-4);
    }
}

#[test]
fn test_parse_rejects_short_line() {
    assert!(LabelRecord::parse("1.0 0.5 0.5").is_err());
    let mut values = vec!["0.5"; LABEL_FIELDS];
    values[0] = "1.5";
    assert!(LabelRecord::parse(&values.join(" ")).is_err());
}

#[test]
fn test_zero_depth_is_degenerate() {
    let pose = Pose::from_gt(&gt_instance(1, [0.0, 0.0, 1.0]));
    match LabelRecord::project(&test_camera(), &pose, &reference_points(&unit_cube()), 1, 7) {
        Err(Error::DegenerateProjection { frame }) => assert_eq!(frame, 7),
        x => panic!("expected DegenerateProjection, got {:?}", x),
    }
}

#[test]
fn test_select_instance() {
    let one = vec![gt_instance(1, [0.0, 0.0, 5.0])];
    assert_eq!(select_instance(&one, None, 0).unwrap().obj_id, 1);

    let two = vec![
        gt_instance(1, [0.0, 0.0, 5.0]),
        gt_instance(2, [0.0, 0.0, 5.0]),
    ];
    match select_instance(&two, None, 3) {
        Err(Error::InstanceCount { frame, count }) => assert_eq!((frame, count), (3, 2)),
        x => panic!("expected InstanceCount, got {:?}", x),
    }
    assert_eq!(select_instance(&two, Some(2), 3).unwrap().obj_id, 2);
    assert!(select_instance(&two, Some(9), 3).is_err());
    assert!(select_instance(&[], None, 0).is_err());
}

#[test]
fn test_write_labels() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let merged = dir.path();
    std::fs::create_dir(merged.join(RGB_DIR)).unwrap();
    std::fs::write(merged.join(RGB_DIR).join("000000.jpg"), "").unwrap();
    std::fs::write(merged.join(RGB_DIR).join("000001.jpg"), "").unwrap();
    let gt = json!({
        "0": [{"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [0, 0, 10], "obj_id": 3}],
        "1": [{"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [1, 0, 10], "obj_id": 3}]
    });
    write_json(&merged.join(SCENE_GT), &gt).unwrap();

    let out = merged.join(LABELS_DIR);
    let n = write_labels(
        merged,
        &out,
        &Intrinsics::Global(test_camera()),
        &unit_cube(),
        None,
        false,
    )
    .unwrap();
    assert_eq!(n, 2);

    let first = LabelRecord::parse(&std::fs::read_to_string(out.join("000000.txt")).unwrap())
        .unwrap();
    let second = LabelRecord::parse(&std::fs::read_to_string(out.join("000001.txt")).unwrap())
        .unwrap();
    assert_eq!(first.class_id, 3);
    assert_eq!(first.points[0], Point2::new(0.5, 0.5));
    assert_eq!(second.points[0], Point2::new(0.6, 0.5));
}

#[test]
fn test_per_frame_intrinsics() {
    let mut entries = BTreeMap::new();
    entries.insert(
        2,
        CameraEntry {
            cam_k: [200.0, 0.0, 10.0, 0.0, 300.0, 20.0, 0.0, 0.0, 1.0],
            depth_scale: None,
            extra: serde_json::Map::new(),
        },
    );
    let intrinsics = Intrinsics::PerFrame(test_camera(), entries);
    let camera = intrinsics.camera(2).unwrap();
    assert_eq!((camera.fx, camera.fy, camera.cx, camera.cy), (200.0, 300.0, 10.0, 20.0));
    assert_eq!(camera.img_size, (100, 80));
    assert!(intrinsics.camera(0).is_err());
}

#[cfg(test)]
fn write_merged_gt(dir: &Path, gt: &serde_json::Value, frames: &[&str]) {
    std::fs::create_dir_all(dir.join(RGB_DIR)).unwrap();
    for name in frames {
        std::fs::write(dir.join(RGB_DIR).join(name), "").unwrap();
    }
    write_json(&dir.join(SCENE_GT), gt).unwrap();
}

#[test]
fn test_write_labels_missing_gt_is_fatal() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let gt = json!({
        "0": [{"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [0, 0, 10], "obj_id": 1}]
    });
    write_merged_gt(dir.path(), &gt, &["000000.jpg", "000001.jpg"]);

    let result = write_labels(
        dir.path(),
        &dir.path().join(LABELS_DIR),
        &Intrinsics::Global(test_camera()),
        &unit_cube(),
        None,
        false,
    );
    match result {
        Err(Error::MissingFrame { file, frame }) => {
            assert_eq!(frame, 1);
            assert!(file.ends_with(SCENE_GT));
        }
        x => panic!("expected MissingFrame, got {:?}", x),
    }
}

#[test]
fn test_write_labels_obj_id_filter() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let gt = json!({
        "0": [
            {"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [-1, 0, 10], "obj_id": 3},
            {"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [1, 0, 10], "obj_id": 5}
        ]
    });
    write_merged_gt(dir.path(), &gt, &["000000.jpg"]);
    let out = dir.path().join(LABELS_DIR);
    let intrinsics = Intrinsics::Global(test_camera());

    match write_labels(dir.path(), &out, &intrinsics, &unit_cube(), None, false) {
        Err(Error::InstanceCount { frame, count }) => assert_eq!((frame, count), (0, 2)),
        x => panic!("expected InstanceCount, got {:?}", x),
    }

    let n = write_labels(dir.path(), &out, &intrinsics, &unit_cube(), Some(5), false).unwrap();
    assert_eq!(n, 1);
    let record =
        LabelRecord::parse(&std::fs::read_to_string(out.join("000000.txt")).unwrap()).unwrap();
    assert_eq!(record.class_id, 5);
    assert_eq!(record.points[0], Point2::new(0.6, 0.5));
}

#[test]
fn test_write_labels_per_frame_intrinsics() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let gt = json!({
        "0": [{"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [0, 0, 10], "obj_id": 2}],
        "1": [{"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [0, 0, 10], "obj_id": 2}]
    });
    write_merged_gt(dir.path(), &gt, &["000000.png", "000001.png"]);
    let entries: BTreeMap<u64, CameraEntry> = serde_json::from_value(json!({
        "0": {"cam_K": [100, 0, 30, 0, 100, 20, 0, 0, 1]},
        "1": {"cam_K": [100, 0, 50, 0, 100, 40, 0, 0, 1], "depth_scale": 0.1}
    }))
    .unwrap();
    let out = dir.path().join(LABELS_DIR);

    let n = write_labels(
        dir.path(),
        &out,
        &Intrinsics::PerFrame(test_camera(), entries),
        &unit_cube(),
        None,
        false,
    )
    .unwrap();
    assert_eq!(n, 2);
    let read = |name: &str| {
        LabelRecord::parse(&std::fs::read_to_string(out.join(name)).unwrap()).unwrap()
    };
    // principal point moves with cam_K, image size stays 100x80
    assert_eq!(read("000000.txt").points[0], Point2::new(0.3, 0.25));
    assert_eq!(read("000001.txt").points[0], Point2::new(0.5, 0.5));
}

#[test]
fn test_write_labels_counts_each_frame_once() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let gt = json!({
        "0": [{"cam_R_m2c": [1, 0, 0, 0, 1, 0, 0, 0, 1], "cam_t_m2c": [0, 0, 10], "obj_id": 1}]
    });
    write_merged_gt(dir.path(), &gt, &["000000.jpg", "000000.png"]);
    let out = dir.path().join(LABELS_DIR);

    let n = write_labels(
        dir.path(),
        &out,
        &Intrinsics::Global(test_camera()),
        &unit_cube(),
        None,
        false,
    )
    .unwrap();
    assert_eq!(n, 1);
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
}
