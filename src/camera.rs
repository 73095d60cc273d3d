//! Pinhole camera model and rigid object poses.
extern crate cgmath;

use cgmath::prelude::*;
use cgmath::{Matrix3, Point2, Point3, Vector3};
#[cfg(test)]
use cgmath::AbsDiffEq;
use serde::{Deserialize, Serialize};

use crate::bop::GtInstance;

/// Camera description as stored in BOP `camera.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraInfo {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub depth_scale: Option<f64>,
}

/// Ideal pinhole camera without distortion. Looks down the positive z axis, x right, y down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Image size in pixels as `(width, height)`.
    pub img_size: (u32, u32),
}

impl From<CameraInfo> for PinholeCamera {
    fn from(info: CameraInfo) -> Self {
        PinholeCamera {
            fx: info.fx,
            fy: info.fy,
            cx: info.cx,
            cy: info.cy,
            img_size: (info.width, info.height),
        }
    }
}

impl PinholeCamera {
    /// Camera from a row-major intrinsic matrix `[fx, 0, cx, 0, fy, cy, 0, 0, 1]`. Skew is ignored.
    pub fn from_cam_k(k: &[f64; 9], img_size: (u32, u32)) -> Self {
        PinholeCamera {
            fx: k[0],
            fy: k[4],
            cx: k[2],
            cy: k[5],
            img_size,
        }
    }

    /// Intrinsic matrix `K`.
    pub fn k(&self) -> Matrix3<f64> {
        // cgmath takes columns
        Matrix3::new(
            self.fx, 0.0, 0.0, //
            0.0, self.fy, 0.0, //
            self.cx, self.cy, 1.0,
        )
    }

    /// Project a point in camera coordinates into pixel coordinates. Returns `None` for points in
    /// the plane `z = 0`.
    pub fn project(&self, p: Point3<f64>) -> Option<Point2<f64>> {
        let q = self.k() * p.to_vec();
        if q.z.abs() <= std::f64::EPSILON {
            return None;
        }
        Some(Point2::new(q.x / q.z, q.y / q.z))
    }

    /// Scale pixel coordinates to `[0, 1]` by image width and height.
    pub fn normalize(&self, uv: Point2<f64>) -> Point2<f64> {
        Point2::new(uv.x / self.img_size.0 as f64, uv.y / self.img_size.1 as f64)
    }

    /// Inverse of [PinholeCamera::normalize].
    pub fn denormalize(&self, uv: Point2<f64>) -> Point2<f64> {
        Point2::new(uv.x * self.img_size.0 as f64, uv.y * self.img_size.1 as f64)
    }
}

/// Rigid transform from model to camera coordinates, `p_c = R p_m + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    /// Pose from a row-major rotation and a translation.
    pub fn from_row_major(r: &[f64; 9], t: &[f64; 3]) -> Self {
        Pose {
            rotation: Matrix3::new(r[0], r[3], r[6], r[1], r[4], r[7], r[2], r[5], r[8]),
            translation: Vector3::new(t[0], t[1], t[2]),
        }
    }

    pub fn from_gt(gt: &GtInstance) -> Self {
        Pose::from_row_major(&gt.cam_r_m2c, &gt.cam_t_m2c)
    }

    /// Move a model point into the camera frame.
    pub fn transform_point(&self, p: Point3<f64>) -> Point3<f64> {
        Point3::from_vec(self.rotation * p.to_vec() + self.translation)
    }
}

#[cfg(test)]
fn test_camera() -> PinholeCamera {
    PinholeCamera {
        fx: 500.0,
        fy: 400.0,
        cx: 320.0,
        cy: 240.0,
        img_size: (640, 480),
    }
}

#[test]
fn test_project_principal_point() {
    let c = test_camera();
    let uv = c.project(Point3::new(0.0, 0.0, 2.0)).unwrap();
    assert_eq!(uv, Point2::new(320.0, 240.0));
    assert_eq!(c.normalize(uv), Point2::new(0.5, 0.5));
}

#[test]
fn test_project_off_axis() {
    let c = test_camera();
    let uv = c.project(Point3::new(1.0, -1.0, 2.0)).unwrap();
    assert_eq!(uv, Point2::new(320.0 + 250.0, 240.0 - 200.0));
}

#[test]
fn test_project_zero_depth() {
    assert!(test_camera().project(Point3::new(1.0, 1.0, 0.0)).is_none());
}

#[test]
fn test_normalize_roundtrip() {
    let c = test_camera();
    let uv = Point2::new(123.25, 77.5);
    assert!(c.denormalize(c.normalize(uv)).abs_diff_eq(&uv, 1e-12));
}

#[test]
fn test_from_cam_k() {
    let c = PinholeCamera::from_cam_k(
        &[500.0, 0.0, 320.0, 0.0, 400.0, 240.0, 0.0, 0.0, 1.0],
        (640, 480),
    );
    assert_eq!(c, test_camera());
}

#[test]
fn test_pose_row_major() {
    // 90 degrees about z: x -> y
    let pose = Pose::from_row_major(
        &[0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        &[0.0, 0.0, 10.0],
    );
    let p = pose.transform_point(Point3::new(1.0, 0.0, 0.0));
    assert!(p.abs_diff_eq(&Point3::new(0.0, 1.0, 10.0), 1e-12));
}

#[test]
fn test_camera_info_json() {
    let info: CameraInfo = serde_json::from_str(
        r#"{"cx": 320.0, "cy": 240.0, "depth_scale": 0.1, "fx": 500.0, "fy": 400.0,
            "height": 480, "width": 640}"#,
    )
    .unwrap();
    assert_eq!(PinholeCamera::from(info), test_camera());
    assert_eq!(info.depth_scale, Some(0.1));
}
