//! Post-processing for synthetic datasets in the BOP (Benchmark for Object Pose estimation)
//! layout.
//!
//! The crate is split into four independent batch steps, each with a binary in `src/bin`:
//! - [models_info]: compute `models_info.json` from a directory of meshes.
//! - [merge]: merge per-scene BOP bundles into one globally numbered bundle.
//! - [labels]: project the bounding box of a model into every merged frame and write
//!   SingleShotPose label files.
//! - [split]: shuffle the merged frames into train/val/test subsets.
extern crate indicatif;
extern crate serde_json;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use std::path::Path;

pub mod bop;
pub mod camera;
pub mod labels;
pub mod merge;
pub mod mesh;
pub mod models_info;
pub mod split;

pub use bop::*;
pub use camera::*;
pub use mesh::*;

#[derive(Debug)]
pub enum Error {
    ParseError(String),
    /// Mesh file name does not encode an integer model id.
    InvalidModelId(String),
    /// Mesh without any vertices.
    EmptyMesh(String),
    /// A frame is missing from one of the annotation maps.
    MissingFrame { file: String, frame: u64 },
    /// Frame does not contain exactly one candidate object instance.
    InstanceCount { frame: u64, count: usize },
    /// A reference point lies in the camera plane (z = 0).
    DegenerateProjection { frame: u64 },
    JsonError(serde_json::Error),
    IOError(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ParseError(s) => write!(f, "parse error: {}", s),
            Error::InvalidModelId(name) => {
                write!(f, "could not parse a model id from file name {}", name)
            }
            Error::EmptyMesh(name) => write!(f, "mesh {} has no vertices", name),
            Error::MissingFrame { file, frame } => {
                write!(f, "frame {} is missing from {}", frame, file)
            }
            Error::InstanceCount { frame, count } => write!(
                f,
                "frame {} has {} candidate object instances, expected exactly 1",
                frame, count
            ),
            Error::DegenerateProjection { frame } => write!(
                f,
                "frame {} places a reference point at zero depth, cannot project it",
                frame
            ),
            Error::JsonError(e) => write!(f, "json error: {}", e),
            Error::IOError(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::JsonError(e) => Some(e),
            Error::IOError(e) => Some(e),
            _ => None,
        }
    }
}

/// Bar over `length` items labelled with `message`. Nothing is drawn unless `verbose`.
pub(crate) fn progress_bar(length: usize, message: &str, verbose: bool) -> ProgressBar {
    let target = if verbose {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(length as u64, target);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>18} {wide_bar} {pos}/{len} [{elapsed_precise}]")
            .progress_chars("=> "),
    );
    pb.set_message(message);
    pb
}

/// Copy `src` to `dst`, naming both files in the error.
pub(crate) fn copy_file(src: &Path, dst: &Path) -> Result<(), Error> {
    std::fs::copy(src, dst).map(|_| ()).map_err(|e| {
        Error::IOError(std::io::Error::new(
            e.kind(),
            format!("copying {} to {}: {}", src.display(), dst.display(), e),
        ))
    })
}

#[test]
fn test_quiet_progress_bar_still_counts() {
    let pb = progress_bar(4, "Frames", false);
    assert!(pb.is_hidden());
    pb.inc(3);
    assert_eq!(pb.position(), 3);
}
