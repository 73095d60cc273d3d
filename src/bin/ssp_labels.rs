extern crate bop2ssp;
extern crate env_logger;
extern crate structopt;

use bop2ssp::labels::*;
use bop2ssp::*;
use std::collections::BTreeMap;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "ssp_labels",
    about = "Write SingleShotPose labels for every frame of a merged BOP bundle"
)]
struct Opt {
    /// Merged bundle containing scene_gt.json and rgb/.
    #[structopt(name = "MERGED", parse(from_os_str))]
    merged: std::path::PathBuf,

    /// BOP camera.json with fx, fy, cx, cy, width and height.
    #[structopt(short = "c", long = "camera", parse(from_os_str))]
    camera: std::path::PathBuf,

    /// Mesh of the labelled object (.ply or .obj), in the units of cam_t_m2c.
    #[structopt(short = "m", long = "model", parse(from_os_str))]
    model: std::path::PathBuf,

    /// Output directory. Defaults to labels/ inside the merged bundle.
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<std::path::PathBuf>,

    /// Only consider instances of this object id. It is also written as the class of each label.
    #[structopt(long = "obj-id")]
    obj_id: Option<u64>,

    /// Take the intrinsics of each frame from cam_K in the merged scene_camera.json. Image size
    /// still comes from --camera.
    #[structopt(long = "per-frame-intrinsics")]
    per_frame_intrinsics: bool,

    /// Hide the progress bar.
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::from_args();

    let camera = PinholeCamera::from(read_json::<CameraInfo>(&opt.camera)?);
    let intrinsics = if opt.per_frame_intrinsics {
        let entries: BTreeMap<u64, CameraEntry> = read_json(&opt.merged.join(SCENE_CAMERA))?;
        Intrinsics::PerFrame(camera, entries)
    } else {
        Intrinsics::Global(camera)
    };
    let mesh = Mesh::from_file(&opt.model)?;
    let output = opt
        .output
        .clone()
        .unwrap_or_else(|| opt.merged.join(LABELS_DIR));

    let written = write_labels(
        &opt.merged,
        &output,
        &intrinsics,
        &mesh,
        opt.obj_id,
        !opt.quiet,
    )?;
    println!("Wrote {} labels to {}", written, output.display());
    Ok(())
}
