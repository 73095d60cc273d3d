extern crate bop2ssp;
extern crate env_logger;
extern crate structopt;

use bop2ssp::models_info::*;
use bop2ssp::Error;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "models_info",
    about = "Compute BOP models_info.json (bounding boxes and diameters) for a directory of meshes"
)]
struct Opt {
    /// Directory of .ply or .obj meshes named like obj_000001.ply.
    #[structopt(name = "MODELS", parse(from_os_str))]
    models: std::path::PathBuf,

    /// Output file. Defaults to models_info.json next to the models directory.
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<std::path::PathBuf>,

    /// Factor applied to mesh coordinates. The default converts meters to millimeters.
    #[structopt(long = "scale", default_value = "1000")]
    scale: f64,

    /// Hide the progress bar.
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::from_args();

    let info = models_info(&opt.models, opt.scale, !opt.quiet)?;
    let output = match opt.output {
        Some(path) => path,
        None => default_output(&opt.models),
    };
    write_models_info(&output, &info)?;

    println!("Wrote info for {} models to {}", info.len(), output.display());
    Ok(())
}
