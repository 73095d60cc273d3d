extern crate bop2ssp;
extern crate env_logger;
extern crate structopt;

use bop2ssp::merge::merge_scenes;
use bop2ssp::Error;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "merge_scenes",
    about = "Merge BOP scenes into one bundle with global frame numbers"
)]
struct Opt {
    /// Directory with one subdirectory per scene.
    #[structopt(name = "INPUT", parse(from_os_str))]
    input: std::path::PathBuf,

    /// Output directory. Created if it does not exist, files with the same name are overwritten.
    #[structopt(name = "OUTPUT", parse(from_os_str))]
    output: std::path::PathBuf,

    /// Hide the progress bar.
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::from_args();

    let summary = merge_scenes(&opt.input, &opt.output, !opt.quiet)?;
    println!("{}", summary);
    Ok(())
}
