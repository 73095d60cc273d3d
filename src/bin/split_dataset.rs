extern crate bop2ssp;
extern crate env_logger;
extern crate structopt;

use bop2ssp::split::*;
use bop2ssp::Error;
use std::str::FromStr;
use structopt::StructOpt;

// helper to check ratios with structopt
fn parse_ratio(s: &str) -> Result<f64, String> {
    match f64::from_str(s) {
        Ok(x) if x >= 0.0 && x <= 1.0 => Ok(x),
        _ => Err(format!("ratio must be between 0.0 and 1.0, got {}", s)),
    }
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "split_dataset",
    about = "Randomly split a merged BOP bundle into train, val and test subsets"
)]
struct Opt {
    /// Merged bundle with rgb/, labels/, depth/, mask/ and mask_visib/.
    #[structopt(name = "MERGED", parse(from_os_str))]
    merged: std::path::PathBuf,

    /// Fraction of images used for training.
    #[structopt(name = "TRAIN", parse(try_from_str = parse_ratio))]
    train: f64,

    /// Fraction of images used for validation.
    #[structopt(name = "VAL", parse(try_from_str = parse_ratio))]
    val: f64,

    /// Fraction of images used for testing. The test set receives all remaining images.
    #[structopt(name = "TEST", parse(try_from_str = parse_ratio))]
    test: f64,

    /// Seed of the shuffle.
    #[structopt(long = "seed", default_value = "42")]
    seed: u64,

    /// Hide the progress bar.
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::from_args();

    let ratios = SplitRatios {
        train: opt.train,
        val: opt.val,
        test: opt.test,
    };
    let summary = split_dataset(&opt.merged, &ratios, opt.seed, !opt.quiet)?;
    println!("{}", summary);
    Ok(())
}
