//! Random train/val/test split of a merged bundle.
//!
//! The images of `rgb/` are shuffled with a seeded RNG and copied, together with their labels,
//! depth images and masks, into `train/`, `val/` and `test/` below the merged directory.
extern crate rand;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::bop::*;
use crate::{copy_file, progress_bar, Error};

pub const DEFAULT_SEED: u64 = 42;

/// Output subsets, in assignment order.
pub const SPLITS: [&str; 3] = ["train", "val", "test"];

/// Directories created inside every subset.
pub const SPLIT_DIRS: [&str; 5] = [RGB_DIR, LABELS_DIR, DEPTH_DIR, MASK_DIR, MASK_VISIB_DIR];

/// Fractions of the images assigned to each subset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

/// Number of images in each subset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SplitSummary {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl std::fmt::Display for SplitSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Train: {}, Val: {}, Test: {}", self.train, self.val, self.test)
    }
}

/// Subset sizes for `n` images. Train and val are truncated and clamped so they never exceed
/// `n`, test gets the remainder.
pub fn split_counts(n: usize, ratios: &SplitRatios) -> SplitSummary {
    if ratios.train + ratios.val > 1.0 {
        log::warn!(
            "Train ratio {} and val ratio {} add up to more than 1, clamping to {} images",
            ratios.train,
            ratios.val,
            n
        );
    }
    let train = ((n as f64 * ratios.train).floor() as usize).min(n);
    let val = ((n as f64 * ratios.val).floor() as usize).min(n - train);
    let test = n - train - val;

    let expected_test = n as f64 * ratios.test;
    if (expected_test - test as f64).abs() > 1.0 {
        log::warn!(
            "Test ratio {} asks for {:.0} images, the remaining {} are used",
            ratios.test,
            expected_test,
            test
        );
    }

    SplitSummary { train, val, test }
}

/// File names in `dir`, or nothing if `dir` does not exist.
fn file_names(dir: &Path) -> Result<BTreeSet<String>, Error> {
    if !dir.is_dir() {
        return Ok(BTreeSet::new());
    }
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

/// Mask files `{base}_*.png` in a sorted listing.
fn masks_of<'a>(names: &'a BTreeSet<String>, base: &str) -> Vec<&'a String> {
    let prefix = format!("{}_", base);
    names
        .range(prefix.clone()..)
        .take_while(|x| x.starts_with(&prefix))
        .filter(|x| x.ends_with(".png"))
        .collect()
}

/// Copies one image and its companions into a subset directory.
struct SplitWriter {
    merged_dir: PathBuf,
    masks: Vec<(&'static str, BTreeSet<String>)>,
}

impl SplitWriter {
    fn new(merged_dir: &Path) -> Result<Self, Error> {
        let masks = [MASK_DIR, MASK_VISIB_DIR]
            .iter()
            .map(|d| file_names(&merged_dir.join(d)).map(|names| (*d, names)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SplitWriter {
            merged_dir: merged_dir.to_path_buf(),
            masks,
        })
    }

    /// Copy `image` and its companions into `split_dir`. Returns the companion directories that
    /// had nothing for this image.
    fn copy(&self, image: &Path, split_dir: &Path) -> Result<Vec<&'static str>, Error> {
        let mut missing = Vec::new();
        let file_name = match image.file_name() {
            Some(x) => x,
            None => return Ok(missing),
        };
        let base = image
            .file_stem()
            .and_then(|x| x.to_str())
            .unwrap_or_default();
        copy_file(image, &split_dir.join(RGB_DIR).join(file_name))?;

        for (dir, name) in &[
            (LABELS_DIR, format!("{}.txt", base)),
            (DEPTH_DIR, format!("{}.png", base)),
        ] {
            let src = self.merged_dir.join(dir).join(name);
            if src.is_file() {
                copy_file(&src, &split_dir.join(dir).join(name))?;
            } else {
                log::warn!("Missing {} for {}", src.display(), image.display());
                missing.push(*dir);
            }
        }

        for (dir, names) in &self.masks {
            let masks = masks_of(names, base);
            if masks.is_empty() {
                log::warn!("No {} found for {}", dir, image.display());
                missing.push(*dir);
            }
            for name in masks {
                copy_file(
                    &self.merged_dir.join(dir).join(name),
                    &split_dir.join(dir).join(name),
                )?;
            }
        }
        Ok(missing)
    }
}

/// Shuffle the images of `merged_dir/rgb` with `seed` and copy them into the train, val and
/// test subsets.
pub fn split_dataset(
    merged_dir: &Path,
    ratios: &SplitRatios,
    seed: u64,
    verbose: bool,
) -> Result<SplitSummary, Error> {
    let mut images = list_images(&merged_dir.join(RGB_DIR))?;
    let mut rng = StdRng::seed_from_u64(seed);
    images.shuffle(&mut rng);

    let summary = split_counts(images.len(), ratios);
    let bounds = [
        summary.train,
        summary.train + summary.val,
        images.len(),
    ];

    let split_dirs = SPLITS
        .iter()
        .map(|s| merged_dir.join(s))
        .collect::<Vec<_>>();
    for dir in &split_dirs {
        for sub in SPLIT_DIRS.iter() {
            std::fs::create_dir_all(dir.join(sub))?;
        }
    }

    let writer = SplitWriter::new(merged_dir)?;
    let pb = progress_bar(images.len(), "Splitting dataset", verbose);
    let mut start = 0;
    for (dir, end) in split_dirs.iter().zip(bounds.iter()) {
        for image in &images[start..*end] {
            writer.copy(image, dir)?;
            pb.inc(1);
        }
        start = *end;
    }
    pb.finish();

    Ok(summary)
}

#[cfg(test)]
fn write_merged(dir: &Path, n: usize) {
    for sub in &[RGB_DIR, LABELS_DIR, DEPTH_DIR, MASK_DIR, MASK_VISIB_DIR] {
        std::fs::create_dir_all(dir.join(sub)).unwrap();
    }
    for i in 0..n {
        let base = frame_name(i as u64);
        std::fs::write(dir.join(RGB_DIR).join(format!("{}.jpg", base)), &base).unwrap();
        std::fs::write(dir.join(LABELS_DIR).join(format!("{}.txt", base)), &base).unwrap();
        std::fs::write(dir.join(DEPTH_DIR).join(format!("{}.png", base)), &base).unwrap();
        for k in 0..2 {
            let mask = format!("{}.png", mask_name(i as u64, k));
            std::fs::write(dir.join(MASK_DIR).join(&mask), &mask).unwrap();
            std::fs::write(dir.join(MASK_VISIB_DIR).join(&mask), &mask).unwrap();
        }
    }
}

#[cfg(test)]
fn stems(dir: &Path) -> BTreeSet<String> {
    list_images(dir)
        .unwrap()
        .iter()
        .map(|p| p.file_stem().unwrap().to_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_split_counts() {
    let r = SplitRatios {
        train: 0.8,
        val: 0.2,
        test: 0.0,
    };
    assert_eq!(
        split_counts(100, &r),
        SplitSummary {
            train: 80,
            val: 20,
            test: 0
        }
    );
    let r = SplitRatios {
        train: 0.7,
        val: 0.2,
        test: 0.1,
    };
    assert_eq!(
        split_counts(9, &r),
        SplitSummary {
            train: 6,
            val: 1,
            test: 2
        }
    );
    assert_eq!(split_counts(0, &r), SplitSummary::default());
}

#[test]
fn test_split_counts_clamped() {
    let r = SplitRatios {
        train: 0.9,
        val: 0.9,
        test: 0.0,
    };
    let s = split_counts(10, &r);
    assert_eq!((s.train, s.val, s.test), (9, 1, 0));
    let r = SplitRatios {
        train: 1.0,
        val: 1.0,
        test: 1.0,
    };
    let s = split_counts(10, &r);
    assert_eq!((s.train, s.val, s.test), (10, 0, 0));
}

#[test]
fn test_masks_of() {
    let names = vec![
        "000001_000000.png",
        "000001_000001.png",
        "000010_000000.png",
        "00001_000000.png",
        "000001_000002.txt",
    ]
    .into_iter()
    .map(String::from)
    .collect::<BTreeSet<_>>();
    assert_eq!(
        masks_of(&names, "000001"),
        vec!["000001_000000.png", "000001_000001.png"]
    );
    assert!(masks_of(&names, "000002").is_empty());
}

#[test]
fn test_split_dataset_partition() {
    let dir = tempfile::tempdir().unwrap();
    write_merged(dir.path(), 20);
    let ratios = SplitRatios {
        train: 0.5,
        val: 0.25,
        test: 0.25,
    };
    let summary = split_dataset(dir.path(), &ratios, DEFAULT_SEED, false).unwrap();
    assert_eq!(summary.to_string(), "Train: 10, Val: 5, Test: 5");

    let subsets = SPLITS
        .iter()
        .map(|s| stems(&dir.path().join(s).join(RGB_DIR)))
        .collect::<Vec<_>>();
    assert_eq!(subsets[0].len(), 10);
    assert_eq!(subsets[1].len(), 5);
    assert_eq!(subsets[2].len(), 5);
    let all = subsets.iter().flatten().cloned().collect::<BTreeSet<_>>();
    assert_eq!(all, stems(&dir.path().join(RGB_DIR)));

    for (s, subset) in SPLITS.iter().zip(subsets.iter()) {
        let split_dir = dir.path().join(s);
        for base in subset {
            assert!(split_dir.join(LABELS_DIR).join(format!("{}.txt", base)).is_file());
            assert!(split_dir.join(DEPTH_DIR).join(format!("{}.png", base)).is_file());
            assert!(split_dir
                .join(MASK_VISIB_DIR)
                .join(format!("{}_000001.png", base))
                .is_file());
        }
        assert_eq!(
            std::fs::read_dir(split_dir.join(MASK_DIR)).unwrap().count(),
            2 * subset.len()
        );
    }
}

#[test]
fn test_split_dataset_deterministic() {
    let ratios = SplitRatios {
        train: 0.6,
        val: 0.2,
        test: 0.2,
    };
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    write_merged(a.path(), 15);
    write_merged(b.path(), 15);
    split_dataset(a.path(), &ratios, 7, false).unwrap();
    split_dataset(b.path(), &ratios, 7, false).unwrap();
    for s in SPLITS.iter() {
        assert_eq!(
            stems(&a.path().join(s).join(RGB_DIR)),
            stems(&b.path().join(s).join(RGB_DIR))
        );
    }
}

#[test]
fn test_split_dataset_missing_companions() {
    let dir = tempfile::tempdir().unwrap();
    write_merged(dir.path(), 4);
    std::fs::remove_dir_all(dir.path().join(LABELS_DIR)).unwrap();
    std::fs::remove_dir_all(dir.path().join(MASK_DIR)).unwrap();
    let ratios = SplitRatios {
        train: 1.0,
        val: 0.0,
        test: 0.0,
    };
    let summary = split_dataset(dir.path(), &ratios, DEFAULT_SEED, false).unwrap();
    assert_eq!(summary.train, 4);
    for s in SPLITS.iter() {
        for sub in SPLIT_DIRS.iter() {
            assert!(dir.path().join(s).join(sub).is_dir());
        }
    }
    assert_eq!(
        std::fs::read_dir(dir.path().join("train").join(LABELS_DIR))
            .unwrap()
            .count(),
        0
    );
    assert_eq!(
        std::fs::read_dir(dir.path().join("train").join(MASK_VISIB_DIR))
            .unwrap()
            .count(),
        8
    );
}

#[test]
fn test_missing_mask_kind_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_merged(dir.path(), 2);
    std::fs::remove_dir_all(dir.path().join(MASK_VISIB_DIR)).unwrap();
    let out = dir.path().join("train");
    for sub in SPLIT_DIRS.iter() {
        std::fs::create_dir_all(out.join(sub)).unwrap();
    }

    let writer = SplitWriter::new(dir.path()).unwrap();
    let image = dir.path().join(RGB_DIR).join("000001.jpg");
    assert_eq!(writer.copy(&image, &out).unwrap(), vec![MASK_VISIB_DIR]);
    assert!(out.join(MASK_DIR).join("000001_000000.png").is_file());
    assert!(out.join(MASK_DIR).join("000001_000001.png").is_file());

    std::fs::remove_file(dir.path().join(DEPTH_DIR).join("000000.png")).unwrap();
    let image = dir.path().join(RGB_DIR).join("000000.jpg");
    assert_eq!(
        writer.copy(&image, &out).unwrap(),
        vec![DEPTH_DIR, MASK_VISIB_DIR]
    );
}
