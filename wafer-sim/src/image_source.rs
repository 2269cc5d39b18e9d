//! Sample image sources
//!
//! A dataset directory holds one sub-folder per defect class:
//!
//! ```text
//! dataset/
//!   Normal/   *.jpg
//!   Donut/    *.jpg
//!   Scratch/  *.png
//!   ...
//! ```
//!
//! The `Normal` folder (case-insensitive) forms the normal bucket, every
//! other class folder the defect bucket.

use rand::seq::SliceRandom;
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use wafer_common::{Error, Result};

/// Image file extensions accepted from the dataset
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Supplies sample images to machines
pub trait ImageSource: Send + Sync {
    /// Pick an image, drawing from the normal bucket with probability
    /// `bias_towards_normal` and falling back to the other bucket when the
    /// chosen one is empty. `None` only when both buckets are empty.
    fn next_image(&self, bias_towards_normal: f64) -> Option<PathBuf>;

    fn is_empty(&self) -> bool;
}

/// Static pool of labeled sample images
#[derive(Debug, Clone, Default)]
pub struct ImagePool {
    normal: Vec<PathBuf>,
    defect: Vec<PathBuf>,
}

impl ImagePool {
    /// Scan `dataset_dir/<class>/*` for images
    pub fn scan(dataset_dir: &Path) -> Result<Self> {
        if !dataset_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Dataset directory not found: {}",
                dataset_dir.display()
            )));
        }

        let mut pool = Self::default();
        let walker = WalkDir::new(dataset_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable dataset entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }
            match class_folder(entry.path()) {
                Some(class) if class.eq_ignore_ascii_case("normal") => {
                    pool.normal.push(entry.into_path())
                }
                Some(_) => pool.defect.push(entry.into_path()),
                None => debug!(path = %entry.path().display(), "Image outside a class folder"),
            }
        }

        info!(
            dataset = %dataset_dir.display(),
            normal = pool.normal.len(),
            defect = pool.defect.len(),
            "Image pool loaded"
        );
        if pool.is_empty() {
            warn!(dataset = %dataset_dir.display(), "No images available in dataset");
        }
        Ok(pool)
    }

    pub fn from_buckets(normal: Vec<PathBuf>, defect: Vec<PathBuf>) -> Self {
        Self { normal, defect }
    }

    pub fn normal_count(&self) -> usize {
        self.normal.len()
    }

    pub fn defect_count(&self) -> usize {
        self.defect.len()
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.defect.len()
    }

    /// Every image in the pool, normal bucket first
    pub fn images(&self) -> impl Iterator<Item = &Path> {
        self.normal.iter().chain(self.defect.iter()).map(PathBuf::as_path)
    }
}

impl ImageSource for ImagePool {
    fn next_image(&self, bias_towards_normal: f64) -> Option<PathBuf> {
        let mut rng = rand::thread_rng();
        let (preferred, fallback) = if rng.gen::<f64>() < bias_towards_normal {
            (&self.normal, &self.defect)
        } else {
            (&self.defect, &self.normal)
        };

        let bucket = if preferred.is_empty() { fallback } else { preferred };
        bucket.choose(&mut rng).cloned()
    }

    fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.defect.is_empty()
    }
}

/// Name of the folder directly containing `path`
pub fn class_folder(path: &Path) -> Option<&str> {
    path.parent()?.file_name()?.to_str()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, class: &str, name: &str) -> PathBuf {
        let folder = dir.join(class);
        fs::create_dir_all(&folder).unwrap();
        let path = folder.join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_scan_splits_buckets() {
        let temp = tempfile::tempdir().unwrap();
        touch(temp.path(), "normal", "a.jpg");
        touch(temp.path(), "Normal", "b.JPG");
        touch(temp.path(), "Donut", "c.png");
        touch(temp.path(), "Scratch", "d.jpeg");
        touch(temp.path(), "Scratch", "notes.txt");
        fs::write(temp.path().join("top.jpg"), b"x").unwrap();

        let pool = ImagePool::scan(temp.path()).unwrap();
        assert_eq!(pool.normal_count(), 2);
        assert_eq!(pool.defect_count(), 2);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_scan_missing_dir() {
        let temp = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImagePool::scan(&temp.path().join("nope")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_bias_extremes() {
        let pool = ImagePool::from_buckets(
            vec![PathBuf::from("normal.jpg")],
            vec![PathBuf::from("defect.jpg")],
        );
        for _ in 0..20 {
            assert_eq!(pool.next_image(1.0), Some(PathBuf::from("normal.jpg")));
            assert_eq!(pool.next_image(0.0), Some(PathBuf::from("defect.jpg")));
        }
    }

    #[test]
    fn test_empty_bucket_falls_back() {
        let only_defect = ImagePool::from_buckets(Vec::new(), vec![PathBuf::from("d.jpg")]);
        assert_eq!(only_defect.next_image(1.0), Some(PathBuf::from("d.jpg")));

        let empty = ImagePool::default();
        assert!(empty.is_empty());
        assert_eq!(empty.next_image(0.7), None);
    }
}
