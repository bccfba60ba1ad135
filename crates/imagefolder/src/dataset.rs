use std::path::{Path, PathBuf};

use candle_core::Tensor;
use walkdir::WalkDir;

use crate::{
    error::{DataError, Result},
    transforms::EvalTransform,
};

/// File extensions recognised as images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

/// One preprocessed sample.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Tensor,
    pub label: i64,
}

/// Random-access labelled dataset shared across loader workers.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Directory-backed dataset: `root/<class>/**/<image>`.
///
/// Class indices follow the sorted class directory names; samples are sorted
/// by path within each class, so iteration order is fixed across runs.
#[derive(Debug)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<(PathBuf, i64)>,
    transform: EvalTransform,
}

impl ImageFolder {
    pub fn new(root: impl AsRef<Path>, transform: EvalTransform) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut classes = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();
        if classes.is_empty() {
            return Err(DataError::Empty(format!(
                "no class directories under {}",
                root.display()
            )));
        }

        let mut samples = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let mut files = Vec::new();
            for entry in WalkDir::new(root.join(class)).follow_links(true) {
                let entry = entry?;
                if entry.file_type().is_file() && has_image_extension(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            files.sort();
            samples.extend(files.into_iter().map(|path| (path, label as i64)));
        }
        if samples.is_empty() {
            return Err(DataError::Empty(format!(
                "no images with extensions {} under {}",
                IMAGE_EXTENSIONS.join(","),
                root.display()
            )));
        }

        Ok(Self {
            root,
            classes,
            samples,
            transform,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn path(&self, index: usize) -> Option<&Path> {
        self.samples.get(index).map(|(path, _)| path.as_path())
    }
}

impl Dataset for ImageFolder {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let (path, label) = self.samples.get(index).ok_or_else(|| {
            DataError::InvalidConfig(format!(
                "sample index {index} out of range for {} samples",
                self.samples.len()
            ))
        })?;
        let decoded = image::open(path).map_err(|source| DataError::Decode {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Sample {
            image: self.transform.apply(&decoded)?,
            label: *label,
        })
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}
