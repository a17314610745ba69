//! Slide deck loading.
//!
//! Rasterized slides live in a directory of uniformly sized grayscale
//! images (`slide-1.png`, `slide-2.png`, ...). Files are ordered
//! lexiconumerically so `slide-10` sorts after `slide-2`, then resized to
//! fit the footage frame while preserving the deck's aspect ratio.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use image::ImageReader;
use log::warn;
use thiserror::Error;

use crate::io::image::GrayImage;

#[derive(Debug, Error)]
pub enum SlideError {
    #[error("slide directory not found: {0}")]
    MissingDir(PathBuf),
    #[error("slide path is not a directory: {0}")]
    NotADir(PathBuf),
    #[error("failed to list slide directory {path}: {reason}")]
    Unlistable { path: PathBuf, reason: String },
    #[error("no slide images found in {0}")]
    EmptyDeck(PathBuf),
    #[error("failed to read slide {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

const SLIDE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Load the slide deck from `dir`, scaled to fit a
/// `frame_width x frame_height` footage frame.
pub fn load_deck(dir: &Path, frame_width: u32, frame_height: u32) -> Result<Vec<GrayImage>, SlideError> {
    if !dir.exists() {
        return Err(SlideError::MissingDir(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(SlideError::NotADir(dir.to_path_buf()));
    }

    let entries = std::fs::read_dir(dir).map_err(|err| SlideError::Unlistable {
        path: dir.to_path_buf(),
        reason: err.to_string(),
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SLIDE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();

    paths.sort_by(|a, b| {
        lexiconumeric_cmp(
            &a.file_name().unwrap_or_default().to_string_lossy(),
            &b.file_name().unwrap_or_default().to_string_lossy(),
        )
    });

    if paths.is_empty() {
        return Err(SlideError::EmptyDeck(dir.to_path_buf()));
    }

    let mut slides = Vec::with_capacity(paths.len());
    let mut deck_size: Option<(u32, u32)> = None;

    for path in paths {
        let luma = ImageReader::open(&path)
            .map_err(|err| SlideError::Unreadable {
                path: path.clone(),
                reason: err.to_string(),
            })?
            .decode()
            .map_err(|err| SlideError::Unreadable {
                path: path.clone(),
                reason: err.to_string(),
            })?
            .to_luma8();

        let (width, height) = luma.dimensions();
        match deck_size {
            None => deck_size = Some((width, height)),
            Some(expected) if expected != (width, height) => {
                // Inconsistent page size, not supported.
                warn!(
                    "skipping slide {} ({}x{}, deck is {}x{})",
                    path.display(),
                    width,
                    height,
                    expected.0,
                    expected.1
                );
                continue;
            }
            Some(_) => {}
        }

        slides.push(GrayImage::new(width, height, luma.into_raw()));
    }

    if slides.is_empty() {
        return Err(SlideError::EmptyDeck(dir.to_path_buf()));
    }

    Ok(fit_to_frame(slides, frame_width, frame_height))
}

/// Uniformly rescale the deck so it fits inside the footage frame.
fn fit_to_frame(slides: Vec<GrayImage>, frame_width: u32, frame_height: u32) -> Vec<GrayImage> {
    let (width, height) = (slides[0].width, slides[0].height);
    if width == 0 || height == 0 || frame_width == 0 || frame_height == 0 {
        return slides;
    }

    let scale = (frame_width as f64 / width as f64).min(frame_height as f64 / height as f64);
    let target_w = ((width as f64 * scale).round() as u32).max(1);
    let target_h = ((height as f64 * scale).round() as u32).max(1);

    if (target_w, target_h) == (width, height) {
        return slides;
    }

    slides
        .into_iter()
        .map(|slide| slide.resize_bilinear(target_w, target_h))
        .collect()
}

/// Compare strings lexicographically, treating digit runs as indivisible
/// numbers: `"a" < "b"`, `"1" < "2"`, and `"frame-5" < "frame-23"`.
pub fn lexiconumeric_cmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut i = 0;
    let mut k = 0;

    while i < a.len() && k < b.len() {
        if a[i].is_ascii_digit() && b[k].is_ascii_digit() {
            let mut p = i + 1;
            while p < a.len() && a[p].is_ascii_digit() {
                p += 1;
            }
            let mut q = k + 1;
            while q < b.len() && b[q].is_ascii_digit() {
                q += 1;
            }

            // A longer digit run is a bigger number; equal-length runs
            // compare digit by digit.
            let ordering = (p - i).cmp(&(q - k)).then_with(|| a[i..p].cmp(&b[k..q]));
            if ordering != Ordering::Equal {
                return ordering;
            }

            i = p;
            k = q;
        } else {
            let ordering = a[i].cmp(&b[k]);
            if ordering != Ordering::Equal {
                return ordering;
            }
            i += 1;
            k += 1;
        }
    }

    (a.len() - i).cmp(&(b.len() - k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_as_units() {
        assert_eq!(lexiconumeric_cmp("slide-2", "slide-10"), Ordering::Less);
        assert_eq!(lexiconumeric_cmp("frame-5", "frame-23"), Ordering::Less);
        assert_eq!(lexiconumeric_cmp("slide-10", "slide-2"), Ordering::Greater);
    }

    #[test]
    fn plain_strings_compare_lexicographically() {
        assert_eq!(lexiconumeric_cmp("a", "b"), Ordering::Less);
        assert_eq!(lexiconumeric_cmp("slide", "slide"), Ordering::Equal);
        assert_eq!(lexiconumeric_cmp("slide", "slides"), Ordering::Less);
    }

    #[test]
    fn equal_numbers_fall_through_to_suffix() {
        assert_eq!(lexiconumeric_cmp("s-2a", "s-2b"), Ordering::Less);
        assert_eq!(lexiconumeric_cmp("s-02", "s-2"), Ordering::Greater);
    }

    #[test]
    fn deck_is_rescaled_to_fit_the_frame() {
        let slides = vec![GrayImage::new(200, 100, vec![50; 200 * 100])];
        let fitted = fit_to_frame(slides, 100, 100);
        assert_eq!((fitted[0].width, fitted[0].height), (100, 50));
    }

    #[test]
    fn matching_deck_is_left_untouched() {
        let slides = vec![GrayImage::new(100, 50, vec![50; 100 * 50])];
        let fitted = fit_to_frame(slides, 100, 50);
        assert_eq!((fitted[0].width, fitted[0].height), (100, 50));
    }
}
