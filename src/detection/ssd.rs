//! Anchor/Prior generation for Single Shot MultiBox Detectors (SSDs).
//!
//! An SSD network predicts a fixed number of boxes per feature map cell on several feature maps
//! of decreasing resolution. Each prediction is an offset relative to a *prior box* (or anchor),
//! and the network output is index-aligned with the table of priors. The table computed here must
//! therefore match the order the network was trained with exactly: levels in order, cells in
//! row-major order, and within a cell the small square, the large square, and then a wide and a
//! tall box for every aspect ratio.
//!
//! All coordinates are relative to the input image size, so a box spanning the whole image has a
//! width and height of 1.0.

use std::{ops::Index, slice};

use itertools::iproduct;
use ndarray::Array2;
use thiserror::Error;

use crate::iter::zip_exact;

/// An anchor of an SSD network, as `(cx, cy, w, h)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    // values range from 0 to 1 if clipping is enabled
    x_center: f32,
    y_center: f32,
    width: f32,
    height: f32,
}

impl Anchor {
    fn new(cx: f64, cy: f64, w: f64, h: f64) -> Self {
        Self {
            x_center: cx as f32,
            y_center: cy as f32,
            width: w as f32,
            height: h as f32,
        }
    }

    pub fn x_center(&self) -> f32 {
        self.x_center
    }

    pub fn y_center(&self) -> f32 {
        self.y_center
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    /// Returns the anchor as `[cx, cy, w, h]`.
    pub fn to_array(&self) -> [f32; 4] {
        [self.x_center, self.y_center, self.width, self.height]
    }

    fn clamp(&mut self) {
        for v in [
            &mut self.x_center,
            &mut self.y_center,
            &mut self.width,
            &mut self.height,
        ] {
            *v = (*v).clamp(0.0, 1.0);
        }
    }
}

/// An invalid [`AnchorParams`] configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("`{field}` has {actual} entries, but there are {expected} feature maps")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("image size must be positive and finite, got {0}")]
    InvalidImageSize(f64),

    #[error("stride of level {level} must be positive and finite, got {stride}")]
    InvalidStride { level: usize, stride: f64 },

    #[error(
        "level {level} needs `0 <= min_size <= max_size`, got min_size={min_size}, \
            max_size={max_size}"
    )]
    InvalidSizes {
        level: usize,
        min_size: f64,
        max_size: f64,
    },

    #[error("aspect ratio of level {level} must be positive and finite, got {ratio}")]
    InvalidAspectRatio { level: usize, ratio: f64 },

    #[error("anchor dimensions of level {level} are not finite")]
    NonFinite { level: usize },

    #[error("the number of anchors does not fit in a `usize`")]
    TooManyAnchors,
}

/// Describes the prior boxes of an SSD network.
///
/// The per-level fields (`feature_maps`, `strides`, `min_sizes`, `max_sizes`, `aspect_ratios`)
/// must all have one entry per feature map.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorParams {
    /// Edge length of the (square) network input, in pixels.
    pub image_size: f64,
    /// Number of cells along each side of every feature map.
    pub feature_maps: Vec<u32>,
    /// Downsampling factor of every feature map relative to `image_size`.
    pub strides: Vec<f64>,
    /// Edge length of the small square box of each level, in pixels.
    pub min_sizes: Vec<f64>,
    /// Together with `min_sizes`, determines the large square box of each level.
    pub max_sizes: Vec<f64>,
    /// Extra width/height distortions of the small box, per level.
    pub aspect_ratios: Vec<Vec<f64>>,
    /// Whether to clamp all coordinates into `[0, 1]`.
    pub clip: bool,
}

impl AnchorParams {
    /// The configuration of the original SSD300 network (8732 anchors).
    pub fn ssd300() -> Self {
        Self {
            image_size: 300.0,
            feature_maps: vec![38, 19, 10, 5, 3, 1],
            strides: vec![8.0, 16.0, 32.0, 64.0, 100.0, 300.0],
            min_sizes: vec![21.0, 45.0, 99.0, 153.0, 207.0, 261.0],
            max_sizes: vec![45.0, 99.0, 153.0, 207.0, 261.0, 315.0],
            aspect_ratios: vec![
                vec![2.0],
                vec![2.0, 3.0],
                vec![2.0, 3.0],
                vec![2.0, 3.0],
                vec![2.0],
                vec![2.0],
            ],
            clip: true,
        }
    }

    pub fn with_clip(mut self, clip: bool) -> Self {
        self.clip = clip;
        self
    }

    /// Returns the number of feature maps (pyramid levels).
    pub fn level_count(&self) -> usize {
        self.feature_maps.len()
    }

    /// Returns the number of boxes every cell of feature map `level` contributes.
    ///
    /// # Panics
    ///
    /// Panics if `level` is out of range.
    pub fn boxes_per_cell(&self, level: usize) -> usize {
        2 + 2 * self.aspect_ratios[level].len()
    }

    /// Returns the number of anchors [`Anchors::calculate`] will produce, without computing them.
    ///
    /// # Panics
    ///
    /// Panics if `feature_maps` and `aspect_ratios` have different lengths, or if the count
    /// overflows a `usize` (which [`AnchorParams::validate`] reports as an error).
    pub fn anchor_count(&self) -> usize {
        self.checked_anchor_count()
            .unwrap_or_else(|| panic!("anchor count of {:?} overflows `usize`", self.feature_maps))
    }

    fn checked_anchor_count(&self) -> Option<usize> {
        zip_exact(&self.feature_maps, &self.aspect_ratios).try_fold(0usize, |total, (&f, r)| {
            let f = usize::try_from(f).ok()?;
            let per_cell = r.len().checked_mul(2)?.checked_add(2)?;
            f.checked_mul(f)?.checked_mul(per_cell)?.checked_add(total)
        })
    }

    /// Checks that the configuration describes a well-formed set of prior boxes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let expected = self.feature_maps.len();
        for (field, actual) in [
            ("strides", self.strides.len()),
            ("min_sizes", self.min_sizes.len()),
            ("max_sizes", self.max_sizes.len()),
            ("aspect_ratios", self.aspect_ratios.len()),
        ] {
            if actual != expected {
                return Err(ConfigError::LengthMismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }

        if self.checked_anchor_count().is_none() {
            return Err(ConfigError::TooManyAnchors);
        }

        if !is_positive(self.image_size) {
            return Err(ConfigError::InvalidImageSize(self.image_size));
        }

        for (level, &stride) in self.strides.iter().enumerate() {
            if !is_positive(stride) {
                return Err(ConfigError::InvalidStride { level, stride });
            }
        }

        let sizes = zip_exact(&self.min_sizes, &self.max_sizes);
        for (level, (&min_size, &max_size)) in sizes.enumerate() {
            // NaN fails both comparisons
            let ordered = 0.0 <= min_size && min_size <= max_size;
            if !ordered || !max_size.is_finite() {
                return Err(ConfigError::InvalidSizes {
                    level,
                    min_size,
                    max_size,
                });
            }
        }

        for (level, ratios) in self.aspect_ratios.iter().enumerate() {
            if let Some(&ratio) = ratios.iter().find(|&&r| !is_positive(r)) {
                return Err(ConfigError::InvalidAspectRatio { level, ratio });
            }
        }

        Ok(())
    }
}

impl Default for AnchorParams {
    fn default() -> Self {
        Self::ssd300()
    }
}

fn is_positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

/// Box dimensions shared by every cell of one feature map.
struct LevelShapes {
    scale: f64,
    small: f64,
    large: f64,
    /// `(w, h)` of the wide and tall variant for every aspect ratio, in order.
    distorted: Vec<[(f64, f64); 2]>,
}

impl LevelShapes {
    fn new(
        level: usize,
        fmap: u32,
        image_size: f64,
        stride: f64,
        min_size: f64,
        max_size: f64,
        ratios: &[f64],
    ) -> Result<Self, ConfigError> {
        let scale = image_size / stride;
        let small = min_size / image_size;
        let large = (min_size * max_size).sqrt() / image_size;
        let distorted = ratios
            .iter()
            .map(|&r| {
                let s = r.sqrt();
                [(small * s, small / s), (small / s, small * s)]
            })
            .collect::<Vec<_>>();

        // Centers grow with the column/row index, so the last cell has the largest one.
        let max_center = (f64::from(fmap.max(1)) - 0.5) / scale;

        // Anchors are stored as `f32`, which overflows long before `f64` does.
        let finite = [small, large, max_center]
            .into_iter()
            .chain(distorted.iter().flatten().flat_map(|&(w, h)| [w, h]))
            .all(|v| (v as f32).is_finite());
        if !scale.is_finite() || !finite {
            return Err(ConfigError::NonFinite { level });
        }

        Ok(Self {
            scale,
            small,
            large,
            distorted,
        })
    }
}

/// The ordered table of prior boxes of an SSD network.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchors {
    anchors: Vec<Anchor>,
}

impl Anchors {
    /// Computes all prior boxes described by `params`.
    ///
    /// The configuration is validated first; no anchors are returned for an invalid one.
    pub fn calculate(params: &AnchorParams) -> Result<Self, ConfigError> {
        params.validate()?;

        let mut anchors = Vec::with_capacity(params.anchor_count());

        let levels = zip_exact(
            zip_exact(&params.feature_maps, &params.strides),
            zip_exact(
                zip_exact(&params.min_sizes, &params.max_sizes),
                &params.aspect_ratios,
            ),
        );
        for (level, ((&fmap, &stride), ((&min_size, &max_size), ratios))) in levels.enumerate() {
            let shapes = LevelShapes::new(
                level,
                fmap,
                params.image_size,
                stride,
                min_size,
                max_size,
                ratios,
            )?;

            let start = anchors.len();
            // `i` is the row and varies slowest.
            for (i, j) in iproduct!(0..fmap, 0..fmap) {
                let cx = (f64::from(j) + 0.5) / shapes.scale;
                let cy = (f64::from(i) + 0.5) / shapes.scale;

                anchors.push(Anchor::new(cx, cy, shapes.small, shapes.small));
                anchors.push(Anchor::new(cx, cy, shapes.large, shapes.large));
                for &[(ww, wh), (tw, th)] in &shapes.distorted {
                    anchors.push(Anchor::new(cx, cy, ww, wh));
                    anchors.push(Anchor::new(cx, cy, tw, th));
                }
            }

            log::debug!(
                "level {}: {}x{} feature map, {} boxes per cell, {} anchors",
                level,
                fmap,
                fmap,
                params.boxes_per_cell(level),
                anchors.len() - start,
            );
        }

        if params.clip {
            anchors.iter_mut().for_each(Anchor::clamp);
        }

        log::trace!(
            "computed {} anchors for {} levels",
            anchors.len(),
            params.level_count()
        );

        Ok(Self { anchors })
    }

    /// Returns the total number of SSD anchors/priors.
    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Anchor> {
        self.anchors.iter()
    }

    pub fn as_slice(&self) -> &[Anchor] {
        &self.anchors
    }

    /// Converts the anchors to an `N x 4` array with rows `[cx, cy, w, h]`.
    pub fn to_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.anchors.len(), 4), |(row, col)| {
            self.anchors[row].to_array()[col]
        })
    }
}

impl Index<usize> for Anchors {
    type Output = Anchor;

    fn index(&self, index: usize) -> &Anchor {
        &self.anchors[index]
    }
}

impl<'a> IntoIterator for &'a Anchors {
    type Item = &'a Anchor;
    type IntoIter = slice::Iter<'a, Anchor>;

    fn into_iter(self) -> Self::IntoIter {
        self.anchors.iter()
    }
}

/// Computes all prior boxes described by `params`.
///
/// Shorthand for [`Anchors::calculate`].
pub fn generate(params: &AnchorParams) -> Result<Anchors, ConfigError> {
    Anchors::calculate(params)
}
