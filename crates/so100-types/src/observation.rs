//! Sampled robot state and commanded motion.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Joint name → position mapping. Ordered so serialised output is stable.
pub type JointMap = BTreeMap<String, f64>;

/// A row-major 2D pixel grid with a fixed channel depth (RGB8 in practice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<u8>,
}

impl Image {
    /// Wrap raw row-major pixel data.
    ///
    /// Returns `None` when `data.len()` does not equal
    /// `height * width * channels`.
    pub fn from_raw(height: usize, width: usize, channels: usize, data: Vec<u8>) -> Option<Self> {
        if channels == 0 || data.len() != height * width * channels {
            return None;
        }
        Some(Self {
            height,
            width,
            channels,
            data,
        })
    }

    /// An RGB image with every pixel set to `rgb`.
    pub fn filled(height: usize, width: usize, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(height * width * 3)
            .collect();
        Self {
            height,
            width,
            channels: 3,
            data,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// `[height, width, channels]`, the shape reported in `frame` events.
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }

    /// Raw row-major bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Channel values of the pixel at `(y, x)`.
    ///
    /// # Panics
    ///
    /// Panics if `(y, x)` is outside the image.
    pub fn pixel(&self, y: usize, x: usize) -> &[u8] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }

    /// Iterate over every pixel as a channel slice.
    pub fn pixels(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.channels)
    }

    /// Paint an axis-aligned rectangle. Ranges are clamped to the image.
    pub fn fill_rect(&mut self, rows: Range<usize>, cols: Range<usize>, rgb: [u8; 3]) {
        let rows = rows.start.min(self.height)..rows.end.min(self.height);
        let cols = cols.start.min(self.width)..cols.end.min(self.width);
        for y in rows {
            for x in cols.clone() {
                self.put(y, x, rgb);
            }
        }
    }

    /// Paint a filled disc centred on `(cy, cx)`.
    pub fn fill_disc(&mut self, cy: usize, cx: usize, radius: usize, rgb: [u8; 3]) {
        let r2 = (radius * radius) as i64;
        let y0 = cy.saturating_sub(radius);
        let y1 = (cy + radius + 1).min(self.height);
        let x0 = cx.saturating_sub(radius);
        let x1 = (cx + radius + 1).min(self.width);
        for y in y0..y1 {
            for x in x0..x1 {
                let dy = y as i64 - cy as i64;
                let dx = x as i64 - cx as i64;
                if dy * dy + dx * dx <= r2 {
                    self.put(y, x, rgb);
                }
            }
        }
    }

    /// Nearest-neighbour downscale so the result fits inside
    /// `max_width × max_height`, preserving aspect ratio. Never upscales.
    pub fn thumbnail(&self, max_width: usize, max_height: usize) -> Image {
        let scale = f64::min(
            max_width as f64 / self.width.max(1) as f64,
            max_height as f64 / self.height.max(1) as f64,
        );
        if scale >= 1.0 {
            return self.clone();
        }
        let width = ((self.width as f64 * scale).floor() as usize).max(1);
        let height = ((self.height as f64 * scale).floor() as usize).max(1);
        let mut data = Vec::with_capacity(width * height * self.channels);
        for y in 0..height {
            let sy = (y * self.height / height).min(self.height - 1);
            for x in 0..width {
                let sx = (x * self.width / width).min(self.width - 1);
                data.extend_from_slice(self.pixel(sy, sx));
            }
        }
        Image {
            height,
            width,
            channels: self.channels,
            data,
        }
    }

    fn put(&mut self, y: usize, x: usize, rgb: [u8; 3]) {
        let start = (y * self.width + x) * self.channels;
        let n = self.channels.min(3);
        self.data[start..start + n].copy_from_slice(&rgb[..n]);
    }
}

/// One sampled robot state. The image and the joint map come from a single
/// `get_observation` call.
#[derive(Debug, Clone)]
pub struct Observation {
    pub image: Image,
    pub joints: JointMap,
    pub captured_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(image: Image, joints: JointMap) -> Self {
        Self {
            image,
            joints,
            captured_at: Utc::now(),
        }
    }
}

/// Commanded motion: joint name → target position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointTargets(JointMap);

impl JointTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, joint: impl Into<String>, target: f64) -> Self {
        self.0.insert(joint.into(), target);
        self
    }

    pub fn insert(&mut self, joint: impl Into<String>, target: f64) {
        self.0.insert(joint.into(), target);
    }

    pub fn get(&self, joint: &str) -> Option<f64> {
        self.0.get(joint).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split into the targets whose joint is in `known` and the names of
    /// those that are not.
    pub fn partition_known<S: AsRef<str>>(&self, known: &[S]) -> (JointTargets, Vec<String>) {
        let mut accepted = JointTargets::new();
        let mut unknown = Vec::new();
        for (name, target) in &self.0 {
            if known.iter().any(|k| k.as_ref() == name) {
                accepted.0.insert(name.clone(), *target);
            } else {
                unknown.push(name.clone());
            }
        }
        (accepted, unknown)
    }
}

impl From<JointMap> for JointTargets {
    fn from(map: JointMap) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, f64)> for JointTargets {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
