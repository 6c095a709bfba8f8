//! Object-presence detectors used as the search skill's stop condition.
//!
//! | Detector | Behaviour |
//! |---|---|
//! | [`ColorDetector`] | Maps the object name to a colour (`cup`→red, `block`→blue, `ball`→green, or an explicit colour word) and reports it visible when enough pixels are dominated by that colour. |
//! | [`NeverDetector`] | Never sees anything; search always exhausts its budget. |

use std::sync::Arc;

use so100_types::{Image, Observation};

use crate::skill_runner::StopCondition;

/// `is_visible(frame, object_name) -> bool`.
pub trait ObjectDetector: Send + Sync {
    fn name(&self) -> &str;

    fn is_visible(&self, image: &Image, object: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hue {
    Red,
    Green,
    Blue,
}

impl Hue {
    fn channel(self) -> usize {
        match self {
            Hue::Red => 0,
            Hue::Green => 1,
            Hue::Blue => 2,
        }
    }

    /// Colour associated with an object name, if any.
    pub fn for_object(object: &str) -> Option<Hue> {
        let object = object.to_lowercase();
        const TABLE: [(&str, Hue); 6] = [
            ("red", Hue::Red),
            ("green", Hue::Green),
            ("blue", Hue::Blue),
            ("cup", Hue::Red),
            ("ball", Hue::Green),
            ("block", Hue::Blue),
        ];
        TABLE
            .iter()
            .find(|(word, _)| object.contains(word))
            .map(|(_, hue)| *hue)
    }
}

/// Dominant-channel colour detector.
///
/// A pixel counts as `hue` when that channel is at least `min_level` and both
/// other channels are at most `max_other`.
#[derive(Debug, Clone)]
pub struct ColorDetector {
    pub min_level: u8,
    pub max_other: u8,
    /// Fraction of the frame that must match, `0.0..=1.0`.
    pub min_fraction: f64,
}

impl Default for ColorDetector {
    fn default() -> Self {
        Self {
            min_level: 150,
            max_other: 90,
            min_fraction: 0.002,
        }
    }
}

impl ColorDetector {
    /// Fraction of pixels in `image` dominated by `hue`.
    pub fn coverage(&self, image: &Image, hue: Hue) -> f64 {
        if image.channels() < 3 {
            return 0.0;
        }
        let c = hue.channel();
        let total = image.height() * image.width();
        if total == 0 {
            return 0.0;
        }
        let hits = image
            .pixels()
            .filter(|p| {
                p[c] >= self.min_level
                    && (0..3).filter(|&i| i != c).all(|i| p[i] <= self.max_other)
            })
            .count();
        hits as f64 / total as f64
    }
}

impl ObjectDetector for ColorDetector {
    fn name(&self) -> &str {
        "color"
    }

    fn is_visible(&self, image: &Image, object: &str) -> bool {
        match Hue::for_object(object) {
            Some(hue) => self.coverage(image, hue) >= self.min_fraction,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverDetector;

impl ObjectDetector for NeverDetector {
    fn name(&self) -> &str {
        "never"
    }

    fn is_visible(&self, _: &Image, _: &str) -> bool {
        false
    }
}

/// Binds a detector to one object name so it can stop a search.
pub struct DetectObject {
    detector: Arc<dyn ObjectDetector>,
    object: String,
}

impl DetectObject {
    pub fn new(detector: Arc<dyn ObjectDetector>, object: impl Into<String>) -> Self {
        Self {
            detector,
            object: object.into(),
        }
    }
}

impl StopCondition for DetectObject {
    fn should_stop(&self, observation: &Observation) -> bool {
        self.detector.is_visible(&observation.image, &self.object)
    }
}
