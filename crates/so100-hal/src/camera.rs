//! Generic `Camera` trait and the raw V4L frame reader.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use so100_types::{Image, SessionError};
use tracing::{info, warn};

/// Operator hint attached to camera failures: the device must already
/// deliver raw RGB24 at the configured size, which most UVC cameras do not
/// do by default (they start in YUYV or MJPEG).
pub const RGB24_FORMAT_HINT: &str =
    "expects raw RGB24 via read(); set it with `v4l2-ctl -d <dev> --set-fmt-video=width=<w>,height=<h>,pixelformat=RGB3`";

/// A raw RGB24 frame returned by a camera driver.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row-major RGB24 pixel data.
    pub data: Vec<u8>,
}

impl CameraFrame {
    /// Convert into an [`Image`].
    ///
    /// # Errors
    ///
    /// [`SessionError::ResourceUnavailable`] if the buffer size does not
    /// match the advertised dimensions.
    pub fn into_image(self) -> Result<Image, SessionError> {
        let (w, h, len) = (self.width, self.height, self.data.len());
        Image::from_raw(h as usize, w as usize, 3, self.data).ok_or_else(|| {
            SessionError::ResourceUnavailable(format!(
                "camera returned {len} bytes for a {w}x{h} RGB frame"
            ))
        })
    }
}

/// A camera or image-capture device.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"wrist"`.
    fn id(&self) -> &str;

    /// Acquire the device. Called from `RobotSession::connect`.
    ///
    /// # Errors
    ///
    /// [`SessionError::ResourceUnavailable`] if the device cannot be opened.
    fn open(&mut self) -> Result<(), SessionError>;

    /// Release the device.
    fn close(&mut self);

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] if the device was never opened, or
    /// [`SessionError::ResourceUnavailable`] if capture fails.
    fn capture(&mut self) -> Result<CameraFrame, SessionError>;
}

/// Reads fixed-size RGB24 frames from `/dev/video{index}` with the V4L2
/// `read()` I/O method. The capture format must already be negotiated
/// (e.g. with `v4l2-ctl --set-fmt-video=…,pixelformat=RGB3`).
pub struct V4lCamera {
    id: String,
    path: PathBuf,
    width: u32,
    height: u32,
    file: Option<File>,
}

impl V4lCamera {
    pub fn new(id: impl Into<String>, index: u32, width: u32, height: u32) -> Self {
        Self::with_path(id, format!("/dev/video{index}"), width, height)
    }

    /// Read from an arbitrary device node or capture file.
    pub fn with_path(id: impl Into<String>, path: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            width,
            height,
            file: None,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Camera for V4lCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&mut self) -> Result<(), SessionError> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = File::open(&self.path).map_err(|e| {
            SessionError::ResourceUnavailable(format!(
                "cannot open camera {}: {e} ({RGB24_FORMAT_HINT})",
                self.path.display()
            ))
        })?;
        info!(
            camera = %self.id,
            path = %self.path.display(),
            width = self.width,
            height = self.height,
            "camera opened; frames are read as raw RGB24"
        );
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn capture(&mut self) -> Result<CameraFrame, SessionError> {
        let file = self.file.as_mut().ok_or(SessionError::NotConnected)?;
        let mut data = vec![0u8; self.width as usize * self.height as usize * 3];
        file.read_exact(&mut data).map_err(|e| {
            warn!(camera = %self.id, error = %e, "short or failed frame read; check the capture format");
            SessionError::ResourceUnavailable(format!(
                "camera {} read of a {}x{} RGB24 frame failed: {e} ({RGB24_FORMAT_HINT})",
                self.id, self.width, self.height
            ))
        })?;
        Ok(CameraFrame {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn frame_converts_to_image() {
        let frame = CameraFrame {
            width: 2,
            height: 2,
            data: vec![7u8; 2 * 2 * 3],
        };
        let img = frame.into_image().unwrap();
        assert_eq!(img.shape(), [2, 2, 3]);
        assert_eq!(img.pixel(1, 1), &[7, 7, 7]);
    }

    #[test]
    fn truncated_frame_is_resource_unavailable() {
        let frame = CameraFrame {
            width: 2,
            height: 2,
            data: vec![0u8; 5],
        };
        assert!(matches!(
            frame.into_image(),
            Err(SessionError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn capture_before_open_is_not_connected() {
        let mut cam = V4lCamera::new("wrist", 0, 640, 480);
        assert_eq!(cam.path(), &PathBuf::from("/dev/video0"));
        assert_eq!(cam.capture().unwrap_err(), SessionError::NotConnected);
    }

    #[test]
    fn missing_device_error_names_the_expected_format() {
        let mut cam = V4lCamera::new("wrist", 250, 640, 480);
        match cam.open() {
            Err(SessionError::ResourceUnavailable(text)) => {
                assert!(text.contains("/dev/video250"));
                assert!(text.contains("pixelformat=RGB3"));
            }
            other => panic!("expected ResourceUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn short_read_explains_the_format_requirement() {
        let mut capture = tempfile::NamedTempFile::new().unwrap();
        // Half a 2x2 RGB24 frame, as a YUYV device would deliver.
        capture.write_all(&[0u8; 8]).unwrap();

        let mut cam = V4lCamera::with_path("wrist", capture.path(), 2, 2);
        cam.open().unwrap();
        match cam.capture() {
            Err(SessionError::ResourceUnavailable(text)) => {
                assert!(text.contains("2x2 RGB24"));
                assert!(text.contains("v4l2-ctl"));
            }
            other => panic!("expected ResourceUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn full_frame_is_captured_from_the_node() {
        let mut capture = tempfile::NamedTempFile::new().unwrap();
        capture.write_all(&[9u8; 12]).unwrap();

        let mut cam = V4lCamera::with_path("wrist", capture.path(), 2, 2);
        cam.open().unwrap();
        let img = cam.capture().unwrap().into_image().unwrap();
        assert_eq!(img.shape(), [2, 2, 3]);
        assert_eq!(img.pixel(0, 1), &[9, 9, 9]);
    }
}
