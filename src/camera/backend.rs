use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use super::frame::RawFrame;
use crate::config::ConfigCamera;

/// The camera integrations available on the rig.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize, Hash, Clone, Copy)]
pub enum BackendId {
    /// High level camera stack (libcamera based), for recent board revisions
    CameraStack,
    /// Generic video capture layer on a numbered device node
    VideoCapture { index: u32 },
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendId::CameraStack => write!(f, "camera stack"),
            BackendId::VideoCapture { index } => write!(f, "video capture #{}", index),
        }
    }
}

/// Candidates in the order they should be attempted.
pub fn candidates(prefer_camera_stack: bool, device_indices: &[u32]) -> Vec<BackendId> {
    let mut list = Vec::with_capacity(device_indices.len() + 1);
    if prefer_camera_stack {
        list.push(BackendId::CameraStack);
    }
    list.extend(
        device_indices
            .iter()
            .map(|&index| BackendId::VideoCapture { index }),
    );
    list
}

/// Requested capture parameters. Backends treat these as advice.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub read_timeout: Duration,
}

impl From<&ConfigCamera> for CaptureSettings {
    fn from(cfg: &ConfigCamera) -> Self {
        Self {
            width: cfg.width,
            height: cfg.height,
            frame_rate: cfg.frame_rate,
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
        }
    }
}

/// An opened backend handle.
pub trait Backend: Send {
    fn read(&mut self) -> Result<RawFrame, BackendError>;
    /// Release the underlying device. Called at most once by the camera source.
    fn release(&mut self);
}

/// Turns a candidate into an opened backend.
pub trait BackendOpener {
    fn open(
        &mut self,
        id: BackendId,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn Backend>, BackendError>;
}

quick_error! {
    #[derive(Debug)]
    pub enum BackendError {
        Spawn(program: String, error: std::io::Error) {
            display("Unable to start {}: {}", program, error)
            source(error)
        }
        DeviceMissing(path: String) {
            display("Device node {} does not exist", path)
        }
        Timeout(waited: Duration) {
            display("No frame within {}ms", waited.as_millis())
        }
        StreamEnded {
            display("Backend stopped producing frames")
        }
        Io(error: std::io::Error) {
            from()
            display("Frame read failed: {}", error)
            source(error)
        }
    }
}
