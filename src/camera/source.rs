use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{
    backend::{candidates, Backend, BackendId, BackendOpener, CaptureSettings},
    frame::{normalize, Frame},
    process::SystemOpener,
};
use crate::config::ConfigCamera;

#[derive(Debug, PartialEq, Eq, Serialize, Clone, Copy)]
pub enum BackendState {
    Uninitialized,
    Active(BackendId),
    Failed,
    Released,
}

/// One backend candidate that could not be brought up, and why.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CandidateFailure {
    pub backend: BackendId,
    /// Either [`CameraError::OpenFailed`] or, when it opened but produced no frame, [`CameraError::ReadFailed`]
    pub error: CameraError,
}

/// Result of probing a single candidate.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProbeOutcome {
    pub backend: BackendId,
    pub result: Result<(u32, u32), CameraError>,
}

/// A camera that hides which backend is delivering frames.
///
/// Frames always come out in the canonical layout. Recovery from read failures is left to the
/// caller, the source never reconnects on its own.
pub struct CameraSource {
    state: BackendState,
    backend: Option<Box<dyn Backend>>,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
}

impl CameraSource {
    pub fn open(cfg: &ConfigCamera) -> Result<CameraSource, CameraError> {
        let mut opener = SystemOpener::from_config(cfg);
        Self::open_with(
            CaptureSettings::from(cfg),
            &candidates(cfg.prefer_camera_stack, &cfg.device_indices),
            cfg.max_consecutive_failures,
            &mut opener,
        )
    }

    pub fn open_with(
        settings: CaptureSettings,
        candidates: &[BackendId],
        max_consecutive_failures: u32,
        opener: &mut dyn BackendOpener,
    ) -> Result<CameraSource, CameraError> {
        let mut source = CameraSource {
            state: BackendState::Uninitialized,
            backend: None,
            max_consecutive_failures,
            consecutive_failures: 0,
        };
        let (id, backend) = select_backend(candidates, &settings, opener)?;
        source.backend = Some(backend);
        source.state = BackendState::Active(id);
        Ok(source)
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        match self.state {
            BackendState::Active(_) => {}
            BackendState::Failed => return Err(CameraError::Failed),
            BackendState::Uninitialized | BackendState::Released => {
                return Err(CameraError::Closed)
            }
        }
        let backend = self.backend.as_mut().ok_or(CameraError::Closed)?;

        let raw = match backend.read() {
            Ok(raw) => raw,
            Err(e) => {
                self.consecutive_failures += 1;
                if self.max_consecutive_failures > 0
                    && self.consecutive_failures >= self.max_consecutive_failures
                {
                    error!(
                        failures = self.consecutive_failures,
                        "Camera stalled, giving up on backend: {}", e
                    );
                    self.fail();
                    return Err(CameraError::Stalled(self.consecutive_failures));
                }
                return Err(CameraError::ReadFailed(e.to_string()));
            }
        };

        match normalize(raw, Utc::now()) {
            Ok(frame) => {
                self.consecutive_failures = 0;
                Ok(frame)
            }
            Err(e) => {
                error!("Backend delivered a malformed frame: {}", e);
                self.fail();
                Err(CameraError::LayoutViolation(e.to_string()))
            }
        }
    }

    /// Release the active backend. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.release();
            info!("Camera released");
        }
        if self.state != BackendState::Failed {
            self.state = BackendState::Released;
        }
    }

    fn fail(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.release();
        }
        self.state = BackendState::Failed;
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Try each candidate in order. The first that opens and delivers a well formed frame wins; every
/// other opened backend is released before moving on.
pub fn select_backend(
    candidates: &[BackendId],
    settings: &CaptureSettings,
    opener: &mut dyn BackendOpener,
) -> Result<(BackendId, Box<dyn Backend>), CameraError> {
    let mut failures = Vec::with_capacity(candidates.len());
    for &id in candidates {
        info!(backend=%id, "Trying camera backend...");
        match bring_up(id, settings, opener) {
            Ok((backend, _)) => {
                info!(backend=%id, "Camera backend active");
                return Ok((id, backend));
            }
            Err(error) => {
                warn!(backend=%id, "Camera backend unavailable: {}", error);
                failures.push(CandidateFailure { backend: id, error });
            }
        }
    }
    Err(CameraError::NoDeviceAvailable(failures))
}

/// Try every candidate and report each result, releasing whatever opened.
pub fn probe_candidates(
    candidates: &[BackendId],
    settings: &CaptureSettings,
    opener: &mut dyn BackendOpener,
) -> Vec<ProbeOutcome> {
    candidates
        .iter()
        .map(|&id| {
            let result = bring_up(id, settings, opener).map(|(mut backend, frame)| {
                backend.release();
                (frame.width, frame.height)
            });
            ProbeOutcome {
                backend: id,
                result,
            }
        })
        .collect()
}

/// Open a candidate and read one frame as a liveness probe.
fn bring_up(
    id: BackendId,
    settings: &CaptureSettings,
    opener: &mut dyn BackendOpener,
) -> Result<(Box<dyn Backend>, Frame), CameraError> {
    let mut backend = opener
        .open(id, settings)
        .map_err(|e| CameraError::OpenFailed(e.to_string()))?;
    let probe = backend
        .read()
        .map_err(|e| e.to_string())
        .and_then(|raw| normalize(raw, Utc::now()).map_err(|e| e.to_string()));
    match probe {
        Ok(frame) => Ok((backend, frame)),
        Err(reason) => {
            backend.release();
            Err(CameraError::ReadFailed(reason))
        }
    }
}

fn describe_failures(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("\n  - {}: {}", f.backend, f.error))
        .collect()
}

quick_error! {
    #[derive(Debug, PartialEq, Eq, Clone)]
    pub enum CameraError {
        OpenFailed(reason: String) {
            display("Could not open camera: {}", reason)
        }
        NoDeviceAvailable(attempts: Vec<CandidateFailure>) {
            display("No camera available after trying {} backend(s):{}", attempts.len(), describe_failures(attempts))
        }
        ReadFailed(reason: String) {
            display("Opened but could not read a frame: {}", reason)
        }
        Stalled(failures: u32) {
            display("Camera stalled after {} consecutive failed reads", failures)
        }
        LayoutViolation(reason: String) {
            display("Camera delivered a frame in the wrong layout: {}", reason)
        }
        Failed {
            display("Camera has failed and must be reopened")
        }
        Closed {
            display("Camera is closed")
        }
    }
}
