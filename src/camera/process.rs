use std::{
    io::{self, Read},
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
    thread,
    time::Duration,
};

use tracing::{debug, trace};

use super::{
    backend::{Backend, BackendError, BackendId, BackendOpener, CaptureSettings},
    frame::{PixelLayout, RawFrame},
};
use crate::config::ConfigCamera;

/// A backend fed by a child process writing fixed size raw frames to stdout.
///
/// Frames are pulled off the pipe by a reader thread so reads can be bounded by a timeout.
pub struct ProcessBackend {
    program: String,
    child: Option<Child>,
    frames: Receiver<io::Result<Vec<u8>>>,
    width: u32,
    height: u32,
    layout: PixelLayout,
    timeout: Duration,
}

impl ProcessBackend {
    pub fn spawn(
        mut command: Command,
        width: u32,
        height: u32,
        layout: PixelLayout,
        timeout: Duration,
    ) -> Result<ProcessBackend, BackendError> {
        let program = command.get_program().to_string_lossy().into_owned();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        debug!(?command, "Spawning capture process");
        let mut child = command
            .spawn()
            .map_err(|e| BackendError::Spawn(program.clone(), e))?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BackendError::StreamEnded);
            }
        };

        let frame_len = layout.frame_len(width, height);
        let (tx, rx) = mpsc::sync_channel(2);
        // The reader exits once the pipe closes or the receiving side is dropped
        let reader = thread::Builder::new()
            .name(format!("{}-reader", program))
            .spawn(move || read_frames(stdout, frame_len, tx));
        if let Err(e) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::Spawn(program, e));
        }

        Ok(ProcessBackend {
            program,
            child: Some(child),
            frames: rx,
            width,
            height,
            layout,
            timeout,
        })
    }
}

fn read_frames(mut source: impl Read, frame_len: usize, tx: SyncSender<io::Result<Vec<u8>>>) {
    loop {
        let mut buf = vec![0u8; frame_len];
        let next = source.read_exact(&mut buf).map(|_| buf);
        let done = next.is_err();
        if tx.send(next).is_err() || done {
            return;
        }
    }
}

impl Backend for ProcessBackend {
    fn read(&mut self) -> Result<RawFrame, BackendError> {
        match self.frames.recv_timeout(self.timeout) {
            Ok(Ok(data)) => {
                trace!(program=%self.program, bytes = data.len(), "Frame read");
                Ok(RawFrame {
                    data,
                    width: self.width,
                    height: self.height,
                    layout: self.layout,
                })
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(BackendError::StreamEnded)
            }
            Ok(Err(e)) => Err(BackendError::Io(e)),
            Err(RecvTimeoutError::Timeout) => Err(BackendError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BackendError::StreamEnded),
        }
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            debug!(program=%self.program, "Capture process stopped");
        }
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens the real backends by launching their capture programs.
#[derive(Debug, Clone)]
pub struct SystemOpener {
    pub camera_stack_command: String,
    pub video_capture_command: String,
    pub device_root: PathBuf,
}

impl SystemOpener {
    pub fn from_config(cfg: &ConfigCamera) -> Self {
        Self {
            camera_stack_command: cfg.camera_stack_command.clone(),
            video_capture_command: cfg.video_capture_command.clone(),
            device_root: PathBuf::from("/dev"),
        }
    }

    /// Raw I420 straight from the camera stack; it has no packed RGB output.
    fn camera_stack_command(&self, settings: &CaptureSettings) -> Command {
        let mut cmd = Command::new(&self.camera_stack_command);
        cmd.args(["-t", "0", "-n", "--codec", "yuv420", "-o", "-"])
            .arg("--width")
            .arg(settings.width.to_string())
            .arg("--height")
            .arg(settings.height.to_string())
            .arg("--framerate")
            .arg(settings.frame_rate.to_string());
        cmd
    }

    /// The capture layer hands out BGR, as it does everywhere else.
    ///
    /// `-video_size` is only a request to the driver, which may clamp it. The output is scaled
    /// back to the requested size so every chunk read off the pipe is exactly one capture.
    fn video_capture_command(&self, device: &str, settings: &CaptureSettings) -> Command {
        let mut cmd = Command::new(&self.video_capture_command);
        cmd.args(["-hide_banner", "-loglevel", "error", "-f", "v4l2"])
            .arg("-framerate")
            .arg(settings.frame_rate.to_string())
            .arg("-video_size")
            .arg(format!("{}x{}", settings.width, settings.height))
            .arg("-i")
            .arg(device)
            .arg("-vf")
            .arg(format!("scale={}:{}", settings.width, settings.height))
            .args(["-f", "rawvideo", "-pix_fmt", "bgr24", "-"]);
        cmd
    }
}

impl BackendOpener for SystemOpener {
    fn open(
        &mut self,
        id: BackendId,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn Backend>, BackendError> {
        let backend = match id {
            BackendId::CameraStack => ProcessBackend::spawn(
                self.camera_stack_command(settings),
                settings.width,
                settings.height,
                PixelLayout::I420,
                settings.read_timeout,
            )?,
            BackendId::VideoCapture { index } => {
                let device = self.device_root.join(format!("video{}", index));
                if !device.exists() {
                    return Err(BackendError::DeviceMissing(device.display().to_string()));
                }
                let device = device.to_string_lossy().into_owned();
                ProcessBackend::spawn(
                    self.video_capture_command(&device, settings),
                    settings.width,
                    settings.height,
                    PixelLayout::Bgr8,
                    settings.read_timeout,
                )?
            }
        };
        Ok(Box::new(backend))
    }
}
