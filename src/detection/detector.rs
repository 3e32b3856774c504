use std::{
    io::{self, BufRead, BufReader, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::BoundingBox;
use crate::camera::{Frame, PixelLayout, CANONICAL_LAYOUT};

/// A raw detector output: one box and a score for every class in the vocabulary.
#[derive(Debug, PartialEq, Deserialize, Serialize, Clone)]
pub struct RawCandidate {
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,
    pub scores: Vec<f32>,
}

/// The model behind the pipeline. Any implementation producing this shape can be swapped in.
pub trait Detector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawCandidate>, DetectorError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawCandidate>, DetectorError> {
        (**self).infer(frame)
    }
}

#[derive(Debug, Serialize)]
struct FrameHeader {
    width: u32,
    height: u32,
    layout: PixelLayout,
    len: usize,
}

/// Runs inference in a child process.
///
/// For every frame a JSON header line is written to the child's stdin followed by the raw pixel
/// bytes. The child answers with a single JSON line holding a list of `{"box": [x, y, w, h],
/// "scores": [...]}` objects.
///
/// A child that does not answer within the reply timeout is killed and a fresh one is started
/// for the next frame, so a late reply can never be paired with the wrong frame.
pub struct ProcessDetector {
    argv: Vec<String>,
    reply_timeout: Duration,
    running: Option<DetectorProcess>,
}

struct DetectorProcess {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<io::Result<Option<String>>>,
}

impl DetectorProcess {
    /// Send one frame and wait for the matching reply line.
    fn exchange(&mut self, frame: &Frame, timeout: Duration) -> Result<String, DetectorError> {
        let header = serde_json::to_string(&FrameHeader {
            width: frame.width,
            height: frame.height,
            layout: CANONICAL_LAYOUT,
            len: frame.data.len(),
        })
        .map_err(|e| DetectorError::InferenceFailed(e.to_string()))?;
        writeln!(self.stdin, "{}", header)?;
        self.stdin.write_all(&frame.data)?;
        self.stdin.flush()?;

        match self.replies.recv_timeout(timeout) {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(None)) | Err(RecvTimeoutError::Disconnected) => {
                Err(DetectorError::InferenceFailed("Detector exited".into()))
            }
            Err(RecvTimeoutError::Timeout) => Err(DetectorError::InferenceFailed(format!(
                "No reply within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    fn stop(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ProcessDetector {
    pub fn spawn(
        argv: &[String],
        reply_timeout: Duration,
    ) -> Result<ProcessDetector, DetectorError> {
        let running = start(argv)?;
        Ok(ProcessDetector {
            argv: argv.to_vec(),
            reply_timeout,
            running: Some(running),
        })
    }
}

fn start(argv: &[String]) -> Result<DetectorProcess, DetectorError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| DetectorError::InferenceFailed("No detector program given".into()))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| {
            DetectorError::InferenceFailed(format!("Unable to start {}: {}", program, e))
        })?;
    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DetectorError::InferenceFailed(
                "Detector pipes were not captured".into(),
            ));
        }
    };

    let (tx, rx) = mpsc::sync_channel(1);
    // The reader exits once the pipe closes or the receiving side is dropped
    let reader = thread::Builder::new()
        .name(format!("{}-replies", program))
        .spawn(move || read_replies(BufReader::new(stdout), tx));
    if let Err(e) = reader {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e.into());
    }
    debug!(%program, "Detector process started");
    Ok(DetectorProcess {
        child,
        stdin,
        replies: rx,
    })
}

fn read_replies(mut source: BufReader<ChildStdout>, tx: SyncSender<io::Result<Option<String>>>) {
    loop {
        let mut line = String::new();
        let next = source
            .read_line(&mut line)
            .map(|read| (read > 0).then(|| line));
        let done = !matches!(next, Ok(Some(_)));
        if tx.send(next).is_err() || done {
            return;
        }
    }
}

impl Detector for ProcessDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawCandidate>, DetectorError> {
        let mut process = match self.running.take() {
            Some(process) => process,
            None => {
                debug!(argv=?self.argv, "Restarting detector process");
                start(&self.argv)?
            }
        };
        match process.exchange(frame, self.reply_timeout) {
            Ok(line) => {
                self.running = Some(process);
                trace!(reply=%line.trim_end(), "Detector reply");
                parse_reply(&line)
            }
            Err(e) => {
                // The process is in an unknown state, replace it before the next frame
                warn!("Stopping detector process: {}", e);
                process.stop();
                Err(e)
            }
        }
    }
}

impl Drop for ProcessDetector {
    fn drop(&mut self) {
        if let Some(process) = self.running.take() {
            process.stop();
        }
    }
}

pub fn parse_reply(line: &str) -> Result<Vec<RawCandidate>, DetectorError> {
    serde_json::from_str(line.trim()).map_err(|e| DetectorError::ProtocolInvalid(e.to_string()))
}

quick_error! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum DetectorError {
        InferenceFailed(reason: String) {
            display("Inference failed: {}", reason)
            from(e: std::io::Error) -> (e.to_string())
        }
        ProtocolInvalid(reason: String) {
            display("Detector output malformed: {}", reason)
        }
    }
}
