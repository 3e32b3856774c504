use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    announce,
    camera::{
        candidates, probe_candidates, CameraError, CameraSource, CaptureSettings, SystemOpener,
    },
    config::Config,
    detection::{
        AlertEvent, DetectionAlertPipeline, Detector, DetectorError, PipelineConfig,
        ProcessDetector, Vocabulary,
    },
};

/// Back-off after a transient read failure
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

quick_error! {
    #[derive(Debug)]
    pub enum RunError {
        Camera(error: CameraError) {
            from()
            display("{}", error)
            source(error)
        }
        Detector(error: DetectorError) {
            from()
            display("Unable to start detector: {}", error)
            source(error)
        }
        Task(error: String) {
            display("Camera loop aborted: {}", error)
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct LoopSummary {
    pub frames: u64,
    pub read_failures: u64,
    pub inference_failures: u64,
    pub alerts: u64,
}

/// Capture, detect and announce until interrupted.
pub async fn run(cfg: Config) -> Result<LoopSummary, RunError> {
    let pipeline = match &cfg.detection.detector_command {
        Some(argv) => {
            let timeout = Duration::from_millis(cfg.detection.detector_timeout_ms);
            let detector = ProcessDetector::spawn(argv, timeout)?;
            info!(detector=%argv.join(" "), "Detector started");
            Some(DetectionAlertPipeline::new(
                detector,
                Vocabulary::new(cfg.detection.classes.clone()),
                PipelineConfig::from(&cfg.detection),
            ))
        }
        None => {
            warn!("No detector_command configured, running capture only");
            None
        }
    };
    run_loop(cfg, pipeline).await
}

/// Capture frames without running any detection.
pub async fn capture(cfg: Config) -> Result<LoopSummary, RunError> {
    run_loop::<ProcessDetector>(cfg, None).await
}

async fn run_loop<D: Detector + Send + 'static>(
    cfg: Config,
    pipeline: Option<DetectionAlertPipeline<D>>,
) -> Result<LoopSummary, RunError> {
    let (alert_tx, alert_rx) = mpsc::channel::<AlertEvent>(20);
    let sinks = announce::build_sinks(&cfg.announce);
    let announcer =
        tokio::spawn(announce::run_announcer(alert_rx, sinks).instrument(info_span!("Announcer")));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stop requested, finishing current frame...");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let camera_cfg = cfg.camera.clone();
    let log_interval = cfg.detection.sample_interval_frames;
    let span = info_span!("Camera loop");
    let result = tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        let camera = CameraSource::open(&camera_cfg)?;
        Ok::<_, CameraError>(camera_loop(camera, pipeline, &alert_tx, &stop, log_interval))
    })
    .await
    .map_err(|e| RunError::Task(e.to_string()))?;

    // The sender was moved into the loop and is gone now, so the announcer drains and exits
    if let Err(e) = announcer.await {
        error!("Announcer task failed: {}", e);
    }

    let (summary, end) = result?;
    info!(
        frames = summary.frames,
        alerts = summary.alerts,
        read_failures = summary.read_failures,
        inference_failures = summary.inference_failures,
        "Detection stopped"
    );
    match end {
        Some(e) => Err(e.into()),
        None => Ok(summary),
    }
}

/// The acquisition loop. Returns the loop statistics and, when the camera gave out, why.
///
/// The camera is closed on every exit path.
pub fn camera_loop<D: Detector>(
    mut camera: CameraSource,
    mut pipeline: Option<DetectionAlertPipeline<D>>,
    alerts: &mpsc::Sender<AlertEvent>,
    stop: &AtomicBool,
    log_interval: u64,
) -> (LoopSummary, Option<CameraError>) {
    let mut summary = LoopSummary::default();
    let log_interval = log_interval.max(1);
    let mut end = None;

    while !stop.load(Ordering::SeqCst) {
        let frame = match camera.capture() {
            Ok(frame) => frame,
            Err(CameraError::ReadFailed(reason)) => {
                summary.read_failures += 1;
                warn!("Failed to read frame: {}", reason);
                thread::sleep(READ_RETRY_DELAY);
                continue;
            }
            Err(e) => {
                error!("Camera unusable: {}", e);
                end = Some(e);
                break;
            }
        };
        summary.frames += 1;

        let pipeline = match pipeline.as_mut() {
            Some(pipeline) => pipeline,
            None => {
                if summary.frames % log_interval == 0 {
                    info!(
                        frames = summary.frames,
                        width = frame.width,
                        height = frame.height,
                        "Frames captured"
                    );
                }
                continue;
            }
        };

        match pipeline.process_frame(&frame, Instant::now()) {
            Ok(report) => {
                if report.sampled {
                    debug!(
                        frame = report.frame_number,
                        detections = report.detections.len(),
                        "Frame analysed"
                    );
                }
                for alert in report.alerts {
                    summary.alerts += 1;
                    if alerts.blocking_send(alert).is_err() {
                        warn!("Announcer is gone, stopping");
                        stop.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
            Err(e) => {
                summary.inference_failures += 1;
                warn!("{}", e);
            }
        }
    }

    if let Some(pipeline) = &pipeline {
        debug!(
            frames = pipeline.frame_counter(),
            classes_announced = pipeline.announcements().len(),
            "Pipeline state"
        );
    }
    camera.close();
    (summary, end)
}

/// Try every camera candidate and print how each one fared. Returns whether any worked.
pub fn probe(cfg: &Config) -> bool {
    let settings = CaptureSettings::from(&cfg.camera);
    let list = candidates(cfg.camera.prefer_camera_stack, &cfg.camera.device_indices);
    let mut opener = SystemOpener::from_config(&cfg.camera);

    println!(
        "Probing {} camera backend(s) at {}x{} @ {}fps",
        list.len(),
        settings.width,
        settings.height,
        settings.frame_rate
    );
    let outcomes = probe_candidates(&list, &settings, &mut opener);
    let mut any_ok = false;
    for outcome in &outcomes {
        match &outcome.result {
            Ok((width, height)) => {
                any_ok = true;
                println!("  [ok]   {}: frame {}x{}", outcome.backend, width, height);
            }
            Err(e) => println!("  [fail] {}: {}", outcome.backend, e),
        }
    }
    if !any_ok {
        println!(
            "No camera produced a frame. Check the ribbon cable, that the camera interface is \
             enabled and that this user is in the video group."
        );
    }
    any_ok
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;

    use tokio::sync::mpsc;

    use super::{camera_loop, LoopSummary};
    use crate::{
        camera::{
            fakes::{rgb, settings, FakeOpener, Script},
            BackendId, BackendState, CameraError, CameraSource,
        },
        detection::{
            fakes::{candidate, vocabulary, ScriptedDetector},
            BoundingBox, DetectionAlertPipeline, DetectorError, PipelineConfig,
        },
    };

    const DEV0: BackendId = BackendId::VideoCapture { index: 0 };

    fn pipeline(detector: ScriptedDetector) -> DetectionAlertPipeline<ScriptedDetector> {
        DetectionAlertPipeline::new(
            detector,
            vocabulary(),
            PipelineConfig {
                sample_interval_frames: 2,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_loop_runs_until_camera_gives_out() {
        // Probe frame, then 4 frames, one transient failure and a stall
        let frames = vec![
            Ok(rgb(2, 2)),
            Ok(rgb(2, 2)),
            Ok(rgb(2, 2)),
            Err(()),
            Ok(rgb(2, 2)),
            Ok(rgb(2, 2)),
            Err(()),
            Err(()),
        ];
        let mut opener = FakeOpener::default().with(DEV0, Script::Frames(frames));
        let camera = CameraSource::open_with(settings(), &[DEV0], 2, &mut opener).unwrap();

        let mut detector = ScriptedDetector::always(vec![candidate(
            "person",
            0.9,
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        )]);
        detector
            .replies
            .push_back(Err(DetectorError::InferenceFailed("busy".into())));

        let (tx, mut rx) = mpsc::channel(8);
        let stop = AtomicBool::new(false);
        let (summary, end) = camera_loop(camera, Some(pipeline(detector)), &tx, &stop, 30);

        assert_eq!(end, Some(CameraError::Stalled(2)));
        assert_eq!(
            summary,
            LoopSummary {
                frames: 4,
                read_failures: 2,
                inference_failures: 1,
                alerts: 1,
            }
        );
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.class, "person");
        assert!(rx.try_recv().is_err());
        assert_eq!(opener.releases(DEV0), 1);
    }

    #[test]
    fn test_stop_signal_closes_camera() {
        let mut opener =
            FakeOpener::default().with(DEV0, Script::Frames(vec![Ok(rgb(1, 1)); 4]));
        let camera = CameraSource::open_with(settings(), &[DEV0], 2, &mut opener).unwrap();
        assert_eq!(camera.state(), BackendState::Active(DEV0));

        let (tx, _rx) = mpsc::channel(1);
        let stop = AtomicBool::new(true);
        let (summary, end) = camera_loop::<ScriptedDetector>(camera, None, &tx, &stop, 30);
        assert_eq!(summary, LoopSummary::default());
        assert_eq!(end, None);
        assert_eq!(opener.releases(DEV0), 1);
    }

    #[test]
    fn test_capture_only_counts_frames() {
        let mut opener =
            FakeOpener::default().with(DEV0, Script::Frames(vec![Ok(rgb(1, 1)); 6]));
        let camera = CameraSource::open_with(settings(), &[DEV0], 1, &mut opener).unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let stop = AtomicBool::new(false);
        let (summary, end) = camera_loop::<ScriptedDetector>(camera, None, &tx, &stop, 2);
        assert_eq!(summary.frames, 5);
        assert_eq!(end, Some(CameraError::Stalled(1)));
    }
}
