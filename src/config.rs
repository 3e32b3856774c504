use std::{collections::HashSet, path::Path};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    announce::MqttQoS,
    detection::{COCO_CLASSES, DEFAULT_ANNOUNCE_CLASSES},
};

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub system: ConfigSystem,
    pub camera: ConfigCamera,
    pub detection: ConfigDetection,
    pub announce: ConfigAnnounce,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigSystem {
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ConfigSystem {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_json: false,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigCamera {
    pub width: u32,
    pub height: u32,
    /// Advisory, backends may ignore it
    pub frame_rate: u32,
    pub prefer_camera_stack: bool,
    pub device_indices: Vec<u32>,
    pub camera_stack_command: String,
    pub video_capture_command: String,
    pub read_timeout_ms: u64,
    /// Consecutive read failures before the camera is declared stalled. 0 disables the limit.
    pub max_consecutive_failures: u32,
}

impl Default for ConfigCamera {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
            prefer_camera_stack: true,
            device_indices: vec![0, 1, 2],
            camera_stack_command: "rpicam-vid".into(),
            video_capture_command: "ffmpeg".into(),
            read_timeout_ms: 2000,
            max_consecutive_failures: 10,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigDetection {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub sample_interval_frames: u64,
    pub cooldown_duration_seconds: f64,
    pub classes: Vec<String>,
    pub announceable_classes: Vec<String>,
    /// Program (and arguments) speaking the detector line protocol. Absent means capture only.
    pub detector_command: Option<Vec<String>>,
    /// How long to wait for the detector to answer one frame before restarting it
    pub detector_timeout_ms: u64,
}

impl Default for ConfigDetection {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
            sample_interval_frames: 30,
            cooldown_duration_seconds: 5.0,
            classes: COCO_CLASSES.iter().map(|c| c.to_string()).collect(),
            announceable_classes: DEFAULT_ANNOUNCE_CLASSES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            detector_command: None,
            detector_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigAnnounce {
    pub console: bool,
    pub speech_command: Option<Vec<String>>,
    pub mqtt: Option<ConfigMqtt>,
}

impl Default for ConfigAnnounce {
    fn default() -> Self {
        Self {
            console: true,
            speech_command: None,
            mqtt: None,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigMqtt {
    pub address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    /// QoS for alert messages. Availability is always published at least once.
    #[serde(default = "default_mqtt_qos")]
    pub qos: MqttQoS,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_base_topic() -> String {
    "pi_detector".into()
}

fn default_mqtt_qos() -> MqttQoS {
    MqttQoS::AtLeastOnce
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, String> {
    let cfg: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("PI_DETECTOR_").split("__"))
        .extract()
        .map_err(|e| e.to_string())?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        let cam = &self.camera;
        if cam.width == 0 || cam.height == 0 {
            return Err(format!(
                "Camera resolution must be non-zero, got {}x{}",
                cam.width, cam.height
            ));
        }
        if !cam.prefer_camera_stack && cam.device_indices.is_empty() {
            return Err(
                "No camera candidates: enable prefer_camera_stack or list device_indices".into(),
            );
        }

        let det = &self.detection;
        if !(0.0..=1.0).contains(&det.confidence_threshold) {
            return Err(format!(
                "confidence_threshold must be within [0, 1], got {}",
                det.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&det.iou_threshold) {
            return Err(format!(
                "iou_threshold must be within [0, 1], got {}",
                det.iou_threshold
            ));
        }
        if det.sample_interval_frames == 0 {
            return Err("sample_interval_frames must be at least 1".into());
        }
        if !det.cooldown_duration_seconds.is_finite() || det.cooldown_duration_seconds < 0.0 {
            return Err(format!(
                "cooldown_duration_seconds must be a non-negative number, got {}",
                det.cooldown_duration_seconds
            ));
        }
        if det.classes.is_empty() {
            return Err("Class vocabulary is empty".into());
        }
        // Check that class names are unique
        let mut labels = HashSet::new();
        for class in &det.classes {
            if !labels.insert(class.as_str()) {
                return Err(format!("Class {} is listed twice in the vocabulary", class));
            }
        }
        for class in &det.announceable_classes {
            if !labels.contains(class.as_str()) {
                return Err(format!(
                    "Announceable class {} is not in the class vocabulary",
                    class
                ));
            }
        }
        if let Some(cmd) = &det.detector_command {
            if cmd.is_empty() {
                return Err("detector_command must name a program".into());
            }
        }
        if det.detector_timeout_ms == 0 {
            return Err("detector_timeout_ms must be at least 1".into());
        }
        if let Some(cmd) = &self.announce.speech_command {
            if cmd.is_empty() {
                return Err("speech_command must name a program".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{load_config, Config};
    use crate::announce::MqttQoS;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.detection.classes.len(), 80);
        assert_eq!(cfg.detection.sample_interval_frames, 30);
        assert_eq!(cfg.camera.device_indices, vec![0, 1, 2]);
        assert!(cfg.announce.console);
    }

    #[test]
    fn test_load_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                indoc::indoc! {r#"
                    [system]
                    log_level = "debug"

                    [camera]
                    width = 1280
                    height = 720
                    device_indices = [1]

                    [detection]
                    cooldown_duration_seconds = 2.5
                    announceable_classes = ["person", "cat"]
                    detector_command = ["python3", "yolo_bridge.py"]

                    [announce.mqtt]
                    address = "10.0.0.2"
                    qos = "exactly_once"
                "#},
            )?;
            jail.set_env("PI_DETECTOR_DETECTION__SAMPLE_INTERVAL_FRAMES", "15");
            jail.set_env("PI_DETECTOR_DETECTION__DETECTOR_TIMEOUT_MS", "2500");

            let cfg = load_config("config.toml")?;
            assert_eq!(cfg.system.log_level, "debug");
            assert_eq!((cfg.camera.width, cfg.camera.height), (1280, 720));
            assert_eq!(cfg.camera.device_indices, vec![1]);
            assert_eq!(cfg.camera.frame_rate, 30);
            assert_eq!(cfg.detection.sample_interval_frames, 15);
            assert_eq!(cfg.detection.detector_timeout_ms, 2500);
            assert_eq!(cfg.detection.cooldown_duration_seconds, 2.5);
            assert_eq!(cfg.detection.announceable_classes, vec!["person", "cat"]);
            assert_eq!(
                cfg.detection.detector_command,
                Some(vec!["python3".to_string(), "yolo_bridge.py".to_string()])
            );
            let mqtt = cfg.announce.mqtt.expect("mqtt section");
            assert_eq!(mqtt.port, 1883);
            assert_eq!(mqtt.base_topic, "pi_detector");
            assert_eq!(mqtt.qos, MqttQoS::ExactlyOnce);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|_| {
            let cfg = load_config("absent.toml")?;
            assert_eq!(cfg, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_rejects_invalid() {
        let mut cfg = Config::default();
        cfg.detection.announceable_classes.push("unicorn".into());
        insta::assert_snapshot!(
            cfg.validate().unwrap_err(),
            @"Announceable class unicorn is not in the class vocabulary"
        );

        let mut cfg = Config::default();
        cfg.detection.sample_interval_frames = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.detection.iou_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.detection.cooldown_duration_seconds = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.detection.classes.push("person".into());
        insta::assert_snapshot!(
            cfg.validate().unwrap_err(),
            @"Class person is listed twice in the vocabulary"
        );

        let mut cfg = Config::default();
        cfg.detection.detector_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.camera.prefer_camera_stack = false;
        cfg.camera.device_indices.clear();
        assert!(cfg.validate().is_err());
    }
}
