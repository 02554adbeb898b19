use angler_core::{DeclaredCount, Rotation, SessionConfig, Thresholds};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(BusKind::System),
            "session" | "user" => Ok(BusKind::Session),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Clockwise rotation applied to every camera frame.
    pub rotation: Rotation,
    /// Frames discarded before each still while exposure settles.
    pub warmup_frames: usize,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where the mirrored confirmation preview is written.
    pub preview_dir: PathBuf,
    pub session: SessionConfig,
    pub declared_count: DeclaredCount,
    pub bus: BusKind,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    camera: CameraSection,
    paths: PathsSection,
    thresholds: Option<Thresholds>,
    session: SessionSection,
    bus: Option<BusKind>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CameraSection {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    rotation: Option<i32>,
    warmup_frames: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PathsSection {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    preview_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SessionSection {
    window: Option<usize>,
    required_stable: Option<usize>,
    declared_count: Option<DeclaredCount>,
}

impl Config {
    /// Load configuration from `ANGLER_*` environment variables with defaults.
    ///
    /// If `ANGLER_CONFIG` names a TOML file it is read first; environment
    /// variables override anything it sets.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var("ANGLER_CONFIG") {
            Ok(path) => load_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("angler");

        let base = file.thresholds.unwrap_or_default();
        let thresholds = Thresholds {
            yaw_enter: env_parse(&env, "ANGLER_YAW_ENTER").unwrap_or(base.yaw_enter),
            pitch_up_enter: env_parse(&env, "ANGLER_PITCH_UP_ENTER").unwrap_or(base.pitch_up_enter),
            pitch_down_enter: env_parse(&env, "ANGLER_PITCH_DOWN_ENTER").unwrap_or(base.pitch_down_enter),
            roll_abs_max: env_parse(&env, "ANGLER_ROLL_LIMIT").unwrap_or(base.roll_abs_max),
            min_face_fraction: env_parse(&env, "ANGLER_MIN_FACE_FRACTION").unwrap_or(base.min_face_fraction),
        };

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            thresholds,
            window: env_parse(&env, "ANGLER_SMOOTHING_WINDOW")
                .or(file.session.window)
                .unwrap_or(defaults.window),
            required_stable: env_parse(&env, "ANGLER_REQUIRED_STABLE")
                .or(file.session.required_stable)
                .unwrap_or(defaults.required_stable),
            targets: defaults.targets,
        };

        let rotation_degrees = env_parse::<i32>(&env, "ANGLER_ROTATION")
            .or(file.camera.rotation)
            .unwrap_or(0);
        let rotation = Rotation::from_degrees(rotation_degrees).unwrap_or_else(|| {
            tracing::warn!(degrees = rotation_degrees, "unsupported rotation, using 0");
            Rotation::None
        });

        Self {
            camera_device: env("ANGLER_CAMERA_DEVICE")
                .or(file.camera.device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: env_parse(&env, "ANGLER_FRAME_WIDTH")
                .or(file.camera.width)
                .unwrap_or(640),
            frame_height: env_parse(&env, "ANGLER_FRAME_HEIGHT")
                .or(file.camera.height)
                .unwrap_or(480),
            rotation,
            warmup_frames: env_parse(&env, "ANGLER_WARMUP_FRAMES")
                .or(file.camera.warmup_frames)
                .unwrap_or(2),
            model_dir: env("ANGLER_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.paths.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: env("ANGLER_DB_PATH")
                .map(PathBuf::from)
                .or(file.paths.db_path)
                .unwrap_or_else(|| data_dir.join("identities.db")),
            preview_dir: env("ANGLER_PREVIEW_DIR")
                .map(PathBuf::from)
                .or(file.paths.preview_dir)
                .unwrap_or_else(|| std::env::temp_dir().join("angler")),
            session,
            declared_count: env_parse(&env, "ANGLER_DECLARED_COUNT")
                .or(file.session.declared_count)
                .unwrap_or_default(),
            bus: env_parse(&env, "ANGLER_BUS").or(file.bus).unwrap_or_default(),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_file(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_file(text: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(text)
}

/// Parse an environment variable, ignoring (and logging) values that don't parse.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
