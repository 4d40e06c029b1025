use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::inference::{InferenceSettings, SamParameters};
use crate::model::{Device, SamModelKind};

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Address the demo server listens on
    #[arg(short, long, default_value = "0.0.0.0:7860")]
    pub bind: SocketAddr,

    /// Directory holding `sam_<model>_encoder.onnx` and `sam_<model>_decoder.onnx`
    #[arg(short, long, default_value = "models")]
    pub model_dir: PathBuf,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    /// Example image; repeat to register several. Missing files are skipped
    /// and ids follow the order of the remaining ones.
    #[arg(
        long = "example",
        default_values = ["images/groceries.jpg", "images/truck.jpg"]
    )]
    pub examples: Vec<PathBuf>,

    #[arg(long, default_value = "cuda", value_parser = check_device)]
    pub default_device: String,

    #[arg(long, default_value = "vit_h", value_parser = check_model)]
    pub default_model: String,

    #[arg(long, default_value_t = 20 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Seconds a session may stay unused before it is dropped; 0 keeps sessions forever
    #[arg(long, default_value_t = 3600)]
    pub session_idle_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn session_idle(&self) -> Option<Duration> {
        (self.session_idle_secs > 0).then(|| Duration::from_secs(self.session_idle_secs))
    }

    /// UI の初期値として使う推論設定
    pub fn default_settings(&self) -> InferenceSettings {
        InferenceSettings {
            device: self.default_device.clone(),
            model: self.default_model.clone(),
            params: SamParameters::default(),
        }
    }
}

fn check_device(s: &str) -> Result<String, String> {
    s.parse::<Device>()
        .map(|_| s.to_string())
        .map_err(|e| e.to_string())
}

fn check_model(s: &str) -> Result<String, String> {
    s.parse::<SamModelKind>()
        .map(|_| s.to_string())
        .map_err(|e| e.to_string())
}
