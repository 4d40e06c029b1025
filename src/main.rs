use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use sam_prompt_rs::{server, AppState, Config, ExampleRegistry, SamModel};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    ensure!(
        config.model_dir.is_dir(),
        "Model directory does not exist: {}",
        config.model_dir.display()
    );

    let model = SamModel::new(&config.model_dir, config.device_id);
    let available = model.available_models();
    if available.is_empty() {
        log::warn!(
            "no sam_<model>_encoder.onnx / sam_<model>_decoder.onnx pair found in {}",
            config.model_dir.display()
        );
    } else {
        log::info!("models available: {available:?}");
    }

    let registry = ExampleRegistry::load_existing(&config.examples);

    let state = AppState::new(Arc::new(model), registry, config.default_settings())
        .with_upload_limit(config.max_upload_bytes)
        .with_session_idle(config.session_idle());

    let bind = config.bind;
    server::serve(Arc::new(state), bind)
        .await
        .with_context(|| format!("Server on {bind} stopped"))
}
