use mediaduct::convert;
use mediaduct::core::{config, logging};
use mediaduct::extract;
use mediaduct::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = logging::init_logger(config::LOG_FILE_PATH.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    log::info!("Starting mediaduct v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Mode: {}", &*config::MODE);
    log::info!("Extractor: {}", &*config::EXTRACTOR_BIN);
    log::info!("Transcoder: {}", &*config::TRANSCODER_BIN);

    match extract::binary_version().await {
        Some(version) => log::info!("Extractor version: {}", version),
        None => log::warn!(
            "Extractor '{}' is not runnable; analyze and download requests will fail",
            &*config::EXTRACTOR_BIN
        ),
    }
    if !convert::check_transcoder().await {
        log::warn!(
            "Transcoder '{}' is not runnable; convert requests will fail",
            &*config::TRANSCODER_BIN
        );
    }

    let state = AppState::new();
    state.spawn_background_tasks();

    if let Err(e) = mediaduct::serve(*config::PORT, state).await {
        log::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
