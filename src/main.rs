//! Demo driver for the ESI middleware core
//!
//! Loads a configuration file, builds a processor with the default
//! backend factories and runs one HTML file through the pipeline:
//!
//! ```bash
//! cargo run -- esi_stitch.yaml page.html
//! ```

use std::env;
use std::io::Write;
use std::sync::Arc;

use esi_stitch::{backend, logging, CancelSignal, EsiConfig, EsiProcessor, RequestSnapshot};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "esi_stitch.yaml".to_string());
    let page_path = args.next();

    let config = match EsiConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration {:?}: {}", config_path, e);
            std::process::exit(1);
        }
    };
    if let Some(first) = config.paths.first() {
        if let Err(e) = logging::setup(first) {
            eprintln!("failed to set up logging: {}", e);
            std::process::exit(1);
        }
    }

    let registry = match backend::default_registry() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("failed to build backend registry: {}", e);
            std::process::exit(1);
        }
    };
    let processor = match EsiProcessor::from_config(&config, registry) {
        Ok(processor) => processor,
        Err(e) => {
            eprintln!("failed to build processor: {}", e);
            std::process::exit(1);
        }
    };
    info!(scopes = config.paths.len(), "processor ready");

    let Some(page_path) = page_path else {
        info!("no page given; configuration is valid, exiting");
        return;
    };
    let body = match std::fs::read(&page_path) {
        Ok(body) => body,
        Err(e) => {
            eprintln!("cannot read page {:?}: {}", page_path, e);
            std::process::exit(1);
        }
    };

    let snapshot = RequestSnapshot::get(&format!("http://localhost/{}", page_path));
    let mut sink = Vec::new();
    match processor
        .process(&snapshot, &body, &mut sink, &CancelSignal::never())
        .await
    {
        Ok(outcome) => {
            info!(
                transformed = outcome.transformed,
                bytes = outcome.bytes_written,
                failed_entities = outcome.failed_entities,
                "processed page"
            );
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(&sink);
        }
        Err(e) => {
            error!(error = %e, "processing failed, emitting original body");
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(&body);
        }
    }

    if let Err(e) = processor.close().await {
        error!(error = %e, "handler shutdown reported an error");
    }
}
