//! Backend factory: dispatch on the configured backend name, falling back
//! to the Ollama-shaped backend when the configured one cannot be built.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use kbagent_core::backend::InferenceBackend;
use kbagent_core::config::Config;

use crate::ollama::OllamaBackend;
use crate::openai::OpenAiBackend;

pub fn create_backend(config: &Config) -> Result<Arc<dyn InferenceBackend>> {
    match config.inference_backend.as_str() {
        "openai-compat" => match OpenAiBackend::from_config(config) {
            Ok(backend) => {
                info!("using openai-compat backend at {}", config.localai_api_url);
                return Ok(Arc::new(backend));
            }
            Err(e) => {
                warn!("openai-compat backend failed to build ({e:#}); falling back to ollama");
            }
        },
        "ollama" => {}
        other => {
            warn!("unknown inference backend '{other}'; falling back to ollama");
        }
    }
    let backend = OllamaBackend::from_config(config).context("build ollama backend")?;
    info!("using ollama backend at {}", config.ollama_url);
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_is_the_default() {
        let config = Config::default();
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.name(), "ollama");
    }

    #[test]
    fn openai_compat_is_selected_when_configured() {
        let mut config = Config::default();
        config.inference_backend = "openai-compat".to_string();
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.name(), "openai-compat");
    }

    #[test]
    fn unknown_backend_falls_back_to_ollama() {
        let mut config = Config::default();
        config.inference_backend = "exllamav2".to_string();
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.name(), "ollama");
    }
}
