use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    // Optional section; sensible audio defaults apply when absent.
    #[serde(default)]
    pub audio: AudioConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_samples: usize,
    pub rms_threshold: f32,
    pub outbound_queue_capacity: usize,
}

#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    pub url: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_samples: 4096,
            rms_threshold: 0.01,
            outbound_queue_capacity: 32,
        }
    }
}
