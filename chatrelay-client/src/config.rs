use std::{path::PathBuf, time::Duration};

use clap::Parser;
use thiserror::Error;

use crate::{
    connection::{ConnectionError, Endpoint, TransportConfig},
    image_pipeline::PipelineConfig,
};

const MAX_SERVER_URL_LEN: usize = 2048;

#[derive(Parser, Debug, Clone)]
#[command(name = "chatrelay")]
pub struct ClientArgs {
    /// Relay address, either `host:port` or a ws/wss/http/https URL.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub server_url: String,

    #[arg(long, default_value_t = 800)]
    pub max_image_width: u32,

    #[arg(long, default_value_t = 80)]
    pub jpeg_quality: u8,

    #[arg(long, default_value_t = 3)]
    pub connect_attempts: u32,

    #[arg(long, default_value_t = 12)]
    pub connect_timeout_secs: u64,

    /// Where resized images are staged before encoding. Defaults to the system temp dir.
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server URL is too long ({len} > {MAX_SERVER_URL_LEN} chars)")]
    ServerUrlTooLong { len: usize },
    #[error(transparent)]
    Endpoint(#[from] ConnectionError),
    #[error("JPEG quality must be between 1 and 100, got {0}")]
    JpegQuality(u8),
    #[error("maximum image width must be at least 1")]
    ImageWidth,
    #[error("connect attempts must be at least 1")]
    ConnectAttempts,
    #[error("connect timeout must be at least 1 second")]
    ConnectTimeout,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub transport: TransportConfig,
    pub pipeline: PipelineConfig,
}

impl ClientConfig {
    pub fn from_args(args: &ClientArgs) -> Result<Self, ConfigError> {
        let server_url = args.server_url.trim();
        if server_url.len() > MAX_SERVER_URL_LEN {
            return Err(ConfigError::ServerUrlTooLong {
                len: server_url.len(),
            });
        }
        let endpoint = Endpoint::parse(server_url)?;

        if !(1..=100).contains(&args.jpeg_quality) {
            return Err(ConfigError::JpegQuality(args.jpeg_quality));
        }
        if args.max_image_width == 0 {
            return Err(ConfigError::ImageWidth);
        }
        if args.connect_attempts == 0 {
            return Err(ConfigError::ConnectAttempts);
        }
        if args.connect_timeout_secs == 0 {
            return Err(ConfigError::ConnectTimeout);
        }

        Ok(Self {
            endpoint,
            transport: TransportConfig {
                max_connect_attempts: args.connect_attempts,
                connect_timeout: Duration::from_secs(args.connect_timeout_secs),
                ..TransportConfig::default()
            },
            pipeline: PipelineConfig {
                max_width: args.max_image_width,
                jpeg_quality: args.jpeg_quality,
                temp_dir: args.temp_dir.clone(),
                ..PipelineConfig::default()
            },
        })
    }
}
