//! Configuration: CLI flags, optional TOML file, validation.
//!
//! # Responsibilities
//! - Define the flag surface (listen address, TLS materials, MITM root
//!   pair, transcoder tuning, proxy credentials)
//! - Optionally merge values from a TOML config file (flags win)
//! - Validate pairings before startup (cert/key and ca/cakey must be
//!   given together)

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::CompyError;

/// Command-line flags. Every flag is optional; unset flags fall back to
/// the config file value and then to the built-in default.
#[derive(Parser, Debug)]
#[command(name = "compy", version, about = "Compression proxy")]
pub struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address, also the proxy's externally visible host:port.
    #[arg(long)]
    pub host: Option<String>,

    /// Proxy TLS certificate path (serve the proxy itself over TLS).
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Proxy TLS key path.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Root CA certificate path; enables MITM interception.
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Root CA key path.
    #[arg(long)]
    pub cakey: Option<PathBuf>,

    /// JPEG quality (1-100, 0 to disable JPEG transcoding).
    #[arg(long)]
    pub jpeg: Option<u8>,

    /// Transcode GIFs into static images.
    #[arg(long)]
    pub gif: Option<bool>,

    /// Transcode PNGs.
    #[arg(long)]
    pub png: Option<bool>,

    /// Gzip compression level (0-9).
    #[arg(long)]
    pub gzip: Option<u32>,

    /// Brotli compression level (0-11).
    #[arg(long)]
    pub brotli: Option<u32>,

    /// Minify css/html/js - WARNING: tends to break the web.
    #[arg(long)]
    pub minify: Option<bool>,

    /// Proxy authentication user name.
    #[arg(long)]
    pub user: Option<String>,

    /// Proxy authentication password.
    #[arg(long)]
    pub pass: Option<String>,
}

/// Resolved configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub cakey: Option<PathBuf>,
    pub jpeg: u8,
    pub gif: bool,
    pub png: bool,
    pub gzip: u32,
    pub brotli: u32,
    pub minify: bool,
    pub user: String,
    pub pass: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost:9999".to_string(),
            cert: None,
            key: None,
            ca: None,
            cakey: None,
            jpeg: 50,
            gif: true,
            png: true,
            gzip: 6,
            brotli: 6,
            minify: false,
            user: String::new(),
            pass: String::new(),
        }
    }
}

impl Config {
    /// Build the effective configuration: file values as the base, flags
    /// overriding, then validate the result.
    pub fn load(args: Args) -> Result<Self, CompyError> {
        let mut config = match &args.config {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| CompyError::ReadFile {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&content)
                    .map_err(|e| CompyError::Config(format!("{}: {}", path.display(), e)))?
            }
            None => Config::default(),
        };

        if let Some(host) = args.host {
            config.host = host;
        }
        config.cert = args.cert.or(config.cert);
        config.key = args.key.or(config.key);
        config.ca = args.ca.or(config.ca);
        config.cakey = args.cakey.or(config.cakey);
        if let Some(jpeg) = args.jpeg {
            config.jpeg = jpeg;
        }
        if let Some(gif) = args.gif {
            config.gif = gif;
        }
        if let Some(png) = args.png {
            config.png = png;
        }
        if let Some(gzip) = args.gzip {
            config.gzip = gzip;
        }
        if let Some(brotli) = args.brotli {
            config.brotli = brotli;
        }
        if let Some(minify) = args.minify {
            config.minify = minify;
        }
        if let Some(user) = args.user {
            config.user = user;
        }
        if let Some(pass) = args.pass {
            config.pass = pass;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CompyError> {
        if self.ca.is_some() != self.cakey.is_some() {
            return Err(CompyError::Config(
                "must specify both CA certificate and key".to_string(),
            ));
        }
        if self.cert.is_some() != self.key.is_some() {
            return Err(CompyError::Config(
                "must specify both certificate and key".to_string(),
            ));
        }
        if self.jpeg > 100 {
            return Err(CompyError::Config(format!(
                "jpeg quality out of range: {}",
                self.jpeg
            )));
        }
        if self.gzip > 9 {
            return Err(CompyError::Config(format!(
                "gzip level out of range: {}",
                self.gzip
            )));
        }
        if self.brotli > 11 {
            return Err(CompyError::Config(format!(
                "brotli level out of range: {}",
                self.brotli
            )));
        }
        if self.user.is_empty() != self.pass.is_empty() {
            return Err(CompyError::Config(
                "must specify both user and password".to_string(),
            ));
        }
        Ok(())
    }
}
