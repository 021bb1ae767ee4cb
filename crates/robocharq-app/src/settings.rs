use anyhow::{bail, Context, Result};
use robocharq_core::{LinkConfig, ResumeMode, SensorBits};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FILE_NAME: &str = "robocharq.json";

/// Shown when no settings file is found. Older stations used `config.properties`.
pub const FORMAT_HINT: &str =
    "config.properties não é mais lido; use robocharq.json com as chaves PORT, BAUDRATE, INI_BIT, FIM_BIT, FONTSIZE";

/// Station settings. Key names match the sensor board's documentation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Settings {
    pub port: String,
    pub baudrate: u32,
    pub ini_bit: u8,
    pub fim_bit: u8,
    pub fontsize: f32,
    pub refresh_ms: u64,
    pub resume_mode: String,
    pub fullscreen: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baudrate: 9600,
            ini_bit: 0,
            fim_bit: 1,
            fontsize: 200.0,
            refresh_ms: 16,
            resume_mode: "restart".into(),
            fullscreen: true,
        }
    }
}

impl Settings {
    /// Loads `explicit` if given, otherwise the first file found in the
    /// working directory or the user config directory. Falls back to defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("settings file {} not found", path.display());
            }
            let settings = Self::from_file(&path)?;
            return Ok((settings, Some(path)));
        }

        for path in candidate_paths() {
            if path.exists() {
                let settings = Self::from_file(&path)?;
                return Ok((settings, Some(path)));
            }
        }

        log::warn!("no {FILE_NAME} found, using defaults ({})", FORMAT_HINT);
        Ok((Self::default(), None))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn link_config(&self) -> Result<LinkConfig> {
        let bits = SensorBits::new(self.ini_bit, self.fim_bit)?;
        Ok(LinkConfig {
            port_name: self.port.clone(),
            baud_rate: self.baudrate,
            bits,
        })
    }

    pub fn resume_mode(&self) -> Result<ResumeMode> {
        Ok(self.resume_mode.parse()?)
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms.max(1))
    }
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("robocharq").join(FILE_NAME));
    }
    paths
}
