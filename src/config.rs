//! Face restoration configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub restore: RestoreConfig,
    pub detection: DetectionConfig,
    pub background: BackgroundConfig,
    pub build: BuildConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Directory holding the restoration networks (`GFPGANv1.4.onnx`, ...)
    pub dir: PathBuf,
    pub detector: PathBuf,
    pub background: PathBuf,
    /// Native scale of the background network
    pub background_scale: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreConfig {
    pub canonical_size: u32,
    pub batch_capacity: usize,
    pub upscale: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
    pub tile: u32,
    pub tile_pad: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    pub workspace_limit_mb: u64,
    pub keep_fp32_layers: Vec<String>,
    pub calib_num_images: usize,
    pub calib_cache: PathBuf,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "facerestore.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: ModelsConfig::default(),
            restore: RestoreConfig::default(),
            detection: DetectionConfig::default(),
            background: BackgroundConfig::default(),
            build: BuildConfig::default(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            detector: PathBuf::from("models/scrfd_10g_kps.onnx"),
            background: PathBuf::from("models/RealESRGAN_x2plus.onnx"),
            background_scale: 2,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            canonical_size: 512,
            batch_capacity: 4,
            upscale: 2,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self { tile: 400, tile_pad: 10 }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workspace_limit_mb: 8 * 1024,
            keep_fp32_layers: [
                "modulated_conv/Pow",
                "modulated_conv/ReduceSum",
                "modulated_conv/Add",
                "modulated_conv/Sqrt",
                "modulated_conv/Div",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            calib_num_images: 25_000,
            calib_cache: PathBuf::from("calibration.cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [restore]
            canonical_size = 256
            batch_capacity = 2
            upscale = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.restore.canonical_size, 256);
        assert_eq!(config.restore.upscale, 1);
        assert_eq!(config.detection.input_size, 640);
        assert_eq!(config.build.keep_fp32_layers.len(), 5);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Config::load("/definitely/not/here.toml").is_err());
    }
}
