use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ultraviolet::Vec3;

use crate::error::{Error, Result};
use crate::render::technique::TechniqueKind;
use crate::render::FrameSettings;
use crate::scene::Scene;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process queue, runs anywhere.
    Host,
    Vulkan,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    SingleTriangle,
    GroundWithBoxes { boxes: u32 },
    CornellBox,
}

impl SceneKind {
    pub fn build(&self) -> Scene {
        match *self {
            SceneKind::SingleTriangle => Scene::single_triangle(),
            SceneKind::GroundWithBoxes { boxes } => Scene::ground_with_boxes(boxes),
            SceneKind::CornellBox => Scene::cornell_box(),
        }
    }

    /// Orbit target and distance that keep the whole scene in view.
    pub fn framing(&self) -> (Vec3, f32) {
        match *self {
            SceneKind::SingleTriangle => (Vec3::zero(), 3.0),
            SceneKind::GroundWithBoxes { boxes } => {
                (Vec3::new(0.0, 1.0, 0.0), 6.0 + 1.5 * boxes as f32)
            }
            SceneKind::CornellBox => (Vec3::new(0.0, 1.0, 0.0), 3.5),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    pub technique: TechniqueKind,
    pub width: u32,
    pub height: u32,
    /// Frames to render before exiting.
    pub frames: u32,
    pub scene: SceneKind,
    /// Directory with the compiled `<stage>.comp.spv` files.
    pub shader_dir: String,
    pub fence_soft_timeout_ms: u64,
    /// Length of ambient occlusion rays.
    pub ao_radius: f32,
    /// Extra latency of the host queue, to exercise frame pacing.
    pub host_completion_delay_ms: u64,
    /// Radians the camera orbits per frame. 0 keeps the view and accumulates samples.
    pub orbit_spin: f32,
    /// Where the last frame is written as PNG, if anywhere.
    pub output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Host,
            technique: TechniqueKind::AmbientOcclusion,
            width: 160,
            height: 120,
            frames: 16,
            scene: SceneKind::GroundWithBoxes { boxes: 3 },
            shader_dir: env!("FRAME_TRACER_SHADER_DIR").to_string(),
            fence_soft_timeout_ms: 1000,
            ao_radius: 1.5,
            host_completion_delay_ms: 0,
            orbit_spin: 0.0,
            output: None,
        }
    }
}

impl Config {
    pub fn num_rays(&self) -> u32 {
        self.width * self.height
    }

    pub fn frame_settings(&self) -> FrameSettings {
        FrameSettings {
            fence_soft_timeout: Duration::from_millis(self.fence_soft_timeout_ms),
        }
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

pub struct ConfigFileLoader {
    pub path: PathBuf,
    config: Option<Config>,
}

impl ConfigFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: None,
        }
    }

    /// Reads the config, or writes the defaults if there is no file yet.
    pub fn load_config(&mut self) -> Result<&mut Config> {
        let config = match std::fs::read_to_string(&self.path) {
            Ok(content) => content.parse()?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, writing defaults", self.path.display());
                self.config = Some(Config::default());
                self.save_config()?;
                Config::default()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(self.config.insert(config))
    }

    pub fn get_or_load_config(&mut self) -> Result<&mut Config> {
        if self.config.is_none() {
            self.load_config()?;
        }
        Ok(self.config.get_or_insert_with(Config::default))
    }

    pub fn save_config(&self) -> Result<()> {
        if let Some(config) = &self.config {
            let content = serde_json::to_string_pretty(config)?;
            std::fs::write(&self.path, content)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut loader = ConfigFileLoader::new(&path);
        let config = loader.load_config().unwrap();
        assert_eq!(config.backend, Backend::Host);
        assert!(path.exists());

        config.width = 32;
        loader.save_config().unwrap();
        let mut reloaded = ConfigFileLoader::new(&path);
        assert_eq!(reloaded.get_or_load_config().unwrap().width, 32);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: Config = r#"{ "technique": "path_trace", "scene": "cornell_box" }"#
            .parse()
            .unwrap();
        assert_eq!(config.technique, TechniqueKind::PathTrace);
        assert_eq!(config.scene, SceneKind::CornellBox);
        assert_eq!(config.width, Config::default().width);
    }

    #[test]
    fn malformed_config_is_a_configuration_error() {
        let err = "{ nope".parse::<Config>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
