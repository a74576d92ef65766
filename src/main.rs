use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use frame_tracer::{
    camera::{orbit_controller::OrbitController, Camera, CameraSettings},
    config_loader::{Backend, Config, ConfigFileLoader},
    host::{HostDevice, HostDeviceConfig, HostIntersector},
    render::shader_types::unpack_color,
    time::FrameTimer,
    vulkan::{VulkanDevice, VulkanIntersector},
    ComputeDevice, ErrorKind, IntersectionEngine, Technique, TraceContext,
};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".into());
    let mut config_loader = ConfigFileLoader::new(&config_path);
    let config = config_loader
        .load_config()
        .with_context(|| format!("Could not load {}", config_path))?
        .clone();
    log::info!(
        "Rendering {:?} with {:?} at {}x{} on the {:?} backend",
        config.scene,
        config.technique,
        config.width,
        config.height,
        config.backend
    );

    match config.backend {
        Backend::Host => {
            let device = Arc::new(HostDevice::new(HostDeviceConfig {
                completion_delay: std::time::Duration::from_millis(config.host_completion_delay_ms),
                ..HostDeviceConfig::default()
            }));
            run(device, Arc::new(HostIntersector::default()), &config)
        }
        Backend::Vulkan => {
            let device = Arc::new(
                VulkanDevice::new(&config.shader_dir)
                    .context("Could not create the Vulkan device")?,
            );
            let engine = Arc::new(
                VulkanIntersector::new(device.clone())
                    .context("Could not create the ray query pipeline")?,
            );
            run(device, engine, &config)
        }
    }
}

fn run<D: ComputeDevice, E: IntersectionEngine<D>>(
    device: Arc<D>,
    engine: Arc<E>,
    config: &Config,
) -> anyhow::Result<()> {
    let scene = config.scene.build();
    let mut context = TraceContext::init(
        device,
        engine,
        &scene,
        config.num_rays(),
        Technique::new(config.technique),
        config.frame_settings(),
    )
    .context("Could not initialize the frame pipeline")?;

    let (target, distance) = config.scene.framing();
    let mut orbit = OrbitController::new(target, distance, 1.0);
    let mut camera = Camera::new(CameraSettings::default());
    let mut timer = FrameTimer::new();
    let mut color = Vec::new();

    for frame in 0..config.frames {
        orbit.rotate(-config.orbit_spin, 0.0);
        camera.update_camera(&orbit);
        let params = camera.view_params(config.width, config.height, config.ao_radius);
        let params = context.update_view(params)?;

        match context.submit() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::SubmissionFailure => {
                log::warn!("Dropped frame {}: {}", frame, err);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
        color = context.color()?;
        timer.update();
        log::debug!(
            "Frame {} (sample {}) took {:?}",
            frame,
            params.sample_index(),
            timer.delta()
        );
    }

    let lit = color.iter().filter(|&&pixel| pixel & 0x00FF_FFFF != 0).count();
    log::info!(
        "Rendered {} frames, {:?} on average, {} of {} pixels lit",
        timer.frames(),
        timer.average(),
        lit,
        color.len()
    );

    if let Some(output) = &config.output {
        save_png(output, config.width, config.height, &color)?;
        log::info!("Wrote {}", output.display());
    }
    Ok(())
}

fn save_png(path: &Path, width: u32, height: u32, color: &[u32]) -> anyhow::Result<()> {
    let mut image = image::RgbImage::new(width, height);
    for (pixel, packed) in image.pixels_mut().zip(color) {
        let rgb = unpack_color(*packed) * 255.0;
        *pixel = image::Rgb([rgb.x.round() as u8, rgb.y.round() as u8, rgb.z.round() as u8]);
    }
    image.save(path).with_context(|| format!("Could not write {}", path.display()))?;
    Ok(())
}
