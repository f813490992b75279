//! Estimate ambient SH and the dominant light from still images.
//! Run from repo root: cargo run -p debug --bin estimate_image -- photo.jpg [more.png ...]
//! Options: --model <model.json> (default: built-in quadrant projector),
//!          --config <config.json>, --gpu

use std::path::{Path, PathBuf};

use light_api::{CameraSource, ExtractedLighting, PixelFormat, RawImage};
use shlight_estimator::{
    load_config, CpuBackend, EstimatorConfig, GpuBackend, Model, ModelBackend, PipelineController,
    TickOutcome,
};

/// Plays the loaded images in order, then keeps serving the last one.
struct Slideshow {
    frames: Vec<RawImage>,
    next: usize,
}

impl CameraSource for Slideshow {
    fn try_acquire_latest_frame(&mut self) -> Option<RawImage> {
        let frame = self.frames.get(self.next).or_else(|| self.frames.last())?.clone();
        self.next += 1;
        Some(frame)
    }
}

fn load_image_rgba(path: &Path) -> Result<RawImage, String> {
    let img = image::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(RawImage { width, height, format: PixelFormat::Rgba8, data: rgba.into_raw() })
}

struct Args {
    images: Vec<PathBuf>,
    model: Option<PathBuf>,
    config: Option<PathBuf>,
    gpu: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args { images: Vec::new(), model: None, config: None, gpu: false };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--model" => args.model = Some(it.next().ok_or("--model needs a path")?.into()),
            "--config" => args.config = Some(it.next().ok_or("--config needs a path")?.into()),
            "--gpu" => args.gpu = true,
            _ => args.images.push(arg.into()),
        }
    }
    if args.images.is_empty() {
        return Err(
            "usage: estimate_image [--model m.json] [--config c.json] [--gpu] <image>...".into(),
        );
    }
    Ok(args)
}

fn run<B: ModelBackend>(
    backend: B,
    config: EstimatorConfig,
    camera: Slideshow,
    frames: usize,
) -> Result<(), String> {
    // every image gets a cycle, then enough repeats of the last to fill the history
    let cycles = (frames + config.history_size) as u64;
    let mut controller =
        PipelineController::new(config, Box::new(camera), backend, ExtractedLighting::new())
            .map_err(|e| e.to_string())?;
    let mut ticks = 0u64;
    while controller.stats().cycles_completed < cycles {
        match controller.tick() {
            TickOutcome::Disabled => return Err("estimator disabled (see log)".to_string()),
            TickOutcome::Applied(Some(light)) => {
                println!(
                    "cycle {}: source {:.3?} color {:.3?} intensity {:.3}",
                    controller.stats().cycles_completed,
                    light.source_direction.to_array(),
                    light.color.to_array(),
                    light.intensity
                );
            }
            _ => {}
        }
        ticks += 1;
        if ticks > cycles * 10_000 {
            return Err("readback never completed".to_string());
        }
    }

    let stats = controller.stats();
    println!(
        "{} cycles in {} ticks, last cycle {} ticks / {:?}, {} discarded",
        stats.cycles_completed,
        ticks,
        stats.last_cycle_ticks,
        stats.last_cycle_duration,
        stats.outputs_discarded
    );
    let lighting = controller.sink();
    if let Some(probe) = lighting.ambient.as_ref() {
        for (name, bands) in ["R", "G", "B"].iter().zip(probe.coefficients.iter()) {
            println!("  {name}: {bands:.4?}");
        }
    }
    match lighting.directional.as_ref() {
        Some(light) => println!(
            "directional: direction {:.3?} rotation {:.3?} intensity {:.3}",
            light.direction, light.rotation, light.intensity
        ),
        None => println!("directional: none (no dominant direction)"),
    }
    Ok(())
}

fn main() -> Result<(), String> {
    env_logger::init();
    let args = parse_args()?;

    let frames = args.images.iter().map(|p| load_image_rgba(p)).collect::<Result<Vec<_>, _>>()?;
    let config = match args.config.as_deref() {
        Some(path) => load_config(path).map_err(|e| e.to_string())?,
        None => EstimatorConfig::default(),
    };
    let model = match args.model.as_deref() {
        Some(path) => Model::load(path).map_err(|e| e.to_string())?,
        None => Model::quadrant_projector(config.target_width, config.target_height)
            .map_err(|e| e.to_string())?,
    };
    let count = frames.len();
    let camera = Slideshow { frames, next: 0 };

    if args.gpu {
        let (device, queue) = shlight_bridge::request_device()?;
        let backend = GpuBackend::new(device, queue, &model).map_err(|e| e.to_string())?;
        run(backend, config, camera, count)
    } else {
        run(CpuBackend::new(model), config, camera, count)
    }
}
