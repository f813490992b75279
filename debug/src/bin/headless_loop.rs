//! Headless host loop: drive the boxed LightEstimator with a synthetic camera.
//! A bright patch sweeps left to right; the estimated light should follow it.
//! Run from repo root: cargo run -p debug --bin headless_loop -- [ticks]

use light_api::{CameraSource, PixelFormat, RawImage};
use log::info;
use shlight_estimator::{EstimatorConfig, Model};

const WIDTH: u32 = 128;
const HEIGHT: u32 = 96;

/// Dim room with one bright patch in the upper half; the patch moves every `hold` frames.
struct SweepingLamp {
    frame: u32,
    hold: u32,
}

impl CameraSource for SweepingLamp {
    fn try_acquire_latest_frame(&mut self) -> Option<RawImage> {
        self.frame += 1;
        // every other tick the camera has nothing new
        if self.frame % 2 == 0 {
            return None;
        }
        let step = (self.frame / self.hold) % 4;
        let x0 = step * WIDTH / 4;
        let mut data = Vec::with_capacity(PixelFormat::Rgb8.byte_len(WIDTH, HEIGHT));
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let lit = y < HEIGHT / 3 && x >= x0 && x < x0 + WIDTH / 4;
                let px = if lit { [255, 240, 210] } else { [24, 24, 28] };
                data.extend_from_slice(&px);
            }
        }
        Some(RawImage { width: WIDTH, height: HEIGHT, format: PixelFormat::Rgb8, data })
    }
}

fn main() -> Result<(), String> {
    env_logger::init();
    let ticks: u32 = match std::env::args().nth(1) {
        Some(n) => n.parse().map_err(|e| format!("ticks: {e}"))?,
        None => 600,
    };

    let config = EstimatorConfig {
        target_width: WIDTH,
        target_height: HEIGHT,
        layers_per_tick: 2,
        ..Default::default()
    };
    let model = Model::quadrant_projector(WIDTH, HEIGHT).map_err(|e| e.to_string())?;
    let camera = Box::new(SweepingLamp { frame: 0, hold: 120 });
    let mut estimator = shlight_bridge::create_estimator(model, config, camera);

    let mut last_update = 0;
    for tick in 0..ticks {
        estimator.tick()?;
        let lighting = estimator.lighting();
        if lighting.directional_updates != last_update {
            last_update = lighting.directional_updates;
            if let Some((direction, color)) = lighting.directional_light() {
                println!("tick {tick:4}: direction {direction:.3?} color {color:.3?}");
            }
        }
    }
    info!("active after {ticks} ticks: {}", estimator.is_active());
    println!(
        "headless_loop: {} ambient / {} directional updates",
        estimator.lighting().ambient_updates,
        estimator.lighting().directional_updates
    );
    Ok(())
}
