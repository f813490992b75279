//! GPU backend against the CPU reference. Skipped when no adapter is available.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use shlight_estimator::{
    CpuBackend, FrameTensor, GpuBackend, Layer, Model, ModelBackend, ReadbackCompletion,
    ReadbackMessage, TensorShape,
};

fn device() -> Option<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::default();
    let adapter =
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
    pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None)).ok()
}

fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|i| ((i * 7 % 13) as f32 - 6.0) * scale).collect()
}

fn conv_model() -> Model {
    let layers = vec![
        Layer::Conv2d {
            in_channels: 3,
            out_channels: 4,
            kernel: 3,
            stride: 2,
            padding: 1,
            weights: ramp(4 * 3 * 9, 0.05),
            bias: ramp(4, 0.1),
        },
        Layer::BatchNorm { scale: vec![1.0, 0.5, 2.0, -1.0], shift: vec![0.1, 0.0, -0.2, 0.3] },
        Layer::Relu,
        Layer::MaxPool2d { kernel: 3, stride: 2, padding: 1 },
        Layer::AvgPool2d { kernel: [2, 1], stride: [1, 1] },
        Layer::GlobalAvgPool,
        Layer::Linear {
            in_features: 4,
            out_features: 27,
            weights: ramp(4 * 27, 0.2),
            bias: ramp(27, 0.01),
        },
    ];
    Model::new(TensorShape::new(3, 10, 12), layers).unwrap()
}

fn run(backend: &mut dyn ModelBackend, input: &FrameTensor, quota: usize) -> Vec<f32> {
    let owner = Arc::new(());
    let (tx, rx) = mpsc::channel::<ReadbackMessage>();
    backend.bind_input(input).unwrap();
    while backend.step(quota).unwrap() > 0 {}
    backend.request_readback(ReadbackCompletion::new(1, &owner, tx)).unwrap();
    for _ in 0..2000 {
        backend.poll_device().unwrap();
        if let Ok(message) = rx.try_recv() {
            assert_eq!(message.cycle, 1);
            return message.result.unwrap();
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("readback never completed");
}

#[test]
fn gpu_matches_cpu_reference() {
    let Some((device, queue)) = device() else {
        eprintln!("no wgpu adapter; skipping");
        return;
    };
    let model = conv_model();
    let input =
        FrameTensor::from_chw(12, 10, ramp(3 * 10 * 12, 0.08).iter().map(|v| v.abs()).collect())
            .unwrap();

    let mut cpu = CpuBackend::new(model.clone());
    let expected = run(&mut cpu, &input, 100);

    let mut gpu = GpuBackend::new(device, queue, &model).unwrap();
    assert_eq!(gpu.total_units(), 7);
    let actual = run(&mut gpu, &input, 2);

    assert_eq!(actual.len(), 27);
    for (a, e) in actual.iter().zip(&expected) {
        assert!((a - e).abs() <= 1e-4 * e.abs().max(1.0), "gpu {a} vs cpu {e}");
    }
    gpu.dispose();
    gpu.dispose();
}

#[test]
fn quadrant_projector_runs_on_gpu() {
    let Some((device, queue)) = device() else {
        eprintln!("no wgpu adapter; skipping");
        return;
    };
    let model = Model::quadrant_projector(64, 48).unwrap();
    let input = FrameTensor::from_chw(64, 48, vec![1.0; 3 * 64 * 48]).unwrap();
    let mut gpu = GpuBackend::new(device, queue, &model).unwrap();
    let out = run(&mut gpu, &input, 1);
    // uniform white: band 0 evaluates back to 1, the grid is symmetric in x and y
    assert!((out[0] * 0.282095 - 1.0).abs() < 1e-3);
    assert!(out[3].abs() < 1e-4 && out[9].abs() < 1e-4);
}

#[test]
fn dispose_with_map_pending_fires_nothing() {
    let Some((device, queue)) = device() else {
        eprintln!("no wgpu adapter; skipping");
        return;
    };
    let model = Model::quadrant_projector(16, 8).unwrap();
    let input = FrameTensor::from_chw(16, 8, vec![0.5; 3 * 16 * 8]).unwrap();
    let mut gpu = GpuBackend::new(device, queue, &model).unwrap();

    let owner = Arc::new(());
    let (tx, rx) = mpsc::channel::<ReadbackMessage>();
    gpu.bind_input(&input).unwrap();
    while gpu.step(8).unwrap() > 0 {}
    gpu.request_readback(ReadbackCompletion::new(1, &owner, tx)).unwrap();
    assert!(gpu.has_pending_readback());

    gpu.dispose();
    assert!(!gpu.has_pending_readback());
    // let the map callback run against the destroyed staging buffer
    let _ = gpu.device().poll(wgpu::Maintain::Wait);
    assert!(rx.try_recv().is_err());
    assert!(gpu.poll_device().is_err());
}
