//! wgpu backend: one compute dispatch per layer, every activation in its own storage buffer,
//! uniforms and bind groups built once at load. Readback copies the 27 outputs into a staging
//! buffer and maps it asynchronously; `poll_device` drives the map without waiting.

use std::num::NonZeroU64;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;

use log::{debug, info, warn};
use wgpu::util::DeviceExt;

use super::{ModelBackend, ReadbackCompletion};
use crate::error::{EstimatorError, Result};
use crate::frame::FrameTensor;
use crate::model::{Layer, Model, TensorShape};

const LAYERS_SHADER: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/layers.wgsl"));

const WORKGROUP_SIZE: u32 = 64;
const MAX_GROUPS_PER_DIM: u32 = 65_535;
const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

#[repr(C)]
#[derive(Copy, Clone, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct LayerParams {
    in_c: u32,
    in_h: u32,
    in_w: u32,
    out_c: u32,
    out_h: u32,
    out_w: u32,
    kernel_h: u32,
    kernel_w: u32,
    stride_h: u32,
    stride_w: u32,
    pad_h: u32,
    pad_w: u32,
    has_bias: u32,
    _pad: [u32; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kernel {
    Conv2d,
    BatchNorm,
    Relu,
    MaxPool,
    AvgPool,
    Linear,
}

impl Kernel {
    const ALL: [Kernel; 6] = [
        Kernel::Conv2d,
        Kernel::BatchNorm,
        Kernel::Relu,
        Kernel::MaxPool,
        Kernel::AvgPool,
        Kernel::Linear,
    ];

    fn entry_point(self) -> &'static str {
        match self {
            Kernel::Conv2d => "conv2d",
            Kernel::BatchNorm => "batch_norm",
            Kernel::Relu => "relu",
            Kernel::MaxPool => "max_pool",
            Kernel::AvgPool => "avg_pool",
            Kernel::Linear => "linear",
        }
    }
}

/// Kernel choice, uniform contents and parameter arrays for one layer.
fn lower_layer<'a>(
    layer: &'a Layer,
    input: TensorShape,
    output: TensorShape,
) -> (Kernel, LayerParams, &'a [f32], &'a [f32]) {
    let mut params = LayerParams {
        in_c: input.channels as u32,
        in_h: input.height as u32,
        in_w: input.width as u32,
        out_c: output.channels as u32,
        out_h: output.height as u32,
        out_w: output.width as u32,
        ..Default::default()
    };
    const NONE: &[f32] = &[];
    type Lowered<'a> = (Kernel, Option<[usize; 5]>, &'a [f32], &'a [f32]);
    // (kernel_h, kernel_w, stride_h, stride_w, padding)
    let (kernel, window, weights, bias): Lowered<'_> = match layer {
        Layer::Conv2d { kernel, stride, padding, weights, bias, .. } => {
            (
                Kernel::Conv2d,
                Some([*kernel, *kernel, *stride, *stride, *padding]),
                weights.as_slice(),
                bias.as_slice(),
            )
        }
        Layer::BatchNorm { scale, shift } => {
            (Kernel::BatchNorm, None, scale.as_slice(), shift.as_slice())
        }
        Layer::Relu => (Kernel::Relu, None, NONE, NONE),
        Layer::MaxPool2d { kernel, stride, padding } => {
            (Kernel::MaxPool, Some([*kernel, *kernel, *stride, *stride, *padding]), NONE, NONE)
        }
        Layer::AvgPool2d { kernel, stride } => {
            (Kernel::AvgPool, Some([kernel[0], kernel[1], stride[0], stride[1], 0]), NONE, NONE)
        }
        Layer::GlobalAvgPool => {
            (Kernel::AvgPool, Some([input.height, input.width, 1, 1, 0]), NONE, NONE)
        }
        Layer::Linear { in_features, weights, bias, .. } => {
            params.in_c = *in_features as u32;
            params.in_h = 1;
            params.in_w = 1;
            (Kernel::Linear, None, weights.as_slice(), bias.as_slice())
        }
    };
    if let Some([kh, kw, sh, sw, pad]) = window {
        params.kernel_h = kh as u32;
        params.kernel_w = kw as u32;
        params.stride_h = sh as u32;
        params.stride_w = sw as u32;
        params.pad_h = pad as u32;
        params.pad_w = pad as u32;
    }
    params.has_bias = u32::from(!bias.is_empty());
    (kernel, params, weights, bias)
}

/// Workgroup grid for `elements` invocations, folding into Y past the per-dimension limit.
fn dispatch_size(elements: usize) -> (u32, u32) {
    let groups = (elements as u32).div_ceil(WORKGROUP_SIZE).max(1);
    if groups <= MAX_GROUPS_PER_DIM {
        (groups, 1)
    } else {
        (MAX_GROUPS_PER_DIM, groups.div_ceil(MAX_GROUPS_PER_DIM))
    }
}

struct LayerDispatch {
    kernel: Kernel,
    bind_group: wgpu::BindGroup,
    groups: (u32, u32),
}

struct InFlightReadback {
    completion: ReadbackCompletion,
    mapped: Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Vec<wgpu::ComputePipeline>,
    dispatches: Vec<LayerDispatch>,
    input_shape: TensorShape,
    input: wgpu::Buffer,
    /// Output of the last layer.
    output: wgpu::Buffer,
    staging: wgpu::Buffer,
    /// Every other allocation, kept for explicit destruction.
    owned: Vec<wgpu::Buffer>,
    output_bytes: u64,
    next_unit: usize,
    bound: bool,
    in_flight: Option<InFlightReadback>,
    /// Map callbacks hold a weak handle; replaced on dispose.
    liveness: Arc<()>,
    disposed: bool,
}

impl GpuBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, model: &Model) -> Result<Self> {
        let limit = u64::from(device.limits().max_storage_buffer_binding_size);
        let largest = model.max_activation_len() as u64 * F32_BYTES;
        if largest > limit {
            return Err(EstimatorError::Backend(format!(
                "largest activation needs {largest} bytes, device allows {limit} per binding"
            )));
        }

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("sh_layers_shader"),
            source: wgpu::ShaderSource::Wgsl(LAYERS_SHADER.into()),
        });
        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("sh_layer_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: NonZeroU64::new(
                            std::mem::size_of::<LayerParams>() as u64,
                        ),
                    },
                    count: None,
                },
                storage(1, true),
                storage(2, false),
                storage(3, true),
                storage(4, true),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("sh_layer_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipelines = Kernel::ALL
            .iter()
            .map(|kernel| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.entry_point()),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: Some(kernel.entry_point()),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .collect();

        let input_shape = model.input_shape();
        let input = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sh_input"),
            size: input_shape.len() as u64 * F32_BYTES,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        // Stands in for absent weight or bias arrays; storage bindings cannot be empty.
        let placeholder = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sh_placeholder"),
            size: F32_BYTES,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let mut owned = Vec::new();
        let mut activations: Vec<wgpu::Buffer> = Vec::with_capacity(model.unit_count());
        let mut dispatches = Vec::with_capacity(model.unit_count());
        for (index, layer) in model.layers().iter().enumerate() {
            let in_shape = model.shape_before(index);
            let out_shape = model.shape_after(index);
            let (kernel, params, weights, bias) = lower_layer(layer, in_shape, out_shape);

            let activation = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("sh_activation_{index}")),
                size: out_shape.len() as u64 * F32_BYTES,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("sh_params_{index}")),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let upload = |label: String, data: &[f32]| {
                (!data.is_empty()).then(|| {
                    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(&label),
                        contents: bytemuck::cast_slice(data),
                        usage: wgpu::BufferUsages::STORAGE,
                    })
                })
            };
            let weight_buf = upload(format!("sh_weights_{index}"), weights);
            let bias_buf = upload(format!("sh_bias_{index}"), bias);

            let src = if index == 0 { &input } else { &activations[index - 1] };
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("sh_layer_{index}_bind_group")),
                layout: &bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: uniform.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: src.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 2, resource: activation.as_entire_binding() },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: weight_buf.as_ref().unwrap_or(&placeholder).as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: bias_buf.as_ref().unwrap_or(&placeholder).as_entire_binding(),
                    },
                ],
            });
            dispatches.push(LayerDispatch {
                kernel,
                bind_group,
                groups: dispatch_size(out_shape.len()),
            });
            owned.push(uniform);
            owned.extend(weight_buf);
            owned.extend(bias_buf);
            activations.push(activation);
        }
        owned.push(placeholder);

        // Model::new guarantees at least one layer.
        let output = activations
            .pop()
            .ok_or_else(|| EstimatorError::Backend("model has no layers".to_string()))?;
        owned.extend(activations);

        let output_bytes = model.output_len() as u64 * F32_BYTES;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sh_readback_staging"),
            size: output_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        info!(
            "gpu backend: {} layers, input {:?}, {} buffers",
            model.unit_count(),
            input_shape,
            owned.len() + 3
        );
        Ok(Self {
            device,
            queue,
            pipelines,
            dispatches,
            input_shape,
            input,
            output,
            staging,
            owned,
            output_bytes,
            next_unit: 0,
            bound: false,
            in_flight: None,
            liveness: Arc::new(()),
            disposed: false,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn has_pending_readback(&self) -> bool {
        self.in_flight.is_some()
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(EstimatorError::TornDown);
        }
        Ok(())
    }

    fn pipeline(&self, kernel: Kernel) -> &wgpu::ComputePipeline {
        // ALL and `pipelines` share ordering.
        let slot = Kernel::ALL.iter().position(|k| *k == kernel).unwrap_or(0);
        &self.pipelines[slot]
    }

    fn finish_map(
        &mut self,
        in_flight: InFlightReadback,
        mapped: std::result::Result<(), wgpu::BufferAsyncError>,
    ) {
        let result = match mapped {
            Ok(()) => {
                let values = {
                    let view = self.staging.slice(..).get_mapped_range();
                    bytemuck::cast_slice::<u8, f32>(&view).to_vec()
                };
                self.staging.unmap();
                Ok(values)
            }
            Err(e) => Err(EstimatorError::Backend(format!("readback map failed: {e}"))),
        };
        let cycle = in_flight.completion.cycle();
        if !in_flight.completion.complete(result) {
            debug!("gpu backend: readback for cycle {cycle} had no live owner");
        }
    }
}

impl ModelBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn input_shape(&self) -> TensorShape {
        self.input_shape
    }

    fn total_units(&self) -> usize {
        self.dispatches.len()
    }

    fn bind_input(&mut self, input: &FrameTensor) -> Result<()> {
        self.check_live()?;
        if input.shape() != self.input_shape {
            return Err(EstimatorError::Conversion(format!(
                "input tensor {:?} does not match model input {:?}",
                input.shape(),
                self.input_shape
            )));
        }
        self.queue.write_buffer(&self.input, 0, bytemuck::cast_slice(input.as_slice()));
        self.next_unit = 0;
        self.bound = true;
        Ok(())
    }

    fn step(&mut self, budget: usize) -> Result<usize> {
        self.check_live()?;
        if !self.bound {
            return Err(EstimatorError::Backend("step called without a bound input".to_string()));
        }
        let end = (self.next_unit + budget).min(self.dispatches.len());
        if end == self.next_unit {
            return Ok(0);
        }
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("sh_layers_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("sh_layers_pass"),
                timestamp_writes: None,
            });
            for dispatch in &self.dispatches[self.next_unit..end] {
                pass.set_pipeline(self.pipeline(dispatch.kernel));
                pass.set_bind_group(0, &dispatch.bind_group, &[]);
                pass.dispatch_workgroups(dispatch.groups.0, dispatch.groups.1, 1);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        let ran = end - self.next_unit;
        self.next_unit = end;
        Ok(ran)
    }

    fn request_readback(&mut self, completion: ReadbackCompletion) -> Result<()> {
        self.check_live()?;
        if !self.bound || self.next_unit < self.dispatches.len() {
            return Err(EstimatorError::Backend(format!(
                "readback requested after {}/{} units",
                self.next_unit,
                self.dispatches.len()
            )));
        }
        if self.in_flight.is_some() {
            return Err(EstimatorError::Busy);
        }
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("sh_readback_encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.output, 0, &self.staging, 0, self.output_bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        let alive = Arc::downgrade(&self.liveness);
        self.staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            if alive.strong_count() > 0 {
                let _ = tx.send(result);
            }
        });
        self.in_flight = Some(InFlightReadback { completion, mapped: rx });
        self.bound = false;
        Ok(())
    }

    fn poll_device(&mut self) -> Result<()> {
        self.check_live()?;
        let _ = self.device.poll(wgpu::Maintain::Poll);
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(());
        };
        match in_flight.mapped.try_recv() {
            Ok(mapped) => self.finish_map(in_flight, mapped),
            Err(TryRecvError::Empty) => self.in_flight = Some(in_flight),
            Err(TryRecvError::Disconnected) => {
                warn!("gpu backend: map callback dropped without reporting");
                in_flight
                    .completion
                    .complete(Err(EstimatorError::Backend(
                        "readback map was cancelled".to_string(),
                    )));
            }
        }
        Ok(())
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.liveness = Arc::new(());
        self.in_flight = None;
        self.dispatches.clear();
        for buffer in self.owned.drain(..) {
            buffer.destroy();
        }
        self.input.destroy();
        self.output.destroy();
        self.staging.destroy();
        self.bound = false;
        self.disposed = true;
        debug!("gpu backend disposed");
    }
}

impl Drop for GpuBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_folds_into_second_dimension() {
        assert_eq!(dispatch_size(1), (1, 1));
        assert_eq!(dispatch_size(64), (1, 1));
        assert_eq!(dispatch_size(65), (2, 1));
        let (x, y) = dispatch_size(3 * 512 * 640 * 8);
        assert_eq!(x, MAX_GROUPS_PER_DIM);
        assert!(x as usize * y as usize * WORKGROUP_SIZE as usize >= 3 * 512 * 640 * 8);
    }

    #[test]
    fn global_pool_lowers_to_full_plane_window() {
        let input = TensorShape::new(3, 5, 7);
        let (kernel, params, weights, _) =
            lower_layer(&Layer::GlobalAvgPool, input, TensorShape::new(3, 1, 1));
        assert_eq!(kernel, Kernel::AvgPool);
        assert_eq!((params.kernel_h, params.kernel_w), (5, 7));
        assert!(weights.is_empty());
    }

    #[test]
    fn linear_lowers_feature_count_into_channels() {
        let layer = Layer::Linear {
            in_features: 12,
            out_features: 27,
            weights: vec![0.0; 12 * 27],
            bias: vec![],
        };
        let (kernel, params, _, bias) =
            lower_layer(&layer, TensorShape::new(3, 2, 2), TensorShape::new(27, 1, 1));
        assert_eq!(kernel, Kernel::Linear);
        assert_eq!((params.in_c, params.in_h, params.in_w), (12, 1, 1));
        assert_eq!(params.has_bias, 0);
        assert!(bias.is_empty());
    }
}
