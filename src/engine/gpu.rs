//! GPU derivation back-end on wgpu (Vulkan / Metal / DX12 / GL).
//!
//! The host computes the base point `s·G` once per batch and uploads its
//! affine coordinates; the device grid adds `i·G` per work item and writes
//! untagged 64-byte coordinate pairs, which the host re-tags on read-back.
//! A back-end owns its device context exclusively; there is no cancellation
//! of an enqueued grid, the whole dispatch runs to completion.

use std::sync::Arc;

use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::error::{FinderError, Result};
use crate::pubkey::PublicKeyBytes;
use crate::scalar::{Scalar256, INVALID_SCALAR_REPLACEMENT};

use super::DeriveBackend;

const SHADER_SOURCE: &str = include_str!("shaders/secp256k1.wgsl");
const WORKGROUP_SIZE: u32 = 64;
const LIMBS_PER_KEY: usize = 16;
const BYTES_PER_KEY: u64 = 64;

/// One enumerable compute device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub max_buffer_bytes: u64,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} [{} / {}], max buffer {} MiB",
            self.index,
            self.name,
            self.backend,
            self.device_type,
            self.max_buffer_bytes / (1024 * 1024)
        )
    }
}

/// Enumerates compute adapters in the priority order the back-end would
/// pick them (discrete first, software renderers last).
pub fn list_devices() -> Vec<DeviceInfo> {
    pollster::block_on(async {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapters = sorted_adapters(&instance).await;
        adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| {
                let info = adapter.get_info();
                DeviceInfo {
                    index,
                    name: info.name.clone(),
                    backend: format!("{:?}", info.backend),
                    device_type: format!("{:?}", info.device_type),
                    max_buffer_bytes: adapter.limits().max_buffer_size,
                }
            })
            .collect()
    })
}

async fn sorted_adapters(instance: &wgpu::Instance) -> Vec<wgpu::Adapter> {
    let mut adapters: Vec<_> = instance.enumerate_adapters(wgpu::Backends::all()).await;
    adapters.sort_by_key(|adapter| {
        let info = adapter.get_info();
        let device_priority = match info.device_type {
            wgpu::DeviceType::DiscreteGpu => 0,
            wgpu::DeviceType::VirtualGpu => 1,
            wgpu::DeviceType::IntegratedGpu => 2,
            wgpu::DeviceType::Cpu => 3,
            _ => 4,
        };
        let backend_priority = match info.backend {
            wgpu::Backend::Vulkan => 0,
            wgpu::Backend::Metal => 1,
            wgpu::Backend::Dx12 => 2,
            wgpu::Backend::Gl => 3,
            _ => 4,
        };
        (device_priority, backend_priority)
    });
    adapters
}

pub struct GpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    base_buffer: wgpu::Buffer,
    out_buffer: wgpu::Buffer,
    staging_buffer: wgpu::Buffer,
    capacity_keys: u64,
    device_name: String,
}

impl GpuBackend {
    /// Opens device `device_index` and sizes the coordinate buffers for
    /// grids up to `grid_bits`. Fails when no adapter exists or the grid
    /// does not fit the device's buffer limits.
    pub fn new(device_index: u32, grid_bits: u32) -> Result<Self> {
        pollster::block_on(Self::new_async(device_index, grid_bits))
    }

    async fn new_async(device_index: u32, grid_bits: u32) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapters = sorted_adapters(&instance).await;
        let adapter = adapters
            .into_iter()
            .nth(device_index as usize)
            .ok_or_else(|| FinderError::Gpu(format!("no adapter at index {device_index}")))?;
        let adapter_info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("keygrid-derive"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            })
            .await
            .map_err(|e| FinderError::Gpu(format!("device request failed: {e}")))?;

        let limits = device.limits();
        // the self-test dispatches small grids into the same buffers, so
        // capacity covers at least one full workgroup
        let capacity_keys = (1u64 << grid_bits).max(WORKGROUP_SIZE as u64);
        let out_bytes = capacity_keys * BYTES_PER_KEY;
        let max_binding =
            (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        if out_bytes > max_binding {
            return Err(FinderError::Gpu(format!(
                "grid bits {grid_bits} needs {out_bytes} bytes, device '{}' allows {max_binding}",
                adapter_info.name
            )));
        }

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("secp256k1 grid"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("derive bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("derive pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("derive pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("derive_grid"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let base_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("base point"),
            contents: bytemuck::cast_slice(&[0u32; LIMBS_PER_KEY]),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        });
        let out_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("coordinates"),
            size: out_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("coordinates staging"),
            size: out_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("derive bind group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: base_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: out_buffer.as_entire_binding(),
                },
            ],
        });

        info!(
            "GPU backend on '{}' ({:?}), {} keys per grid",
            adapter_info.name,
            adapter_info.backend,
            1u64 << grid_bits
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            pipeline,
            bind_group,
            base_buffer,
            out_buffer,
            staging_buffer,
            capacity_keys,
            device_name: adapter_info.name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// x then y, 8 little-endian u32 limbs each, least significant first.
    fn base_point_limbs(key: &PublicKeyBytes) -> [u32; LIMBS_PER_KEY] {
        let mut limbs = [0u32; LIMBS_PER_KEY];
        for (i, limb) in limbs.iter_mut().take(8).enumerate() {
            let offset = 32 - 4 * (i + 1);
            *limb = u32::from_be_bytes(
                key.x()[offset..offset + 4]
                    .try_into()
                    .expect("coordinate slice is 4 bytes"),
            );
        }
        for (i, limb) in limbs.iter_mut().skip(8).enumerate() {
            let offset = 32 - 4 * (i + 1);
            *limb = u32::from_be_bytes(
                key.y()[offset..offset + 4]
                    .try_into()
                    .expect("coordinate slice is 4 bytes"),
            );
        }
        limbs
    }

    fn key_from_limbs(words: &[u32]) -> PublicKeyBytes {
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        for i in 0..8 {
            let offset = 32 - 4 * (i + 1);
            x[offset..offset + 4].copy_from_slice(&words[i].to_be_bytes());
            y[offset..offset + 4].copy_from_slice(&words[8 + i].to_be_bytes());
        }
        PublicKeyBytes::from_coordinates(&x, &y)
    }

    fn read_back(&self, count: u64) -> Result<Vec<u32>> {
        let bytes = count * BYTES_PER_KEY;
        let slice = self.staging_buffer.slice(0..bytes);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| FinderError::Gpu(format!("device poll failed: {e:?}")))?;
        pollster::block_on(rx)
            .map_err(|_| FinderError::Gpu("read-back channel dropped".into()))?
            .map_err(|e| FinderError::Gpu(format!("buffer map failed: {e:?}")))?;

        let data = slice.get_mapped_range();
        let words: Vec<u32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        self.staging_buffer.unmap();
        Ok(words)
    }
}

impl DeriveBackend for GpuBackend {
    fn name(&self) -> &str {
        "gpu"
    }

    fn derive_grid(&mut self, base: Scalar256, bits: u32) -> Result<Vec<PublicKeyBytes>> {
        let count = 1u64 << bits;
        if count > self.capacity_keys {
            return Err(FinderError::Gpu(format!(
                "grid of 2^{bits} keys exceeds the configured capacity of {}",
                self.capacity_keys
            )));
        }

        let base_key = PublicKeyBytes::from_scalar(&base)?;
        let limbs = Self::base_point_limbs(&base_key);
        self.queue
            .write_buffer(&self.base_buffer, 0, bytemuck::cast_slice(&limbs));

        let workgroups = (count as u32).div_ceil(WORKGROUP_SIZE);
        let wg_x = workgroups.clamp(1, 0xFFFF);
        let wg_y = workgroups.div_ceil(wg_x);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("derive encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("derive pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(wg_x, wg_y, 1);
        }
        encoder.copy_buffer_to_buffer(
            &self.out_buffer,
            0,
            &self.staging_buffer,
            0,
            count * BYTES_PER_KEY,
        );
        self.queue.submit(Some(encoder.finish()));

        let words = self.read_back(count)?;
        debug!(
            "GPU '{}' derived 2^{bits} keys from base {}",
            self.device_name,
            base.to_hex()
        );
        let mut keys: Vec<PublicKeyBytes> = words
            .chunks_exact(LIMBS_PER_KEY)
            .map(Self::key_from_limbs)
            .collect();

        // implied scalars past the group order get the fixed substitute;
        // the device cannot see the crossing, only the host knows the base
        let valid = base.valid_span(count) as usize;
        if valid < keys.len() {
            let substitute =
                PublicKeyBytes::from_scalar(&Scalar256::from_u64(INVALID_SCALAR_REPLACEMENT))?;
            for key in keys.iter_mut().skip(valid) {
                *key = substitute;
            }
        }
        Ok(keys)
    }
}
