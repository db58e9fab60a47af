pub mod geometry;
pub mod shadows;
pub mod tiles;

use anyhow::{Context, Result};
use glam::Vec4;
use winit::dpi::PhysicalSize;

use crate::config::{CascadeBlend, LightingConfig};
use crate::lights::{
    layer_mask_as_f32, DirectionalLightGpu, LightKind, OtherLightGpu, VisibleLight,
    MAX_DIRECTIONAL_LIGHTS, MAX_OTHER_LIGHTS,
};
use geometry::ShadowGeometry;
use shadows::{ShadowCasterDraw, ShadowPlanner, ShadowRenderParams};
use tiles::{fill_tile_data, TileCullingParams, TileGrid};

pub const SHADOW_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Frame-global lighting constants handed to the shading pass.
///
/// `tile_settings.zw` are bit-cast integers (see [`layer_mask_as_f32`] for
/// the convention); shaders read them back with `bitcast<u32>`.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightingUniform {
    /// x,y: normalized UV size of one tile, z: tiles per row (bit-cast),
    /// w: words per tile (bit-cast).
    pub tile_settings: [f32; 4],
    /// x: 1/max_distance, y: 1/distance_fade, z: cascade fade scale.
    pub distance_fade: [f32; 4],
    /// x,y: directional atlas size and texel, z,w: other atlas.
    pub atlas_sizes: [f32; 4],
    /// x: directional count, y: other count, z: cascade count,
    /// w: shadow mask selector.
    pub counts: [i32; 4],
    /// x: directional filter, y: other filter, z: cascade blend.
    pub selectors: [i32; 4],
}

/// Everything the lighting pass needs from the scene for one frame.
pub struct FrameInputs<'a> {
    pub lights: &'a [VisibleLight],
    /// Lights whose rendering layer mask misses this are skipped entirely.
    pub camera_layer_mask: u32,
    pub viewport: PhysicalSize<u32>,
    pub geometry: &'a dyn ShadowGeometry,
    pub config: &'a LightingConfig,
}

/// Per-frame CPU staging for light records and the tile light lists. The
/// vectors are reused across frames.
#[derive(Default)]
pub struct LightFrame {
    directional: Vec<DirectionalLightGpu>,
    other: Vec<OtherLightGpu>,
    /// Screen rectangles of `other`, same order.
    light_bounds: Vec<Vec4>,
    tile_data: Vec<u32>,
    grid: TileGrid,
    tile_data_size: usize,
    max_lights_per_tile: usize,
}

impl LightFrame {
    fn begin(&mut self) {
        self.directional.clear();
        self.other.clear();
        self.light_bounds.clear();
    }

    /// Sizes the grid and the tile word buffer for this frame. Each tile gets
    /// a count header plus room for `min(cap, visible light count)` indices;
    /// the shrink counts all visible lights, directional included.
    fn begin_tiles(
        &mut self,
        viewport: PhysicalSize<u32>,
        tile_pixel_size: f32,
        cap: usize,
        visible_light_count: usize,
    ) {
        self.grid = TileGrid::new(viewport, tile_pixel_size);
        self.max_lights_per_tile = cap.min(visible_light_count);
        self.tile_data_size = self.max_lights_per_tile + 1;
        self.tile_data.clear();
        self.tile_data.resize(self.grid.tile_count() * self.tile_data_size, 0);
    }
}

/// Counters for the frame that was just prepared.
#[derive(Clone, Copy, Debug, Default)]
pub struct LightingMetrics {
    pub directional_lights: usize,
    pub other_lights: usize,
    pub shadowed_directional_lights: usize,
    pub reserved_other_tiles: usize,
    pub tile_count: usize,
    pub tile_data_size: usize,
}

pub struct LightingPassParams<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub inputs: FrameInputs<'a>,
    pub casters: &'a [ShadowCasterDraw<'a>],
}

/// Forward+ light culling plus shadow atlas rendering for one camera.
///
/// [`LightingPass::prepare`] records the shadow passes into the caller's
/// encoder and uploads every buffer the shading pass samples;
/// [`LightingPass::assemble`] runs the same CPU planning without a device,
/// which is what the integration tests use.
#[derive(Default)]
pub struct LightingPass {
    frame: LightFrame,
    shadows: ShadowPlanner,
    uniform: LightingUniform,
    warned_truncation: bool,

    bind_group_layout: Option<wgpu::BindGroupLayout>,
    bind_group: Option<wgpu::BindGroup>,
    uniform_buffer: Option<wgpu::Buffer>,
    directional_buffer: Option<wgpu::Buffer>,
    other_buffer: Option<wgpu::Buffer>,
    tile_buffer: Option<wgpu::Buffer>,
    tile_buffer_capacity: usize,
}

impl LightingPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reverse_z(&mut self, reverse_z: bool) {
        self.shadows.set_reverse_z(reverse_z);
    }

    /// Builds the per-frame light records and reserves shadow atlas space in
    /// visible-light order. Lights beyond the per-kind caps are dropped.
    fn setup_lights(&mut self, inputs: &FrameInputs<'_>) {
        self.frame.begin();
        self.shadows.begin_frame(&inputs.config.shadows);

        let mut truncated = false;
        for (index, light) in inputs.lights.iter().enumerate() {
            if light.rendering_layer_mask & inputs.camera_layer_mask == 0 {
                continue;
            }
            match light.kind {
                LightKind::Directional => {
                    if self.frame.directional.len() >= MAX_DIRECTIONAL_LIGHTS {
                        truncated = true;
                        continue;
                    }
                    let shadow_data =
                        self.shadows.reserve_directional(index, light, inputs.geometry);
                    self.frame.directional.push(DirectionalLightGpu::new(light, shadow_data));
                }
                LightKind::Point => {
                    if self.frame.other.len() >= MAX_OTHER_LIGHTS {
                        truncated = true;
                        continue;
                    }
                    let shadow_data = self.shadows.reserve_other(index, light, inputs.geometry);
                    self.frame.other.push(OtherLightGpu::point(light, shadow_data));
                    self.frame.light_bounds.push(light.screen_rect);
                }
                LightKind::Spot => {
                    if self.frame.other.len() >= MAX_OTHER_LIGHTS {
                        truncated = true;
                        continue;
                    }
                    let shadow_data = self.shadows.reserve_other(index, light, inputs.geometry);
                    self.frame.other.push(OtherLightGpu::spot(light, shadow_data));
                    self.frame.light_bounds.push(light.screen_rect);
                }
            }
        }

        if truncated && !self.warned_truncation {
            self.warned_truncation = true;
            eprintln!(
                "[lighting] visible light count exceeds {} directional / {} point+spot; extra lights are dropped",
                MAX_DIRECTIONAL_LIGHTS, MAX_OTHER_LIGHTS
            );
        }
    }

    fn update_uniform(&mut self, inputs: &FrameInputs<'_>) {
        let tile_uv = self.frame.grid.tile_uv_size();
        let shadows_cfg = &inputs.config.shadows;
        self.uniform = LightingUniform {
            tile_settings: [
                tile_uv.x,
                tile_uv.y,
                layer_mask_as_f32(self.frame.grid.tiles_per_row as u32),
                layer_mask_as_f32(self.frame.tile_data_size as u32),
            ],
            distance_fade: self.shadows.distance_fade().to_array(),
            atlas_sizes: self.shadows.atlas_sizes().to_array(),
            counts: [
                self.frame.directional.len() as i32,
                self.frame.other.len() as i32,
                self.shadows.global_cascade_count() as i32,
                self.shadows.shadow_mask_selector(),
            ],
            selectors: [
                shadows_cfg.filter_quality.selector(),
                shadows_cfg.filter_quality.selector(),
                match shadows_cfg.directional.cascade_blend {
                    CascadeBlend::Hard => -1,
                    CascadeBlend::Soft => 0,
                    CascadeBlend::Dither => 1,
                },
                0,
            ],
        };
    }

    /// CPU-only frame preparation: light setup, atlas planning and tile
    /// culling, with no device access and no atlas rasterization.
    pub fn assemble(&mut self, inputs: &FrameInputs<'_>) -> LightingMetrics {
        self.setup_lights(inputs);
        self.frame.begin_tiles(
            inputs.viewport,
            inputs.config.forward_plus.tile_pixel_size(),
            inputs.config.forward_plus.resolved_max_lights_per_tile(),
            inputs.lights.len(),
        );

        let LightFrame { light_bounds, tile_data, grid, tile_data_size, max_lights_per_tile, other, .. } =
            &mut self.frame;
        let culling = TileCullingParams {
            light_bounds,
            other_light_count: other.len(),
            max_lights_per_tile: *max_lights_per_tile,
            tile_data_size: *tile_data_size,
            grid: *grid,
        };
        let shadows = &mut self.shadows;
        let geometry = inputs.geometry;
        rayon::join(
            || fill_tile_data(&culling, tile_data),
            || shadows.plan_atlases(geometry),
        );

        self.update_uniform(inputs);
        self.metrics()
    }

    /// Full frame preparation: everything [`LightingPass::assemble`] does,
    /// plus shadow atlas rendering into `params.encoder` and buffer uploads.
    /// Tile culling runs concurrently with shadow pass recording; the only
    /// synchronization point is the join before the tile upload.
    pub fn prepare(&mut self, params: LightingPassParams<'_>) -> Result<LightingMetrics> {
        self.setup_lights(&params.inputs);
        self.frame.begin_tiles(
            params.inputs.viewport,
            params.inputs.config.forward_plus.tile_pixel_size(),
            params.inputs.config.forward_plus.resolved_max_lights_per_tile(),
            params.inputs.lights.len(),
        );

        let shadow_result = {
            let LightFrame {
                light_bounds,
                tile_data,
                grid,
                tile_data_size,
                max_lights_per_tile,
                other,
                ..
            } = &mut self.frame;
            let culling = TileCullingParams {
                light_bounds,
                other_light_count: other.len(),
                max_lights_per_tile: *max_lights_per_tile,
                tile_data_size: *tile_data_size,
                grid: *grid,
            };
            let shadows = &mut self.shadows;
            let render = ShadowRenderParams {
                device: params.device,
                queue: params.queue,
                encoder: params.encoder,
                casters: params.casters,
                geometry: params.inputs.geometry,
            };
            let ((), shadow_result) = rayon::join(
                || fill_tile_data(&culling, tile_data),
                || shadows.render(render),
            );
            shadow_result
        };
        shadow_result?;

        self.update_uniform(&params.inputs);
        self.ensure_resources(params.device)?;
        self.upload(params.queue)?;
        self.rebuild_bind_group(params.device)?;
        Ok(self.metrics())
    }

    pub fn metrics(&self) -> LightingMetrics {
        LightingMetrics {
            directional_lights: self.frame.directional.len(),
            other_lights: self.frame.other.len(),
            shadowed_directional_lights: self.shadows.reserved_directional_count(),
            reserved_other_tiles: self.shadows.reserved_other_tile_count(),
            tile_count: self.frame.grid.tile_count(),
            tile_data_size: self.frame.tile_data_size,
        }
    }

    pub fn uniform(&self) -> &LightingUniform {
        &self.uniform
    }

    pub fn directional_records(&self) -> &[DirectionalLightGpu] {
        &self.frame.directional
    }

    pub fn other_records(&self) -> &[OtherLightGpu] {
        &self.frame.other
    }

    pub fn tile_data(&self) -> &[u32] {
        &self.frame.tile_data
    }

    pub fn tile_grid(&self) -> &TileGrid {
        &self.frame.grid
    }

    pub fn shadows(&self) -> &ShadowPlanner {
        &self.shadows
    }

    pub fn bind_group_layout(&self) -> Option<&wgpu::BindGroupLayout> {
        self.bind_group_layout.as_ref()
    }

    pub fn bind_group(&self) -> Option<&wgpu::BindGroup> {
        self.bind_group.as_ref()
    }

    fn ensure_resources(&mut self, device: &wgpu::Device) -> Result<()> {
        if self.bind_group_layout.is_none() {
            let storage = |binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            };
            self.bind_group_layout =
                Some(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Lighting BGL"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: wgpu::BufferSize::new(
                                    std::mem::size_of::<LightingUniform>() as u64,
                                ),
                            },
                            count: None,
                        },
                        storage(1),
                        storage(2),
                        storage(3),
                        storage(4),
                        storage(5),
                        storage(6),
                        wgpu::BindGroupLayoutEntry {
                            binding: 7,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Depth,
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 8,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Depth,
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 9,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                            count: None,
                        },
                    ],
                }));
        }

        if self.uniform_buffer.is_none() {
            self.uniform_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Lighting Uniform"),
                size: std::mem::size_of::<LightingUniform>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        if self.directional_buffer.is_none() {
            self.directional_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Directional Lights"),
                size: (MAX_DIRECTIONAL_LIGHTS * DirectionalLightGpu::STRIDE) as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        if self.other_buffer.is_none() {
            self.other_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Other Lights"),
                size: (MAX_OTHER_LIGHTS * OtherLightGpu::STRIDE) as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }

        let tile_words = self.frame.tile_data.len().max(1);
        if self.tile_buffer.is_none() || self.tile_buffer_capacity < tile_words {
            let mut capacity = self.tile_buffer_capacity.max(1024);
            while capacity < tile_words {
                capacity *= 2;
            }
            self.tile_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Forward+ Tiles"),
                size: (capacity * std::mem::size_of::<u32>()) as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
            self.tile_buffer_capacity = capacity;
        }
        Ok(())
    }

    fn upload(&self, queue: &wgpu::Queue) -> Result<()> {
        let uniform_buffer = self.uniform_buffer.as_ref().context("Lighting uniform missing")?;
        queue.write_buffer(uniform_buffer, 0, bytemuck::bytes_of(&self.uniform));

        if !self.frame.directional.is_empty() {
            let buffer = self.directional_buffer.as_ref().context("Directional buffer missing")?;
            queue.write_buffer(buffer, 0, bytemuck::cast_slice(&self.frame.directional));
        }
        if !self.frame.other.is_empty() {
            let buffer = self.other_buffer.as_ref().context("Other light buffer missing")?;
            queue.write_buffer(buffer, 0, bytemuck::cast_slice(&self.frame.other));
        }
        if !self.frame.tile_data.is_empty() {
            let buffer = self.tile_buffer.as_ref().context("Tile buffer missing")?;
            queue.write_buffer(buffer, 0, bytemuck::cast_slice(&self.frame.tile_data));
        }
        Ok(())
    }

    /// Rebuilt every frame: the atlas views swap between real atlases and
    /// the 1x1 fallback depending on what got reserved.
    fn rebuild_bind_group(&mut self, device: &wgpu::Device) -> Result<()> {
        let layout = self.bind_group_layout.as_ref().context("Lighting layout missing")?;
        let uniform = self.uniform_buffer.as_ref().context("Lighting uniform missing")?;
        let directional = self.directional_buffer.as_ref().context("Directional buffer missing")?;
        let other = self.other_buffer.as_ref().context("Other light buffer missing")?;
        let tiles = self.tile_buffer.as_ref().context("Tile buffer missing")?;
        let cascades = self.shadows.cascade_buffer().context("Cascade buffer missing")?;
        let matrices = self.shadows.matrices_buffer().context("Matrices buffer missing")?;
        let other_shadows = self.shadows.other_data_buffer().context("Other shadow buffer missing")?;
        let dir_atlas = self.shadows.directional_atlas_view().context("Directional atlas missing")?;
        let other_atlas = self.shadows.other_atlas_view().context("Other atlas missing")?;
        let sampler = self.shadows.sampler().context("Shadow sampler missing")?;

        self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Lighting BG"),
            layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: uniform.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: directional.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: other.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: tiles.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: cascades.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: matrices.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: other_shadows.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: wgpu::BindingResource::TextureView(dir_atlas),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: wgpu::BindingResource::TextureView(other_atlas),
                },
                wgpu::BindGroupEntry { binding: 9, resource: wgpu::BindingResource::Sampler(sampler) },
            ],
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lights::ShadowMode;
    use glam::Vec3;

    struct NoCasters;

    impl ShadowGeometry for NoCasters {
        fn has_shadow_casters(&self, _light_index: usize) -> bool {
            false
        }

        fn directional_cascade(
            &self,
            _request: &geometry::DirectionalCascadeRequest,
        ) -> geometry::ShadowProjection {
            unreachable!("no light should reserve a tile")
        }

        fn spot_projection(&self, _light_index: usize) -> geometry::ShadowProjection {
            unreachable!("no light should reserve a tile")
        }

        fn point_face(
            &self,
            _light_index: usize,
            _face: usize,
            _fov_bias_degrees: f32,
        ) -> geometry::ShadowProjection {
            unreachable!("no light should reserve a tile")
        }
    }

    #[test]
    fn layer_mask_filter_drops_mismatched_lights() {
        let config = LightingConfig::default();
        let mut lights = vec![
            VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE),
            VisibleLight::point(Vec3::ZERO, 5.0, Vec3::ONE),
        ];
        lights[1].rendering_layer_mask = 0b10;
        let mut pass = LightingPass::new();
        let metrics = pass.assemble(&FrameInputs {
            lights: &lights,
            camera_layer_mask: 0b01,
            viewport: PhysicalSize::new(640, 480),
            geometry: &NoCasters,
            config: &config,
        });
        assert_eq!(metrics.directional_lights, 1);
        assert_eq!(metrics.other_lights, 0);
    }

    #[test]
    fn shadowless_light_without_casters_gets_baked_fallback() {
        let config = LightingConfig::default();
        let lights = [VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE)
            .with_shadows(ShadowMode::Soft, 0.75)];
        let mut pass = LightingPass::new();
        let metrics = pass.assemble(&FrameInputs {
            lights: &lights,
            camera_layer_mask: u32::MAX,
            viewport: PhysicalSize::new(640, 480),
            geometry: &NoCasters,
            config: &config,
        });
        assert_eq!(metrics.shadowed_directional_lights, 0);
        let record = &pass.directional_records()[0];
        assert_eq!(record.shadow_data[1], -0.75);
    }

    #[test]
    fn uniform_packs_bitcast_tile_lanes() {
        let config = LightingConfig::default();
        let lights = [VisibleLight::point(Vec3::ZERO, 5.0, Vec3::ONE)];
        let mut pass = LightingPass::new();
        pass.assemble(&FrameInputs {
            lights: &lights,
            camera_layer_mask: u32::MAX,
            viewport: PhysicalSize::new(1920, 1080),
            geometry: &NoCasters,
            config: &config,
        });
        let uniform = pass.uniform();
        assert_eq!(uniform.tile_settings[2].to_bits(), 120);
        // One point light: word count shrinks to count header + one index.
        assert_eq!(uniform.tile_settings[3].to_bits(), 2);
        assert_eq!(uniform.counts[0], 0);
        assert_eq!(uniform.counts[1], 1);
        assert_eq!(uniform.counts[3], -1);
    }

    #[test]
    fn tile_word_shrink_counts_directional_lights_too() {
        let config = LightingConfig::default();
        let lights = [
            VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE),
            VisibleLight::point(Vec3::ZERO, 5.0, Vec3::ONE),
        ];
        let mut pass = LightingPass::new();
        let metrics = pass.assemble(&FrameInputs {
            lights: &lights,
            camera_layer_mask: u32::MAX,
            viewport: PhysicalSize::new(640, 480),
            geometry: &NoCasters,
            config: &config,
        });
        // Two visible lights: header plus two index slots, even though only
        // one light is tile-culled.
        assert_eq!(metrics.tile_data_size, 3);
        assert_eq!(pass.uniform().tile_settings[3].to_bits(), 3);
    }
}
