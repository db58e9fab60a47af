use anyhow::{Context, Result};
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::collections::HashMap;
use std::sync::Arc;

use super::geometry::{DirectionalCascadeRequest, ShadowGeometry, CUBEMAP_FACE_COUNT};
use super::SHADOW_DEPTH_FORMAT;
use crate::config::ShadowConfig;
use crate::lights::{VisibleLight, MAX_CASCADES, MAX_SHADOWED_DIRECTIONAL_LIGHTS, MAX_SHADOWED_OTHER_TILES};

const SQRT_2: f32 = 1.4142136;
/// Dynamic-offset stride for the per-tile and per-caster uniforms.
const UNIFORM_SLOT_STRIDE: u64 = 256;
const MAX_DIRECTIONAL_TILES: usize = MAX_SHADOWED_DIRECTIONAL_LIGHTS * MAX_CASCADES;
const OTHER_SLOT_BASE: usize = MAX_DIRECTIONAL_TILES;

/// Chooses how many tiles an atlas is split into per axis: enough that
/// `split * split >= tile_count`, capped at a 4x4 grid.
pub fn atlas_split(tile_count: usize) -> u32 {
    if tile_count <= 1 {
        1
    } else if tile_count <= 4 {
        2
    } else {
        4
    }
}

/// Rescales a light-space clip matrix so `[-1,1]^2` lands in the tile's
/// `[0,1]` sub-rectangle of the atlas. Clip depth is already `0..1` (see
/// [`super::geometry::ShadowGeometry`]) and passes through unchanged, so
/// the remapped value matches the depth the atlas pass stored; reversed-Z
/// atlases flip it.
pub fn shadow_tile_matrix(m: Mat4, tile_offset: Vec2, tile_scale: f32, reverse_z: bool) -> Mat4 {
    let mut cols = m.to_cols_array_2d();
    for col in &mut cols {
        let w = col[3];
        col[0] = (0.5 * (col[0] + w) + tile_offset.x * w) * tile_scale;
        col[1] = (0.5 * (col[1] + w) + tile_offset.y * w) * tile_scale;
        if reverse_z {
            col[2] = w - col[2];
        }
    }
    Mat4::from_cols_array_2d(&cols)
}

/// Culling sphere and filter data for one directional cascade. The sphere
/// radius is shrunk by the filter footprint so filtering never samples
/// outside the cascade; the stored radius lane is pre-squared.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DirectionalCascadeGpu {
    pub culling_sphere: [f32; 4],
    pub data: [f32; 4],
}

impl DirectionalCascadeGpu {
    pub const STRIDE: usize = 4 * 4 * 2;

    pub fn new(culling_sphere: Vec4, tile_resolution: f32, filter_texels: f32) -> Self {
        let texel_size = 2.0 * culling_sphere.w / tile_resolution;
        let filter_size = filter_texels * texel_size;
        let radius = culling_sphere.w - filter_size;
        let radius_sq = radius * radius;
        Self {
            culling_sphere: [culling_sphere.x, culling_sphere.y, culling_sphere.z, radius_sq],
            data: [1.0 / radius_sq, filter_size * SQRT_2, 0.0, 0.0],
        }
    }
}

/// Per-tile sampling data for a point/spot light: the tile's sub-rectangle
/// (inset by half a texel border) plus bias, and the atlas remap matrix.
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct OtherShadowGpu {
    pub tile_data: [f32; 4],
    pub shadow_matrix: [[f32; 4]; 4],
}

impl OtherShadowGpu {
    pub const STRIDE: usize = 4 * 4 + 4 * 16;

    pub fn new(tile_offset: Vec2, tile_scale: f32, bias: f32, border: f32, matrix: Mat4) -> Self {
        Self {
            tile_data: [
                tile_offset.x * tile_scale + border,
                tile_offset.y * tile_scale + border,
                tile_scale - border - border,
                bias,
            ],
            shadow_matrix: matrix.to_cols_array_2d(),
        }
    }
}

#[derive(Clone, Copy, Default)]
struct ShadowedDirectional {
    visible_light_index: usize,
    slope_scale_bias: f32,
    near_plane_offset: f32,
}

#[derive(Clone, Copy, Default)]
struct ShadowedOther {
    visible_light_index: usize,
    slope_scale_bias: f32,
    normal_bias: f32,
    is_point: bool,
}

/// Geometry handed to the depth pass: position-only vertex data.
pub struct MeshBuffers {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
}

pub struct ShadowCasterDraw<'a> {
    pub mesh: &'a MeshBuffers,
    pub model: Mat4,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct TileUniform {
    view_proj: [[f32; 4]; 4],
    /// x: shadow pancaking flag.
    params: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct CasterUniform {
    model: [[f32; 4]; 4],
}

#[derive(Clone, Copy)]
struct TileDrawPlan {
    tile_offset: Vec2,
    view: Mat4,
    proj: Mat4,
    slope_scale_bias: f32,
    pancake: bool,
    uniform_slot: usize,
}

struct AtlasTexture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: u32,
}

pub struct ShadowRenderParams<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub casters: &'a [ShadowCasterDraw<'a>],
    pub geometry: &'a dyn ShadowGeometry,
}

/// Plans and renders the two shadow atlases for a frame.
///
/// All reservation state is reset by [`ShadowPlanner::begin_frame`]; the
/// planner assumes strictly sequential frames.
#[derive(Default)]
pub struct ShadowPlanner {
    settings: ShadowConfig,
    reverse_z: bool,
    reserved_directional: usize,
    reserved_other_tiles: usize,
    shadow_mask_used: bool,
    directional_lights: [ShadowedDirectional; MAX_SHADOWED_DIRECTIONAL_LIGHTS],
    other_lights: [ShadowedOther; MAX_SHADOWED_OTHER_TILES],
    cascades: [DirectionalCascadeGpu; MAX_CASCADES],
    directional_matrices: [[[f32; 4]; 4]; MAX_DIRECTIONAL_TILES],
    other_tiles: [OtherShadowGpu; MAX_SHADOWED_OTHER_TILES],
    atlas_sizes: Vec4,
    distance_fade: Vec4,
    directional_plan: Vec<TileDrawPlan>,
    other_plan: Vec<TileDrawPlan>,

    tile_bgl: Option<Arc<wgpu::BindGroupLayout>>,
    caster_bgl: Option<Arc<wgpu::BindGroupLayout>>,
    shader: Option<wgpu::ShaderModule>,
    pipeline_layout: Option<wgpu::PipelineLayout>,
    bias_pipelines: HashMap<u32, wgpu::RenderPipeline>,
    tile_uniform_buffer: Option<wgpu::Buffer>,
    tile_bind_group: Option<wgpu::BindGroup>,
    caster_uniform_buffer: Option<wgpu::Buffer>,
    caster_bind_group: Option<wgpu::BindGroup>,
    caster_capacity: usize,
    directional_atlas: Option<AtlasTexture>,
    other_atlas: Option<AtlasTexture>,
    fallback_atlas: Option<AtlasTexture>,
    sampler: Option<wgpu::Sampler>,
    cascade_buffer: Option<wgpu::Buffer>,
    matrices_buffer: Option<wgpu::Buffer>,
    other_data_buffer: Option<wgpu::Buffer>,
}

impl ShadowPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the reversed-Z depth convention for atlas rendering and the
    /// tile remap matrices.
    pub fn set_reverse_z(&mut self, reverse_z: bool) {
        if self.reverse_z != reverse_z {
            self.reverse_z = reverse_z;
            self.bias_pipelines.clear();
        }
    }

    pub fn begin_frame(&mut self, settings: &ShadowConfig) {
        self.settings = settings.clone();
        self.reserved_directional = 0;
        self.reserved_other_tiles = 0;
        self.shadow_mask_used = false;
        self.atlas_sizes = Vec4::ZERO;
        self.directional_plan.clear();
        self.other_plan.clear();

        let fade = settings.distance_fade.clamp(0.001, 1.0);
        let one_minus_cascade_fade = 1.0 - settings.directional.cascade_fade;
        self.distance_fade = Vec4::new(
            1.0 / settings.max_distance.max(0.001),
            1.0 / fade,
            1.0 / (1.0 - one_minus_cascade_fade * one_minus_cascade_fade),
            0.0,
        );
    }

    /// Reserves atlas space for a directional light and returns its shadow
    /// data vector `(tile_start, strength, normal_bias, mask_channel)`.
    /// `w = -1` means the light is not shadowed at all; a negative `y` means
    /// only the baked mask term applies.
    pub fn reserve_directional(
        &mut self,
        visible_light_index: usize,
        light: &VisibleLight,
        geometry: &dyn ShadowGeometry,
    ) -> Vec4 {
        let should_reserve = self.reserved_directional < MAX_SHADOWED_DIRECTIONAL_LIGHTS
            && light.shadow_mode.casts_shadows()
            && light.shadow_strength > 0.0;
        if !should_reserve {
            return Vec4::new(0.0, 0.0, 0.0, -1.0);
        }

        let mask_channel = light.mask_channel_f32();
        if light.baked_mask_channel.is_some() {
            self.shadow_mask_used = true;
        }

        if !geometry.has_shadow_casters(visible_light_index) {
            return Vec4::new(0.0, -light.shadow_strength, 0.0, mask_channel);
        }

        self.directional_lights[self.reserved_directional] = ShadowedDirectional {
            visible_light_index,
            slope_scale_bias: light.slope_scale_bias,
            near_plane_offset: light.shadow_near_plane,
        };
        let cascade_count = self.settings.directional.resolved_cascade_count();
        let data = Vec4::new(
            (cascade_count * self.reserved_directional) as f32,
            light.shadow_strength,
            light.normal_bias,
            mask_channel,
        );
        self.reserved_directional += 1;
        data
    }

    /// Reserves atlas tiles for a point/spot light and returns
    /// `(tile_index, strength, is_point, mask_channel)`. Point lights take
    /// six consecutive tiles, one per cubemap face.
    pub fn reserve_other(
        &mut self,
        visible_light_index: usize,
        light: &VisibleLight,
        geometry: &dyn ShadowGeometry,
    ) -> Vec4 {
        let should_reserve = light.shadow_mode.casts_shadows() && light.shadow_strength > 0.0;
        if !should_reserve {
            return Vec4::new(0.0, 0.0, 0.0, -1.0);
        }

        let mask_channel = light.mask_channel_f32();
        if light.baked_mask_channel.is_some() {
            self.shadow_mask_used = true;
        }

        let is_point = matches!(light.kind, crate::lights::LightKind::Point);
        let new_tile_count = self.reserved_other_tiles + if is_point { CUBEMAP_FACE_COUNT } else { 1 };
        if new_tile_count > MAX_SHADOWED_OTHER_TILES || !geometry.has_shadow_casters(visible_light_index) {
            return Vec4::new(0.0, -light.shadow_strength, 0.0, mask_channel);
        }

        self.other_lights[self.reserved_other_tiles] = ShadowedOther {
            visible_light_index,
            slope_scale_bias: light.slope_scale_bias,
            normal_bias: light.normal_bias,
            is_point,
        };
        let data = Vec4::new(
            self.reserved_other_tiles as f32,
            light.shadow_strength,
            if is_point { 1.0 } else { 0.0 },
            mask_channel,
        );
        self.reserved_other_tiles = new_tile_count;
        data
    }

    pub fn reserved_directional_count(&self) -> usize {
        self.reserved_directional
    }

    pub fn reserved_other_tile_count(&self) -> usize {
        self.reserved_other_tiles
    }

    pub fn shadow_mask_used(&self) -> bool {
        self.shadow_mask_used
    }

    pub fn distance_fade(&self) -> Vec4 {
        self.distance_fade
    }

    pub fn atlas_sizes(&self) -> Vec4 {
        self.atlas_sizes
    }

    /// Cascade count as seen by the shading pass: zero when no directional
    /// light got a realtime tile.
    pub fn global_cascade_count(&self) -> usize {
        if self.reserved_directional > 0 {
            self.settings.directional.resolved_cascade_count()
        } else {
            0
        }
    }

    /// Shadow-mask mode selector: 0 = always, 1 = past shadow distance,
    /// -1 = no reserved light uses a mask.
    pub fn shadow_mask_selector(&self) -> i32 {
        if self.shadow_mask_used {
            match self.settings.mask_mode {
                crate::config::ShadowMaskMode::Shadowmask => 0,
                crate::config::ShadowMaskMode::DistanceShadowmask => 1,
            }
        } else {
            -1
        }
    }

    pub fn cascades(&self) -> &[DirectionalCascadeGpu] {
        &self.cascades[..self.settings.directional.resolved_cascade_count()]
    }

    pub fn directional_matrices(&self) -> &[[[f32; 4]; 4]] {
        let used = self.reserved_directional * self.settings.directional.resolved_cascade_count();
        &self.directional_matrices[..used]
    }

    pub fn other_tile_data(&self) -> &[OtherShadowGpu] {
        &self.other_tiles[..self.reserved_other_tiles]
    }

    /// Computes viewports, matrices and cascade data for both atlases
    /// without touching the GPU. [`ShadowPlanner::render`] runs this
    /// implicitly; it is public so callers can plan headlessly.
    pub fn plan_atlases(&mut self, geometry: &dyn ShadowGeometry) {
        self.plan_directional(geometry);
        self.plan_other(geometry);
    }

    fn plan_directional(&mut self, geometry: &dyn ShadowGeometry) {
        self.directional_plan.clear();
        if self.reserved_directional == 0 {
            return;
        }
        let atlas_size = self.settings.directional.atlas_size.pixels();
        self.atlas_sizes.x = atlas_size as f32;
        self.atlas_sizes.y = 1.0 / atlas_size as f32;

        let cascade_count = self.settings.directional.resolved_cascade_count();
        let tile_count = self.reserved_directional * cascade_count;
        let split = atlas_split(tile_count);
        let tile_resolution = atlas_size / split;
        let tile_scale = 1.0 / split as f32;
        let ratios = Vec3::from_array(self.settings.directional.cascade_ratios);
        let culling_factor = (0.8 - self.settings.directional.cascade_fade).max(0.0);
        let filter_texels = self.settings.filter_quality.filter_texels();

        for light_index in 0..self.reserved_directional {
            let shadowed = self.directional_lights[light_index];
            for cascade_index in 0..cascade_count {
                let request = DirectionalCascadeRequest {
                    light_index: shadowed.visible_light_index,
                    cascade_index,
                    cascade_count,
                    cascade_ratios: ratios,
                    tile_resolution,
                    near_plane_offset: shadowed.near_plane_offset,
                    culling_factor,
                };
                let projection = geometry.directional_cascade(&request);

                // Cascade spheres are camera-relative and shared by every
                // directional light, so only the first light's are stored.
                if light_index == 0 {
                    self.cascades[cascade_index] = DirectionalCascadeGpu::new(
                        projection.culling_sphere,
                        tile_resolution as f32,
                        filter_texels,
                    );
                }

                let tile_index = light_index * cascade_count + cascade_index;
                let tile_offset = tile_offset_in_atlas(tile_index, split);
                self.directional_matrices[tile_index] = shadow_tile_matrix(
                    projection.proj * projection.view,
                    tile_offset,
                    tile_scale,
                    self.reverse_z,
                )
                .to_cols_array_2d();

                self.directional_plan.push(TileDrawPlan {
                    tile_offset,
                    view: projection.view,
                    proj: projection.proj,
                    slope_scale_bias: shadowed.slope_scale_bias,
                    pancake: true,
                    uniform_slot: tile_index,
                });
            }
        }
    }

    fn plan_other(&mut self, geometry: &dyn ShadowGeometry) {
        self.other_plan.clear();
        if self.reserved_other_tiles == 0 {
            return;
        }
        let atlas_size = self.settings.other.atlas_size.pixels();
        self.atlas_sizes.z = atlas_size as f32;
        self.atlas_sizes.w = 1.0 / atlas_size as f32;

        let split = atlas_split(self.reserved_other_tiles);
        let tile_resolution = atlas_size / split;
        let tile_scale = 1.0 / split as f32;
        let border = self.atlas_sizes.w * 0.5;
        let filter_texels = self.settings.filter_quality.filter_texels();

        let mut tile_index = 0;
        while tile_index < self.reserved_other_tiles {
            let shadowed = self.other_lights[tile_index];
            if shadowed.is_point {
                self.plan_point_light(
                    geometry,
                    &shadowed,
                    tile_index,
                    split,
                    tile_resolution,
                    tile_scale,
                    border,
                    filter_texels,
                );
                tile_index += CUBEMAP_FACE_COUNT;
            } else {
                self.plan_spot_light(
                    geometry,
                    &shadowed,
                    tile_index,
                    split,
                    tile_resolution,
                    tile_scale,
                    border,
                    filter_texels,
                );
                tile_index += 1;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_spot_light(
        &mut self,
        geometry: &dyn ShadowGeometry,
        shadowed: &ShadowedOther,
        tile_index: usize,
        split: u32,
        tile_resolution: u32,
        tile_scale: f32,
        border: f32,
        filter_texels: f32,
    ) {
        let projection = geometry.spot_projection(shadowed.visible_light_index);
        let texel_size = 2.0 / (tile_resolution as f32 * projection.proj.x_axis.x);
        let filter_size = texel_size * filter_texels;
        let bias = shadowed.normal_bias * filter_size * SQRT_2;
        let tile_offset = tile_offset_in_atlas(tile_index, split);
        self.other_tiles[tile_index] = OtherShadowGpu::new(
            tile_offset,
            tile_scale,
            bias,
            border,
            shadow_tile_matrix(projection.proj * projection.view, tile_offset, tile_scale, self.reverse_z),
        );
        self.other_plan.push(TileDrawPlan {
            tile_offset,
            view: projection.view,
            proj: projection.proj,
            slope_scale_bias: shadowed.slope_scale_bias,
            pancake: false,
            uniform_slot: OTHER_SLOT_BASE + tile_index,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_point_light(
        &mut self,
        geometry: &dyn ShadowGeometry,
        shadowed: &ShadowedOther,
        first_tile: usize,
        split: u32,
        tile_resolution: u32,
        tile_scale: f32,
        border: f32,
        filter_texels: f32,
    ) {
        let texel_size = 2.0 / tile_resolution as f32;
        let filter_size = texel_size * filter_texels;
        let bias = shadowed.normal_bias * filter_size * SQRT_2;
        // Widen each face frustum so filtering never reads past the face
        // boundary.
        let fov_bias = (1.0 + bias + filter_size).atan().to_degrees() * 2.0 - 90.0;

        for face in 0..CUBEMAP_FACE_COUNT {
            let mut projection = geometry.point_face(shadowed.visible_light_index, face, fov_bias);
            projection.view = negate_view_y_row(projection.view);

            let tile_index = first_tile + face;
            let tile_offset = tile_offset_in_atlas(tile_index, split);
            self.other_tiles[tile_index] = OtherShadowGpu::new(
                tile_offset,
                tile_scale,
                bias,
                border,
                shadow_tile_matrix(
                    projection.proj * projection.view,
                    tile_offset,
                    tile_scale,
                    self.reverse_z,
                ),
            );
            self.other_plan.push(TileDrawPlan {
                tile_offset,
                view: projection.view,
                proj: projection.proj,
                slope_scale_bias: shadowed.slope_scale_bias,
                pancake: false,
                uniform_slot: OTHER_SLOT_BASE + tile_index,
            });
        }
    }

    /// Plans both atlases and records their depth-only passes. The tile
    /// culler may run concurrently; this only reads reservation records.
    pub fn render(&mut self, params: ShadowRenderParams<'_>) -> Result<()> {
        self.plan_atlases(params.geometry);
        self.ensure_resources(params.device)?;
        self.ensure_caster_capacity(params.device, params.casters.len())?;
        self.ensure_bias_pipelines(params.device)?;
        self.upload_tile_uniforms(params.queue)?;
        self.upload_caster_uniforms(params.queue, params.casters)?;

        if self.reserved_directional > 0 {
            let atlas_size = self.settings.directional.atlas_size.pixels();
            let split = atlas_split(self.reserved_directional * self.settings.directional.resolved_cascade_count());
            let atlas = ensure_atlas(
                params.device,
                &mut self.directional_atlas,
                atlas_size,
                "Directional Shadow Atlas",
            );
            let tile_resolution = atlas_size / split;
            encode_atlas_pass(
                params.encoder,
                &atlas.view,
                "Directional Shadow Pass",
                &self.directional_plan,
                tile_resolution,
                self.reverse_z,
                &self.bias_pipelines,
                self.tile_bind_group.as_ref().context("Shadow tile bind group missing")?,
                self.caster_bind_group.as_ref().context("Shadow caster bind group missing")?,
                params.casters,
            )?;
        }

        if self.reserved_other_tiles > 0 {
            let atlas_size = self.settings.other.atlas_size.pixels();
            let split = atlas_split(self.reserved_other_tiles);
            let atlas =
                ensure_atlas(params.device, &mut self.other_atlas, atlas_size, "Other Shadow Atlas");
            let tile_resolution = atlas_size / split;
            encode_atlas_pass(
                params.encoder,
                &atlas.view,
                "Other Shadow Pass",
                &self.other_plan,
                tile_resolution,
                self.reverse_z,
                &self.bias_pipelines,
                self.tile_bind_group.as_ref().context("Shadow tile bind group missing")?,
                self.caster_bind_group.as_ref().context("Shadow caster bind group missing")?,
                params.casters,
            )?;
        }

        self.upload_shadow_buffers(params.queue)?;
        Ok(())
    }

    /// Depth view bound for directional shadow sampling; a 1x1 fallback
    /// when no directional light reserved a tile this frame.
    pub fn directional_atlas_view(&self) -> Option<&wgpu::TextureView> {
        if self.reserved_directional > 0 {
            self.directional_atlas.as_ref().map(|atlas| &atlas.view)
        } else {
            self.fallback_atlas.as_ref().map(|atlas| &atlas.view)
        }
    }

    pub fn other_atlas_view(&self) -> Option<&wgpu::TextureView> {
        if self.reserved_other_tiles > 0 {
            self.other_atlas.as_ref().map(|atlas| &atlas.view)
        } else {
            self.fallback_atlas.as_ref().map(|atlas| &atlas.view)
        }
    }

    pub fn sampler(&self) -> Option<&wgpu::Sampler> {
        self.sampler.as_ref()
    }

    pub fn cascade_buffer(&self) -> Option<&wgpu::Buffer> {
        self.cascade_buffer.as_ref()
    }

    pub fn matrices_buffer(&self) -> Option<&wgpu::Buffer> {
        self.matrices_buffer.as_ref()
    }

    pub fn other_data_buffer(&self) -> Option<&wgpu::Buffer> {
        self.other_data_buffer.as_ref()
    }

    fn ensure_resources(&mut self, device: &wgpu::Device) -> Result<()> {
        if self.shader.is_none() {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Shadow Depth Shader"),
                source: wgpu::ShaderSource::Wgsl(
                    include_str!("../../assets/shaders/shadow_depth.wgsl").into(),
                ),
            });

            let tile_bgl = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Shadow Tile BGL"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<TileUniform>() as u64
                        ),
                    },
                    count: None,
                }],
            }));
            let caster_bgl = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Shadow Caster BGL"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<CasterUniform>() as u64
                        ),
                    },
                    count: None,
                }],
            }));
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Shadow Pipeline Layout"),
                bind_group_layouts: &[tile_bgl.as_ref(), caster_bgl.as_ref()],
                push_constant_ranges: &[],
            });

            self.shader = Some(shader);
            self.tile_bgl = Some(tile_bgl);
            self.caster_bgl = Some(caster_bgl);
            self.pipeline_layout = Some(pipeline_layout);
        }

        if self.tile_uniform_buffer.is_none() {
            let slots = (MAX_DIRECTIONAL_TILES + MAX_SHADOWED_OTHER_TILES) as u64;
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Shadow Tile Uniforms"),
                size: slots * UNIFORM_SLOT_STRIDE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let layout = self.tile_bgl.as_ref().context("Shadow tile layout missing")?;
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Shadow Tile BG"),
                layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(std::mem::size_of::<TileUniform>() as u64),
                    }),
                }],
            });
            self.tile_uniform_buffer = Some(buffer);
            self.tile_bind_group = Some(bind_group);
        }

        if self.sampler.is_none() {
            self.sampler = Some(device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("Shadow Atlas Sampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::FilterMode::Nearest,
                lod_min_clamp: 0.0,
                lod_max_clamp: 0.0,
                compare: Some(if self.reverse_z {
                    wgpu::CompareFunction::GreaterEqual
                } else {
                    wgpu::CompareFunction::LessEqual
                }),
                anisotropy_clamp: 1,
                border_color: None,
            }));
        }

        if self.fallback_atlas.is_none() {
            self.fallback_atlas = Some(create_atlas(device, 1, "Fallback Shadow Atlas"));
        }

        if self.cascade_buffer.is_none() {
            self.cascade_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Dir Shadow Cascades"),
                size: (MAX_CASCADES * DirectionalCascadeGpu::STRIDE) as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        if self.matrices_buffer.is_none() {
            self.matrices_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Dir Shadow Matrices"),
                size: (MAX_DIRECTIONAL_TILES * std::mem::size_of::<[[f32; 4]; 4]>()) as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        if self.other_data_buffer.is_none() {
            self.other_data_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Other Shadow Data"),
                size: (MAX_SHADOWED_OTHER_TILES * OtherShadowGpu::STRIDE) as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        Ok(())
    }

    fn ensure_caster_capacity(&mut self, device: &wgpu::Device, count: usize) -> Result<()> {
        let needed = count.max(1);
        if self.caster_capacity >= needed && self.caster_bind_group.is_some() {
            return Ok(());
        }
        let mut capacity = self.caster_capacity.max(16);
        while capacity < needed {
            capacity *= 2;
        }
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Shadow Caster Uniforms"),
            size: capacity as u64 * UNIFORM_SLOT_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let layout = self.caster_bgl.as_ref().context("Shadow caster layout missing")?;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Shadow Caster BG"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(std::mem::size_of::<CasterUniform>() as u64),
                }),
            }],
        });
        self.caster_uniform_buffer = Some(buffer);
        self.caster_bind_group = Some(bind_group);
        self.caster_capacity = capacity;
        Ok(())
    }

    fn ensure_bias_pipelines(&mut self, device: &wgpu::Device) -> Result<()> {
        let shader = self.shader.as_ref().context("Shadow shader missing")?;
        let layout = self.pipeline_layout.as_ref().context("Shadow pipeline layout missing")?;
        for plan in self.directional_plan.iter().chain(self.other_plan.iter()) {
            let key = plan.slope_scale_bias.to_bits();
            if self.bias_pipelines.contains_key(&key) {
                continue;
            }
            // wgpu bakes slope-scale bias into pipeline state, so each
            // distinct bias value gets its own depth pipeline.
            let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Shadow Depth Pipeline"),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: shader,
                    entry_point: Some("vs_main"),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: 12,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &[wgpu::VertexAttribute {
                            shader_location: 0,
                            format: wgpu::VertexFormat::Float32x3,
                            offset: 0,
                        }],
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: None,
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: Some(wgpu::Face::Back),
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: SHADOW_DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: if self.reverse_z {
                        wgpu::CompareFunction::GreaterEqual
                    } else {
                        wgpu::CompareFunction::LessEqual
                    },
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState {
                        constant: 0,
                        slope_scale: plan.slope_scale_bias,
                        clamp: 0.0,
                    },
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
            self.bias_pipelines.insert(key, pipeline);
        }
        Ok(())
    }

    fn upload_tile_uniforms(&self, queue: &wgpu::Queue) -> Result<()> {
        let buffer = self.tile_uniform_buffer.as_ref().context("Shadow tile uniforms missing")?;
        for plan in self.directional_plan.iter().chain(self.other_plan.iter()) {
            let uniform = TileUniform {
                view_proj: (plan.proj * plan.view).to_cols_array_2d(),
                params: [if plan.pancake { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
            };
            queue.write_buffer(
                buffer,
                plan.uniform_slot as u64 * UNIFORM_SLOT_STRIDE,
                bytemuck::bytes_of(&uniform),
            );
        }
        Ok(())
    }

    fn upload_caster_uniforms(&self, queue: &wgpu::Queue, casters: &[ShadowCasterDraw<'_>]) -> Result<()> {
        let buffer = self.caster_uniform_buffer.as_ref().context("Shadow caster uniforms missing")?;
        for (index, caster) in casters.iter().enumerate() {
            let uniform = CasterUniform { model: caster.model.to_cols_array_2d() };
            queue.write_buffer(buffer, index as u64 * UNIFORM_SLOT_STRIDE, bytemuck::bytes_of(&uniform));
        }
        Ok(())
    }

    fn upload_shadow_buffers(&self, queue: &wgpu::Queue) -> Result<()> {
        if self.reserved_directional > 0 {
            let cascade_buffer = self.cascade_buffer.as_ref().context("Cascade buffer missing")?;
            queue.write_buffer(cascade_buffer, 0, bytemuck::cast_slice(self.cascades()));
            let matrices_buffer = self.matrices_buffer.as_ref().context("Matrices buffer missing")?;
            queue.write_buffer(matrices_buffer, 0, bytemuck::cast_slice(self.directional_matrices()));
        }
        if self.reserved_other_tiles > 0 {
            let other_buffer = self.other_data_buffer.as_ref().context("Other shadow buffer missing")?;
            queue.write_buffer(other_buffer, 0, bytemuck::cast_slice(self.other_tile_data()));
        }
        Ok(())
    }
}

fn tile_offset_in_atlas(tile_index: usize, split: u32) -> Vec2 {
    let split = split as usize;
    Vec2::new((tile_index % split) as f32, (tile_index / split) as f32)
}

/// Flips the Y axis of a light view matrix to match the atlas orientation
/// of cubemap faces.
fn negate_view_y_row(view: Mat4) -> Mat4 {
    let mut cols = view.to_cols_array_2d();
    for col in &mut cols {
        col[1] = -col[1];
    }
    Mat4::from_cols_array_2d(&cols)
}

fn create_atlas(device: &wgpu::Device, size: u32, label: &str) -> AtlasTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d { width: size, height: size, depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: SHADOW_DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    AtlasTexture { _texture: texture, view, size }
}

fn ensure_atlas<'a>(
    device: &wgpu::Device,
    slot: &'a mut Option<AtlasTexture>,
    size: u32,
    label: &str,
) -> &'a AtlasTexture {
    if slot.as_ref().is_some_and(|atlas| atlas.size != size) {
        *slot = None;
    }
    slot.get_or_insert_with(|| create_atlas(device, size, label))
}

#[allow(clippy::too_many_arguments)]
fn encode_atlas_pass(
    encoder: &mut wgpu::CommandEncoder,
    atlas_view: &wgpu::TextureView,
    label: &str,
    plan: &[TileDrawPlan],
    tile_resolution: u32,
    reverse_z: bool,
    pipelines: &HashMap<u32, wgpu::RenderPipeline>,
    tile_bind_group: &wgpu::BindGroup,
    caster_bind_group: &wgpu::BindGroup,
    casters: &[ShadowCasterDraw<'_>],
) -> Result<()> {
    let clear_depth = if reverse_z { 0.0 } else { 1.0 };
    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[],
        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
            view: atlas_view,
            depth_ops: Some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(clear_depth),
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: None,
        }),
        occlusion_query_set: None,
        timestamp_writes: None,
    });

    let resolution = tile_resolution as f32;
    for tile in plan {
        let pipeline = pipelines
            .get(&tile.slope_scale_bias.to_bits())
            .context("Shadow depth pipeline missing for bias")?;
        pass.set_pipeline(pipeline);
        pass.set_viewport(
            tile.tile_offset.x * resolution,
            tile.tile_offset.y * resolution,
            resolution,
            resolution,
            0.0,
            1.0,
        );
        pass.set_scissor_rect(
            (tile.tile_offset.x * resolution) as u32,
            (tile.tile_offset.y * resolution) as u32,
            tile_resolution,
            tile_resolution,
        );
        pass.set_bind_group(0, tile_bind_group, &[(tile.uniform_slot as u64 * UNIFORM_SLOT_STRIDE) as u32]);
        for (caster_index, caster) in casters.iter().enumerate() {
            pass.set_bind_group(
                1,
                caster_bind_group,
                &[(caster_index as u64 * UNIFORM_SLOT_STRIDE) as u32],
            );
            pass.set_vertex_buffer(0, caster.mesh.vertex_buffer.slice(..));
            pass.set_index_buffer(caster.mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..caster.mesh.index_count, 0, 0..1);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atlas_split_is_monotonic_over_tile_counts() {
        assert_eq!(atlas_split(0), 1);
        assert_eq!(atlas_split(1), 1);
        assert_eq!(atlas_split(2), 2);
        assert_eq!(atlas_split(4), 2);
        assert_eq!(atlas_split(5), 4);
        assert_eq!(atlas_split(16), 4);
    }

    #[test]
    fn tile_matrix_maps_clip_cube_into_tile_rect() {
        let m = Mat4::IDENTITY;
        let remapped = shadow_tile_matrix(m, Vec2::new(1.0, 0.0), 0.5, false);
        for &(x, y, z) in &[(-1.0, -1.0, 0.0), (1.0, 1.0, 1.0), (0.3, -0.7, 0.6)] {
            let out = remapped * Vec4::new(x, y, z, 1.0);
            let ndc = out / out.w;
            assert!(ndc.x >= 0.5 - 1e-5 && ndc.x <= 1.0 + 1e-5);
            assert!(ndc.y >= 0.0 - 1e-5 && ndc.y <= 0.5 + 1e-5);
            assert!((ndc.z - z).abs() < 1e-6);
        }
    }

    #[test]
    fn tile_matrix_reverse_z_flips_depth() {
        let remapped = shadow_tile_matrix(Mat4::IDENTITY, Vec2::ZERO, 1.0, true);
        let near = remapped * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let far = remapped * Vec4::new(0.0, 0.0, 1.0, 1.0);
        assert!((near.z - 1.0).abs() < 1e-6);
        assert!(far.z.abs() < 1e-6);
    }

    #[test]
    fn stored_atlas_depth_matches_remap_reference() {
        // The atlas keeps wgpu ndc depth; sampling through the remap matrix
        // must land on exactly that value, or the comparison sampler tests
        // against the wrong scale.
        let proj = Mat4::perspective_rh(1.2, 1.0, 0.1, 20.0);
        let remapped = shadow_tile_matrix(proj, Vec2::new(1.0, 1.0), 0.5, false);
        for &z in &[-0.15f32, -0.25, -5.0, -19.0] {
            let caster = Vec4::new(0.02, -0.03, z, 1.0);
            let clip = proj * caster;
            assert!(clip.z >= 0.0 && clip.z <= clip.w, "caster at {z} got clipped");
            let stored = clip.z / clip.w;
            let sampled = remapped * caster;
            assert!((sampled.z / sampled.w - stored).abs() < 1e-6, "depth mismatch at {z}");
        }
    }

    #[test]
    fn cascade_data_shrinks_radius_by_filter_footprint() {
        let sphere = Vec4::new(0.0, 0.0, 0.0, 10.0);
        let cascade = DirectionalCascadeGpu::new(sphere, 512.0, 3.0);
        let texel = 2.0 * 10.0 / 512.0;
        let filter = 3.0 * texel;
        let shrunk = 10.0 - filter;
        assert!((cascade.culling_sphere[3] - shrunk * shrunk).abs() < 1e-4);
        assert!((cascade.data[0] - 1.0 / (shrunk * shrunk)).abs() < 1e-6);
        assert!((cascade.data[1] - filter * SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn other_tile_data_insets_by_border() {
        let matrix = Mat4::IDENTITY;
        let tile = OtherShadowGpu::new(Vec2::new(2.0, 1.0), 0.25, 0.01, 0.0005, matrix);
        assert!((tile.tile_data[0] - (2.0 * 0.25 + 0.0005)).abs() < 1e-7);
        assert!((tile.tile_data[1] - (1.0 * 0.25 + 0.0005)).abs() < 1e-7);
        assert!((tile.tile_data[2] - (0.25 - 0.001)).abs() < 1e-7);
        assert_eq!(tile.tile_data[3], 0.01);
    }
}
