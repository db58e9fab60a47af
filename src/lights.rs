use glam::{Vec3, Vec4};

pub const MAX_DIRECTIONAL_LIGHTS: usize = 4;
pub const MAX_OTHER_LIGHTS: usize = 128;
pub const MAX_SHADOWED_DIRECTIONAL_LIGHTS: usize = 4;
pub const MAX_SHADOWED_OTHER_TILES: usize = 16;
pub const MAX_CASCADES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LightKind {
    Directional,
    Point,
    Spot,
}

/// Realtime shadow mode of a light. `Off` lights never reserve atlas space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ShadowMode {
    #[default]
    Off,
    Hard,
    Soft,
}

impl ShadowMode {
    pub fn casts_shadows(self) -> bool {
        !matches!(self, ShadowMode::Off)
    }
}

/// One light that survived visibility culling, as handed over by the scene.
///
/// The record is read-only for the duration of a frame. `screen_rect` is the
/// light's screen-space bounding rectangle in normalized UV coordinates
/// `(min_x, min_y, max_x, max_y)`, precomputed by the culling collaborator.
#[derive(Clone, Debug)]
pub struct VisibleLight {
    pub kind: LightKind,
    /// Final color, intensity premultiplied.
    pub color: Vec3,
    pub position: Vec3,
    /// Forward axis of the light's transform (points away from the light).
    pub direction: Vec3,
    pub range: f32,
    /// Full outer cone angle in radians (spot only).
    pub spot_angle: f32,
    /// Full inner cone angle in radians (spot only).
    pub inner_spot_angle: f32,
    pub rendering_layer_mask: u32,
    pub shadow_mode: ShadowMode,
    pub shadow_strength: f32,
    pub slope_scale_bias: f32,
    pub normal_bias: f32,
    pub shadow_near_plane: f32,
    /// Occlusion channel of a baked shadow mask, if the light is mixed-baked.
    pub baked_mask_channel: Option<u32>,
    pub screen_rect: Vec4,
}

impl VisibleLight {
    pub fn directional(direction: Vec3, color: Vec3) -> Self {
        Self {
            kind: LightKind::Directional,
            color,
            position: Vec3::ZERO,
            direction: direction.normalize_or_zero(),
            range: f32::MAX,
            spot_angle: 0.0,
            inner_spot_angle: 0.0,
            rendering_layer_mask: u32::MAX,
            shadow_mode: ShadowMode::Off,
            shadow_strength: 1.0,
            slope_scale_bias: 1.0,
            normal_bias: 0.5,
            shadow_near_plane: 0.1,
            baked_mask_channel: None,
            screen_rect: Vec4::new(0.0, 0.0, 1.0, 1.0),
        }
    }

    pub fn point(position: Vec3, range: f32, color: Vec3) -> Self {
        Self {
            kind: LightKind::Point,
            position,
            direction: Vec3::ZERO,
            range,
            ..Self::directional(Vec3::NEG_Y, color)
        }
    }

    pub fn spot(position: Vec3, direction: Vec3, range: f32, spot_angle: f32, color: Vec3) -> Self {
        Self {
            kind: LightKind::Spot,
            position,
            direction: direction.normalize_or_zero(),
            range,
            spot_angle,
            inner_spot_angle: spot_angle * 0.8,
            ..Self::directional(Vec3::NEG_Y, color)
        }
    }

    pub fn with_shadows(mut self, mode: ShadowMode, strength: f32) -> Self {
        self.shadow_mode = mode;
        self.shadow_strength = strength;
        self
    }

    pub(crate) fn mask_channel_f32(&self) -> f32 {
        self.baked_mask_channel.map_or(-1.0, |channel| channel as f32)
    }
}

/// Reinterprets the rendering-layer mask bits as a float buffer lane.
///
/// This is a bit-cast, not a numeric conversion; shaders read the lane back
/// with the inverse bit-cast (`asuint` / `bitcast<u32>`), never as a float
/// value.
#[inline]
pub fn layer_mask_as_f32(mask: u32) -> f32 {
    f32::from_bits(mask)
}

#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DirectionalLightGpu {
    pub color: [f32; 4],
    pub direction_and_mask: [f32; 4],
    pub shadow_data: [f32; 4],
}

impl DirectionalLightGpu {
    pub const STRIDE: usize = 4 * 4 * 3;

    pub fn new(light: &VisibleLight, shadow_data: Vec4) -> Self {
        let direction = -light.direction;
        Self {
            color: light.color.extend(1.0).to_array(),
            direction_and_mask: [
                direction.x,
                direction.y,
                direction.z,
                layer_mask_as_f32(light.rendering_layer_mask),
            ],
            shadow_data: shadow_data.to_array(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct OtherLightGpu {
    pub color: [f32; 4],
    pub position: [f32; 4],
    pub direction_and_mask: [f32; 4],
    pub spot_angles: [f32; 4],
    pub shadow_data: [f32; 4],
}

impl OtherLightGpu {
    pub const STRIDE: usize = 4 * 4 * 5;

    pub fn point(light: &VisibleLight, shadow_data: Vec4) -> Self {
        Self {
            color: light.color.extend(1.0).to_array(),
            position: Self::position_lane(light),
            direction_and_mask: [0.0, 0.0, 0.0, layer_mask_as_f32(light.rendering_layer_mask)],
            spot_angles: [0.0, 1.0, 0.0, 0.0],
            shadow_data: shadow_data.to_array(),
        }
    }

    pub fn spot(light: &VisibleLight, shadow_data: Vec4) -> Self {
        let direction = -light.direction;
        let inner_cos = (0.5 * light.inner_spot_angle).cos();
        let outer_cos = (0.5 * light.spot_angle).cos();
        // Solved so that a * cos(angle) + b maps inner -> 1 and outer -> 0.
        let a = 1.0 / (inner_cos - outer_cos).max(0.001);
        let b = -outer_cos * a;
        Self {
            color: light.color.extend(1.0).to_array(),
            position: Self::position_lane(light),
            direction_and_mask: [
                direction.x,
                direction.y,
                direction.z,
                layer_mask_as_f32(light.rendering_layer_mask),
            ],
            spot_angles: [a, b, 0.0, 0.0],
            shadow_data: shadow_data.to_array(),
        }
    }

    fn position_lane(light: &VisibleLight) -> [f32; 4] {
        let inv_range_sq = 1.0 / (light.range * light.range).max(0.00001);
        [light.position.x, light.position.y, light.position.z, inv_range_sq]
    }
}
