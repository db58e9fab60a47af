use glam::{Mat4, Vec3, Vec4};
use winit::dpi::PhysicalSize;

use crate::camera3d::Camera3D;
use crate::lights::VisibleLight;

pub const CUBEMAP_FACE_COUNT: usize = 6;

/// Light-space matrices and the culling sphere for one shadow tile.
#[derive(Clone, Copy, Debug)]
pub struct ShadowProjection {
    pub view: Mat4,
    pub proj: Mat4,
    /// `(center.xyz, radius)` of the region the tile covers.
    pub culling_sphere: Vec4,
}

#[derive(Clone, Copy, Debug)]
pub struct DirectionalCascadeRequest {
    pub light_index: usize,
    pub cascade_index: usize,
    pub cascade_count: usize,
    /// Split ratios for the first three cascade boundaries; the last
    /// boundary is always the max shadow distance.
    pub cascade_ratios: Vec3,
    pub tile_resolution: u32,
    pub near_plane_offset: f32,
    /// Cross-cascade blend culling factor, `max(0, 0.8 - cascade_fade)`.
    pub culling_factor: f32,
}

/// Geometry queries the shadow planner needs from the scene's culling
/// collaborator: caster visibility per light, and light-space matrices for
/// cascades, spot cones and cubemap faces.
///
/// Returned projections must use wgpu's clip-space convention (depth in
/// `0..1`, glam's `orthographic_rh` / `perspective_rh`); the atlas stores
/// that depth directly and the tile remap matrices pass it through
/// unchanged.
pub trait ShadowGeometry: Sync {
    fn has_shadow_casters(&self, light_index: usize) -> bool;

    fn directional_cascade(&self, request: &DirectionalCascadeRequest) -> ShadowProjection;

    fn spot_projection(&self, light_index: usize) -> ShadowProjection;

    /// `fov_bias_degrees` widens the 90-degree face frustum so that shadow
    /// filtering stays inside the face.
    fn point_face(&self, light_index: usize, face: usize, fov_bias_degrees: f32) -> ShadowProjection;
}

/// Provided [`ShadowGeometry`] that fits light frusta directly from the
/// camera and the visible-light set. Scenes with their own caster culling
/// can supply their own implementation instead.
pub struct FrustumFitGeometry<'a> {
    pub camera: &'a Camera3D,
    pub viewport: PhysicalSize<u32>,
    pub lights: &'a [VisibleLight],
    pub max_shadow_distance: f32,
    /// Per visible light: does it have on-screen shadow casters this frame.
    pub caster_flags: &'a [bool],
}

impl FrustumFitGeometry<'_> {
    fn cascade_bounds(&self, request: &DirectionalCascadeRequest) -> (f32, f32) {
        let near = self.camera.near.max(0.01);
        let far = (near + self.max_shadow_distance).min(self.camera.far).max(near + 0.01);
        let range = far - near;
        let ratios = request.cascade_ratios;
        let boundary = |index: usize| -> f32 {
            match index {
                0 => near,
                1 => near + range * ratios.x,
                2 => near + range * ratios.y,
                3 => near + range * ratios.z,
                _ => far,
            }
        };
        // With fewer than four cascades the last configured boundary snaps
        // to the far distance.
        let start = boundary(request.cascade_index);
        let end = if request.cascade_index + 1 >= request.cascade_count {
            far
        } else {
            boundary(request.cascade_index + 1)
        };
        (start.min(end - 0.01), end)
    }

    fn light(&self, index: usize) -> &VisibleLight {
        &self.lights[index]
    }
}

impl ShadowGeometry for FrustumFitGeometry<'_> {
    fn has_shadow_casters(&self, light_index: usize) -> bool {
        self.caster_flags.get(light_index).copied().unwrap_or(false)
    }

    fn directional_cascade(&self, request: &DirectionalCascadeRequest) -> ShadowProjection {
        let light = self.light(request.light_index);
        let (near, far) = self.cascade_bounds(request);
        let aspect = self.camera.aspect(self.viewport);
        let corners = self.camera.frustum_corners_world(aspect, near, far);

        let mut center = Vec3::ZERO;
        for corner in &corners {
            center += *corner;
        }
        center /= corners.len() as f32;
        let radius = corners.iter().map(|c| c.distance(center)).fold(0.0f32, f32::max).max(0.01);

        let direction = safe_direction(light.direction);
        let eye = center - direction * (radius + request.near_plane_offset);
        let view = Mat4::look_at_rh(eye, center, stable_up(direction));
        let proj = Mat4::orthographic_rh(
            -radius,
            radius,
            -radius,
            radius,
            0.0,
            2.0 * radius + request.near_plane_offset,
        );
        ShadowProjection { view, proj, culling_sphere: center.extend(radius) }
    }

    fn spot_projection(&self, light_index: usize) -> ShadowProjection {
        let light = self.light(light_index);
        let direction = safe_direction(light.direction);
        let view = Mat4::look_at_rh(light.position, light.position + direction, stable_up(direction));
        let proj = Mat4::perspective_rh(
            light.spot_angle.max(0.01),
            1.0,
            light.shadow_near_plane.max(0.001),
            light.range.max(0.01),
        );
        ShadowProjection { view, proj, culling_sphere: light.position.extend(light.range) }
    }

    fn point_face(&self, light_index: usize, face: usize, fov_bias_degrees: f32) -> ShadowProjection {
        let light = self.light(light_index);
        let (forward, up) = CUBEMAP_FACE_AXES[face.min(CUBEMAP_FACE_COUNT - 1)];
        let view = Mat4::look_at_rh(light.position, light.position + forward, up);
        let fov = (90.0 + fov_bias_degrees).to_radians();
        let proj = Mat4::perspective_rh(
            fov,
            1.0,
            light.shadow_near_plane.max(0.001),
            light.range.max(0.01),
        );
        ShadowProjection { view, proj, culling_sphere: light.position.extend(light.range) }
    }
}

const CUBEMAP_FACE_AXES: [(Vec3, Vec3); CUBEMAP_FACE_COUNT] = [
    (Vec3::X, Vec3::Y),
    (Vec3::NEG_X, Vec3::Y),
    (Vec3::Y, Vec3::NEG_Z),
    (Vec3::NEG_Y, Vec3::Z),
    (Vec3::Z, Vec3::Y),
    (Vec3::NEG_Z, Vec3::Y),
];

fn safe_direction(direction: Vec3) -> Vec3 {
    let normalized = direction.normalize_or_zero();
    if normalized.length_squared() < 1e-4 {
        Vec3::new(0.4, -0.8, 0.35).normalize()
    } else {
        normalized
    }
}

fn stable_up(direction: Vec3) -> Vec3 {
    if direction.dot(Vec3::Y).abs() > 0.95 {
        Vec3::X
    } else {
        Vec3::Y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera3D {
        Camera3D::new(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO, 60.0f32.to_radians(), 0.1, 500.0)
    }

    #[test]
    fn cascade_spheres_grow_with_cascade_index() {
        let camera = camera();
        let lights = [VisibleLight::directional(Vec3::new(0.2, -1.0, 0.1), Vec3::ONE)];
        let flags = [true];
        let geometry = FrustumFitGeometry {
            camera: &camera,
            viewport: PhysicalSize::new(1280, 720),
            lights: &lights,
            max_shadow_distance: 100.0,
            caster_flags: &flags,
        };
        let mut request = DirectionalCascadeRequest {
            light_index: 0,
            cascade_index: 0,
            cascade_count: 4,
            cascade_ratios: Vec3::new(0.1, 0.25, 0.5),
            tile_resolution: 512,
            near_plane_offset: 0.1,
            culling_factor: 0.7,
        };
        let first = geometry.directional_cascade(&request);
        request.cascade_index = 3;
        let last = geometry.directional_cascade(&request);
        assert!(last.culling_sphere.w > first.culling_sphere.w);
    }

    #[test]
    fn cascade_projection_contains_the_sub_frustum() {
        let camera = camera();
        let lights = [VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE)];
        let flags = [true];
        let geometry = FrustumFitGeometry {
            camera: &camera,
            viewport: PhysicalSize::new(1280, 720),
            lights: &lights,
            max_shadow_distance: 50.0,
            caster_flags: &flags,
        };
        let request = DirectionalCascadeRequest {
            light_index: 0,
            cascade_index: 1,
            cascade_count: 4,
            cascade_ratios: Vec3::new(0.1, 0.25, 0.5),
            tile_resolution: 512,
            near_plane_offset: 0.0,
            culling_factor: 0.7,
        };
        let projection = geometry.directional_cascade(&request);
        let view_proj = projection.proj * projection.view;
        let near = camera.near + 50.0 * 0.1;
        let far = camera.near + 50.0 * 0.25;
        for corner in camera.frustum_corners_world(1280.0 / 720.0, near, far) {
            let clip = view_proj * corner.extend(1.0);
            let ndc = clip.truncate() / clip.w;
            assert!(ndc.x.abs() <= 1.001 && ndc.y.abs() <= 1.001, "corner escaped: {ndc:?}");
        }
    }

    #[test]
    fn point_faces_look_along_each_axis() {
        let camera = camera();
        let lights = [VisibleLight::point(Vec3::ZERO, 10.0, Vec3::ONE)];
        let flags = [true];
        let geometry = FrustumFitGeometry {
            camera: &camera,
            viewport: PhysicalSize::new(640, 480),
            lights: &lights,
            max_shadow_distance: 50.0,
            caster_flags: &flags,
        };
        for face in 0..CUBEMAP_FACE_COUNT {
            let projection = geometry.point_face(0, face, 0.0);
            let (forward, _) = CUBEMAP_FACE_AXES[face];
            let probe = forward * 5.0;
            let view_space = projection.view.transform_point3(probe);
            assert!(view_space.z < 0.0, "face {face} does not look at its axis");
        }
    }
}
