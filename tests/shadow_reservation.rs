use glam::{Mat4, Vec3, Vec4};
use lantern_rp::config::LightingConfig;
use lantern_rp::lighting::geometry::{DirectionalCascadeRequest, ShadowGeometry, ShadowProjection};
use lantern_rp::lighting::shadows::atlas_split;
use lantern_rp::lighting::{FrameInputs, LightingPass};
use lantern_rp::lights::{ShadowMode, VisibleLight};
use winit::dpi::PhysicalSize;

/// Geometry stub with a fixed caster answer and well-formed matrices, so
/// reservation and planning run without a scene.
struct StubGeometry {
    has_casters: bool,
}

impl ShadowGeometry for StubGeometry {
    fn has_shadow_casters(&self, _light_index: usize) -> bool {
        self.has_casters
    }

    fn directional_cascade(&self, request: &DirectionalCascadeRequest) -> ShadowProjection {
        let radius = 5.0 + request.cascade_index as f32 * 5.0;
        ShadowProjection {
            view: Mat4::look_at_rh(Vec3::new(0.0, 20.0, 0.0), Vec3::ZERO, Vec3::X),
            proj: Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, 40.0),
            culling_sphere: Vec4::new(0.0, 0.0, 0.0, radius),
        }
    }

    fn spot_projection(&self, _light_index: usize) -> ShadowProjection {
        ShadowProjection {
            view: Mat4::IDENTITY,
            proj: Mat4::perspective_rh(1.2, 1.0, 0.1, 20.0),
            culling_sphere: Vec4::new(0.0, 0.0, 0.0, 20.0),
        }
    }

    fn point_face(&self, _light_index: usize, _face: usize, fov_bias_degrees: f32) -> ShadowProjection {
        ShadowProjection {
            view: Mat4::IDENTITY,
            proj: Mat4::perspective_rh((90.0 + fov_bias_degrees).to_radians(), 1.0, 0.1, 20.0),
            culling_sphere: Vec4::new(0.0, 0.0, 0.0, 20.0),
        }
    }
}

fn assemble(lights: &[VisibleLight], has_casters: bool) -> LightingPass {
    let config = LightingConfig::default();
    let geometry = StubGeometry { has_casters };
    let mut pass = LightingPass::new();
    pass.assemble(&FrameInputs {
        lights,
        camera_layer_mask: u32::MAX,
        viewport: PhysicalSize::new(1280, 720),
        geometry: &geometry,
        config: &config,
    });
    pass
}

#[test]
fn unshadowed_light_gets_negative_sentinel() {
    let lights = [VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE)];
    let pass = assemble(&lights, true);
    assert_eq!(pass.directional_records()[0].shadow_data, [0.0, 0.0, 0.0, -1.0]);
    assert_eq!(pass.shadows().reserved_directional_count(), 0);
}

#[test]
fn zero_strength_is_treated_as_unshadowed() {
    let lights =
        [VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE).with_shadows(ShadowMode::Soft, 0.0)];
    let pass = assemble(&lights, true);
    assert_eq!(pass.directional_records()[0].shadow_data[3], -1.0);
}

#[test]
fn directional_tile_start_steps_by_cascade_count() {
    let lights = [
        VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE).with_shadows(ShadowMode::Soft, 1.0),
        VisibleLight::directional(Vec3::NEG_X, Vec3::ONE).with_shadows(ShadowMode::Hard, 0.5),
    ];
    let pass = assemble(&lights, true);
    // Default config uses four cascades.
    assert_eq!(pass.directional_records()[0].shadow_data[0], 0.0);
    assert_eq!(pass.directional_records()[1].shadow_data[0], 4.0);
    assert_eq!(pass.shadows().reserved_directional_count(), 2);
    assert_eq!(pass.shadows().directional_matrices().len(), 8);
    assert_eq!(pass.shadows().cascades().len(), 4);
}

#[test]
fn directional_reservation_caps_at_four() {
    let lights: Vec<VisibleLight> = (0..6)
        .map(|_| VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE).with_shadows(ShadowMode::Soft, 1.0))
        .collect();
    let pass = assemble(&lights, true);
    assert_eq!(pass.shadows().reserved_directional_count(), 4);
    // Lights five and six are dropped with the record cap.
    assert_eq!(pass.directional_records().len(), 4);
    assert_eq!(pass.shadows().directional_matrices().len(), 16);
}

#[test]
fn no_casters_means_baked_only_strength() {
    let lights =
        [VisibleLight::directional(Vec3::NEG_Y, Vec3::ONE).with_shadows(ShadowMode::Soft, 0.8)];
    let pass = assemble(&lights, false);
    assert_eq!(pass.shadows().reserved_directional_count(), 0);
    assert_eq!(pass.directional_records()[0].shadow_data[1], -0.8);
}

#[test]
fn point_lights_take_six_tiles_until_the_atlas_is_full() {
    let lights: Vec<VisibleLight> = (0..5)
        .map(|i| {
            VisibleLight::point(Vec3::new(i as f32, 1.0, 0.0), 8.0, Vec3::ONE)
                .with_shadows(ShadowMode::Soft, 1.0)
        })
        .collect();
    let pass = assemble(&lights, true);
    // Two point lights fit (12 of 16 tiles); the third would need 18.
    assert_eq!(pass.shadows().reserved_other_tile_count(), 12);
    let records = pass.other_records();
    assert_eq!(records[0].shadow_data[0], 0.0);
    assert_eq!(records[0].shadow_data[2], 1.0);
    assert_eq!(records[1].shadow_data[0], 6.0);
    assert_eq!(records[2].shadow_data[1], -1.0);
    assert_eq!(records[4].shadow_data[1], -1.0);
    assert_eq!(pass.shadows().other_tile_data().len(), 12);
}

#[test]
fn spot_and_point_share_the_other_atlas() {
    let lights = [
        VisibleLight::spot(Vec3::ZERO, Vec3::NEG_Z, 10.0, 1.0, Vec3::ONE)
            .with_shadows(ShadowMode::Hard, 0.9),
        VisibleLight::point(Vec3::ONE, 8.0, Vec3::ONE).with_shadows(ShadowMode::Soft, 1.0),
    ];
    let pass = assemble(&lights, true);
    let records = pass.other_records();
    assert_eq!(records[0].shadow_data[..3], [0.0, 0.9, 0.0]);
    assert_eq!(records[1].shadow_data[..3], [1.0, 1.0, 1.0]);
    assert_eq!(pass.shadows().reserved_other_tile_count(), 7);
}

#[test]
fn baked_mask_channel_rides_in_the_last_lane() {
    let mut light =
        VisibleLight::point(Vec3::ZERO, 8.0, Vec3::ONE).with_shadows(ShadowMode::Soft, 1.0);
    light.baked_mask_channel = Some(2);
    let lights = [light];
    let pass = assemble(&lights, true);
    assert_eq!(pass.other_records()[0].shadow_data[3], 2.0);
    assert!(pass.shadows().shadow_mask_used());
    assert_eq!(pass.uniform().counts[3], 1);
}

#[test]
fn atlas_split_grows_with_reserved_tiles() {
    assert_eq!(atlas_split(1), 1);
    assert_eq!(atlas_split(4), 2);
    assert_eq!(atlas_split(7), 4);

    // One spot light: whole atlas is one tile.
    let one = [VisibleLight::spot(Vec3::ZERO, Vec3::NEG_Z, 10.0, 1.0, Vec3::ONE)
        .with_shadows(ShadowMode::Hard, 1.0)];
    let pass = assemble(&one, true);
    let sizes = pass.shadows().atlas_sizes();
    assert_eq!(sizes.z, 1024.0);
    assert_eq!(sizes.w, 1.0 / 1024.0);
    let tile = pass.shadows().other_tile_data()[0];
    let border = 0.5 / 1024.0;
    assert!((tile.tile_data[2] - (1.0 - 2.0 * border)).abs() < 1e-7);
}
