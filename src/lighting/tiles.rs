use glam::{Vec2, Vec4};
use rayon::prelude::*;
use winit::dpi::PhysicalSize;

/// Screen-tile grid derived from the attachment size and tile pixel size.
#[derive(Clone, Copy, Debug, Default)]
pub struct TileGrid {
    pub tiles_per_row: usize,
    pub tile_rows: usize,
    /// Scales a normalized screen UV into tile coordinates.
    pub screen_uv_to_tile: Vec2,
}

impl TileGrid {
    pub fn new(attachment_size: PhysicalSize<u32>, tile_pixel_size: f32) -> Self {
        let screen_uv_to_tile = Vec2::new(
            attachment_size.width as f32 / tile_pixel_size,
            attachment_size.height as f32 / tile_pixel_size,
        );
        Self {
            tiles_per_row: screen_uv_to_tile.x.ceil() as usize,
            tile_rows: screen_uv_to_tile.y.ceil() as usize,
            screen_uv_to_tile,
        }
    }

    pub fn tile_count(&self) -> usize {
        self.tiles_per_row * self.tile_rows
    }

    /// Normalized UV extent of one tile.
    pub fn tile_uv_size(&self) -> Vec2 {
        Vec2::new(1.0 / self.screen_uv_to_tile.x, 1.0 / self.screen_uv_to_tile.y)
    }
}

pub struct TileCullingParams<'a> {
    /// Screen-space bounding rectangles `(min_x, min_y, max_x, max_y)`, one
    /// per point/spot light, in ascending record order.
    pub light_bounds: &'a [Vec4],
    pub other_light_count: usize,
    pub max_lights_per_tile: usize,
    /// Words per tile: one count header plus `max_lights_per_tile` indices.
    pub tile_data_size: usize,
    pub grid: TileGrid,
}

/// Fills the per-tile light lists. Each tile owns a disjoint fixed-stride
/// slice of `tile_data`, so rows can be processed in parallel without
/// synchronization; the caller observes a single join when this returns.
pub fn fill_tile_data(params: &TileCullingParams<'_>, tile_data: &mut [u32]) {
    let row_stride = params.grid.tiles_per_row * params.tile_data_size;
    if row_stride == 0 {
        return;
    }
    let tile_uv_size = params.grid.tile_uv_size();
    tile_data.par_chunks_mut(row_stride).enumerate().for_each(|(y, row)| {
        for (x, tile) in row.chunks_mut(params.tile_data_size).enumerate() {
            cull_tile(x, y, params, tile_uv_size, tile);
        }
    });
}

/// Scans lights in ascending index order and records the first
/// `max_lights_per_tile` whose screen rectangle overlaps the tile. The
/// early exit on the cap deliberately drops higher-indexed lights.
fn cull_tile(x: usize, y: usize, params: &TileCullingParams<'_>, tile_uv_size: Vec2, tile: &mut [u32]) {
    let tile_bounds = Vec4::new(x as f32, y as f32, (x + 1) as f32, (y + 1) as f32)
        * Vec4::new(tile_uv_size.x, tile_uv_size.y, tile_uv_size.x, tile_uv_size.y);
    let mut lights_in_tile = 0usize;
    for (index, bounds) in params.light_bounds.iter().take(params.other_light_count).enumerate() {
        // Overlap iff light.min <= tile.max and tile.min <= light.max.
        let lhs = Vec4::new(bounds.x, bounds.y, tile_bounds.x, tile_bounds.y);
        let rhs = Vec4::new(tile_bounds.z, tile_bounds.w, bounds.z, bounds.w);
        if lhs.cmple(rhs).all() {
            lights_in_tile += 1;
            tile[lights_in_tile] = index as u32;
            if lights_in_tile >= params.max_lights_per_tile {
                break;
            }
        }
    }
    tile[0] = lights_in_tile as u32;
}
