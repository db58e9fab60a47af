use glam::Vec4;
use lantern_rp::lighting::tiles::{fill_tile_data, TileCullingParams, TileGrid};
use winit::dpi::PhysicalSize;

fn run(grid: TileGrid, bounds: &[Vec4], max_lights_per_tile: usize) -> Vec<u32> {
    let params = TileCullingParams {
        light_bounds: bounds,
        other_light_count: bounds.len(),
        max_lights_per_tile,
        tile_data_size: max_lights_per_tile + 1,
        grid,
    };
    let mut data = vec![0u32; grid.tile_count() * params.tile_data_size];
    fill_tile_data(&params, &mut data);
    data
}

#[test]
fn tile_lists_match_brute_force_overlap() {
    let grid = TileGrid::new(PhysicalSize::new(320, 240), 16.0);
    // Deterministic spread of rectangles, including degenerate and
    // tile-boundary-aligned ones.
    let mut bounds = Vec::new();
    for i in 0..24u32 {
        let fx = (i % 5) as f32 / 5.0;
        let fy = (i % 7) as f32 / 7.0;
        let w = 0.05 + (i % 3) as f32 * 0.15;
        let h = 0.05 + (i % 4) as f32 * 0.1;
        bounds.push(Vec4::new(fx, fy, (fx + w).min(1.0), (fy + h).min(1.0)));
    }
    bounds.push(Vec4::new(0.25, 0.25, 0.25, 0.25));

    let stride = bounds.len() + 1;
    let data = run(grid, &bounds, bounds.len());
    let tile_uv = grid.tile_uv_size();

    for ty in 0..grid.tile_rows {
        for tx in 0..grid.tiles_per_row {
            let tile_min_x = tx as f32 * tile_uv.x;
            let tile_min_y = ty as f32 * tile_uv.y;
            let tile_max_x = (tx + 1) as f32 * tile_uv.x;
            let tile_max_y = (ty + 1) as f32 * tile_uv.y;
            let expected: Vec<u32> = bounds
                .iter()
                .enumerate()
                .filter(|(_, b)| {
                    b.x <= tile_max_x && b.y <= tile_max_y && tile_min_x <= b.z && tile_min_y <= b.w
                })
                .map(|(i, _)| i as u32)
                .collect();
            let tile = &data[(ty * grid.tiles_per_row + tx) * stride..][..stride];
            assert_eq!(tile[0] as usize, expected.len(), "tile ({tx},{ty}) count");
            assert_eq!(&tile[1..=expected.len()], &expected[..], "tile ({tx},{ty}) members");
        }
    }
}

#[test]
fn small_light_only_lands_in_covered_tiles() {
    let grid = TileGrid::new(PhysicalSize::new(160, 160), 16.0);
    let bounds = [Vec4::new(0.42, 0.42, 0.58, 0.58)];
    let data = run(grid, &bounds, 4);
    let stride = 5;

    for ty in 0..grid.tile_rows {
        for tx in 0..grid.tiles_per_row {
            let count = data[(ty * grid.tiles_per_row + tx) * stride];
            // 0.42..0.58 covers tiles 4..=5 on a 10-tile axis.
            let covered = (4..=5).contains(&tx) && (4..=5).contains(&ty);
            assert_eq!(count, covered as u32, "tile ({tx},{ty})");
        }
    }
}

#[test]
fn boundary_touching_light_is_included() {
    // A rectangle ending exactly on a tile edge still counts for the tile
    // that starts there.
    let grid = TileGrid::new(PhysicalSize::new(64, 64), 16.0);
    let bounds = [Vec4::new(0.0, 0.0, 0.25, 0.25)];
    let data = run(grid, &bounds, 2);
    let stride = 3;
    assert_eq!(data[0], 1);
    // Tile (1,1) starts at 0.25: the closed comparison keeps the light.
    assert_eq!(data[(grid.tiles_per_row + 1) * stride], 1);
    // Tile (2,2) starts at 0.5 and misses it.
    assert_eq!(data[(2 * grid.tiles_per_row + 2) * stride], 0);
}

#[test]
fn oversubscribed_tile_keeps_ascending_prefix() {
    let grid = TileGrid::new(PhysicalSize::new(16, 16), 16.0);
    let bounds = vec![Vec4::new(0.0, 0.0, 1.0, 1.0); 8];
    let data = run(grid, &bounds, 4);
    assert_eq!(&data[..5], &[4, 0, 1, 2, 3]);
}
