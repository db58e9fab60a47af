use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Screen tile size used by the Forward+ culler. `Default` resolves to 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TileSize {
    #[default]
    Default,
    Px16,
    Px32,
    Px64,
    Px128,
    Px256,
}

impl TileSize {
    pub fn pixels(self) -> u32 {
        match self {
            TileSize::Default | TileSize::Px16 => 16,
            TileSize::Px32 => 32,
            TileSize::Px64 => 64,
            TileSize::Px128 => 128,
            TileSize::Px256 => 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardPlusConfig {
    #[serde(default)]
    pub tile_size: TileSize,
    /// 0 falls back to the default of 31 lights per tile.
    #[serde(default)]
    pub max_lights_per_tile: u32,
}

impl ForwardPlusConfig {
    pub fn tile_pixel_size(&self) -> f32 {
        self.tile_size.pixels() as f32
    }

    pub fn resolved_max_lights_per_tile(&self) -> usize {
        if self.max_lights_per_tile == 0 {
            31
        } else {
            self.max_lights_per_tile.min(99) as usize
        }
    }
}

impl Default for ForwardPlusConfig {
    fn default() -> Self {
        Self { tile_size: TileSize::Default, max_lights_per_tile: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtlasSize {
    Px256,
    Px512,
    Px1024,
    Px2048,
    Px4096,
    Px8192,
}

impl AtlasSize {
    pub fn pixels(self) -> u32 {
        match self {
            AtlasSize::Px256 => 256,
            AtlasSize::Px512 => 512,
            AtlasSize::Px1024 => 1024,
            AtlasSize::Px2048 => 2048,
            AtlasSize::Px4096 => 4096,
            AtlasSize::Px8192 => 8192,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl FilterQuality {
    /// Filter width in shadow-map texels (PCF 2/3/4).
    pub fn filter_texels(self) -> f32 {
        match self {
            FilterQuality::Low => 2.0,
            FilterQuality::Medium => 3.0,
            FilterQuality::High => 4.0,
        }
    }

    /// One-of-N selector for the shading pass; -1 means no extra filtering.
    pub fn selector(self) -> i32 {
        match self {
            FilterQuality::Low => -1,
            FilterQuality::Medium => 0,
            FilterQuality::High => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CascadeBlend {
    Hard,
    Soft,
    #[default]
    Dither,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShadowMaskMode {
    /// Sample the baked mask everywhere it is available.
    Shadowmask,
    /// Sample the baked mask only beyond the realtime shadow distance.
    #[default]
    DistanceShadowmask,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectionalShadowConfig {
    #[serde(default = "DirectionalShadowConfig::default_atlas_size")]
    pub atlas_size: AtlasSize,
    #[serde(default = "DirectionalShadowConfig::default_cascade_count")]
    pub cascade_count: u32,
    #[serde(default = "DirectionalShadowConfig::default_cascade_ratios")]
    pub cascade_ratios: [f32; 3],
    #[serde(default = "DirectionalShadowConfig::default_cascade_fade")]
    pub cascade_fade: f32,
    #[serde(default)]
    pub cascade_blend: CascadeBlend,
}

impl DirectionalShadowConfig {
    const fn default_atlas_size() -> AtlasSize {
        AtlasSize::Px1024
    }

    const fn default_cascade_count() -> u32 {
        4
    }

    const fn default_cascade_ratios() -> [f32; 3] {
        [0.1, 0.25, 0.5]
    }

    const fn default_cascade_fade() -> f32 {
        0.1
    }

    pub fn resolved_cascade_count(&self) -> usize {
        self.cascade_count.clamp(1, crate::lights::MAX_CASCADES as u32) as usize
    }
}

impl Default for DirectionalShadowConfig {
    fn default() -> Self {
        Self {
            atlas_size: Self::default_atlas_size(),
            cascade_count: Self::default_cascade_count(),
            cascade_ratios: Self::default_cascade_ratios(),
            cascade_fade: Self::default_cascade_fade(),
            cascade_blend: CascadeBlend::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtherShadowConfig {
    #[serde(default = "OtherShadowConfig::default_atlas_size")]
    pub atlas_size: AtlasSize,
}

impl OtherShadowConfig {
    const fn default_atlas_size() -> AtlasSize {
        AtlasSize::Px1024
    }
}

impl Default for OtherShadowConfig {
    fn default() -> Self {
        Self { atlas_size: Self::default_atlas_size() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    #[serde(default = "ShadowConfig::default_max_distance")]
    pub max_distance: f32,
    #[serde(default = "ShadowConfig::default_distance_fade")]
    pub distance_fade: f32,
    #[serde(default)]
    pub filter_quality: FilterQuality,
    #[serde(default)]
    pub mask_mode: ShadowMaskMode,
    #[serde(default)]
    pub directional: DirectionalShadowConfig,
    #[serde(default)]
    pub other: OtherShadowConfig,
}

impl ShadowConfig {
    const fn default_max_distance() -> f32 {
        100.0
    }

    const fn default_distance_fade() -> f32 {
        0.1
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            max_distance: Self::default_max_distance(),
            distance_fade: Self::default_distance_fade(),
            filter_quality: FilterQuality::default(),
            mask_mode: ShadowMaskMode::default(),
            directional: DirectionalShadowConfig::default(),
            other: OtherShadowConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LightingConfig {
    #[serde(default)]
    pub forward_plus: ForwardPlusConfig,
    #[serde(default)]
    pub shadows: ShadowConfig,
}

impl LightingConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lighting config at {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse lighting config at {}", path.display()))
    }
}
