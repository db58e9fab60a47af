pub mod camera3d;
pub mod config;
pub mod lighting;
pub mod lights;

pub use camera3d::Camera3D;
pub use config::{LightingConfig, ShadowConfig};
pub use lighting::geometry::{FrustumFitGeometry, ShadowGeometry};
pub use lighting::shadows::{MeshBuffers, ShadowCasterDraw, ShadowPlanner};
pub use lighting::{FrameInputs, LightingMetrics, LightingPass, LightingPassParams};
pub use lights::{LightKind, ShadowMode, VisibleLight};
