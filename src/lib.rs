//!Layer planning and G-code path emission for fused-filament printing.
//!
//!Given the per-layer geometry produced by an external slicing pipeline
//!(walls, skin, infill, support, prime tower, raft) and a settings bundle,
//!this crate plans an ordered, time- and material-accurate sequence of
//!machine motions and writes the G-code that drives the printer.
//!
//!The flow through the crate: ordering decisions ([`path_order`],
//![`inset_order`]) feed the [`layer_plan::LayerPlan`], which uses the
//![`comb::Comb`] for travels and [`path_config`] for per-feature tuning.
//!The resulting extruder plans pass through the [`buffer::LayerPlanBuffer`]
//!for look-ahead decisions and end up in the [`export::GCodeExport`], which
//!consults the [`time_estimate`] module and the [`template`] resolver.

pub mod buffer;
pub mod comb;
pub mod error;
pub mod export;
pub mod extruder_plan;
pub mod geometry;
pub mod inset_order;
pub mod layer_plan;
pub mod path_config;
pub mod path_order;
pub mod path_planning;
pub mod raft;
pub mod settings;
pub mod storage;
pub mod template;
pub mod time_estimate;

pub use buffer::LayerPlanBuffer;
pub use comb::{Comb, CombResult};
pub use error::SlicerError;
pub use export::GCodeExport;
pub use extruder_plan::ExtruderPlan;
pub use layer_plan::{LayerPlan, OverhangMask, PlanModifier};
pub use path_config::{GCodePathConfig, MeshPathConfigs, PathConfigStorage, PrintFeatureType};
pub use path_order::{make_order_transitive, OrderedPath, PathOrderOptimizer};
pub use path_planning::{GCodePath, NozzleTempInsert, SpaceFillType, TimeMaterialEstimates};
pub use settings::{GCodeFlavor, SeamCornerPref, SeamType, Settings, ZSeamConfig};
pub use storage::{SliceDataStorage, SliceLayer, SliceLayerPart, SliceMeshStorage};
pub use template::{resolve_gcode_template, TemplateEnvironment};
pub use time_estimate::TimeEstimateCalculator;
