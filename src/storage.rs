//!The input contract of the planner: per-layer geometry handed over by the
//!external slicing pipeline. Everything here is plain data, read-only once a
//!layer enters planning.

use std::sync::Arc;

use crate::geometry::{Coord, ExtrusionLine, Polyline, Shape};

///A band of overhanging wall area with the speed modifier to print it at.
#[derive(Clone, Debug, Default)]
pub struct OverhangBand {
    pub region: Shape,
    pub speed_ratio: f64,
}

///A skin region of a part with its generated lines.
#[derive(Clone, Debug, Default)]
pub struct SkinPart {
    pub outline: Shape,
    pub skin_lines: Vec<Polyline>,
    ///Direction along which the skin lines should print monotonically,
    ///radians; None prints them in travel-optimized order.
    pub monotonic_direction: Option<f64>,
    pub is_roofing: bool,
    pub is_flooring: bool,
}

///One connected region of a mesh on one layer.
#[derive(Clone, Debug, Default)]
pub struct SliceLayerPart {
    pub outline: Shape,
    ///Wall toolpaths grouped by inset index; 0 is the outermost wall.
    pub wall_toolpaths: Vec<Vec<ExtrusionLine>>,
    pub skin_parts: Vec<SkinPart>,
    pub infill_lines: Vec<Polyline>,
    pub infill_area: Shape,
    ///Unsupported wall regions that need bridging.
    pub bridge_mask: Shape,
    ///Wall regions exposed to air above.
    pub roofing_mask: Shape,
    ///Wall regions exposed to air below.
    pub flooring_mask: Shape,
    ///Progressively more overhanging wall regions, outermost band last.
    pub overhang_bands: Vec<OverhangBand>,
    ///Regions where seams should not be placed.
    pub seam_overhang_mask: Shape,
}

///One layer of a mesh.
#[derive(Clone, Debug, Default)]
pub struct SliceLayer {
    ///Top of the layer, µm.
    pub z: Coord,
    pub thickness: Coord,
    pub parts: Vec<SliceLayerPart>,
}

///All layers of one mesh, with the index of its settings entry.
#[derive(Clone, Debug, Default)]
pub struct SliceMeshStorage {
    pub name: String,
    ///Index into `Settings::meshes`.
    pub settings_idx: usize,
    ///The extruder printing the walls of this mesh.
    pub extruder_nr: usize,
    pub layers: Vec<SliceLayer>,
}

///Support areas of one layer.
#[derive(Clone, Debug, Default)]
pub struct SupportLayer {
    pub infill: Shape,
    pub infill_lines: Vec<Polyline>,
    pub roofs: Shape,
    pub roof_lines: Vec<Polyline>,
    pub bottoms: Shape,
    pub bottom_lines: Vec<Polyline>,
}

#[derive(Clone, Debug, Default)]
pub struct SupportStorage {
    pub layers: Vec<SupportLayer>,
    pub extruder_nr: usize,
}

///Everything the planner consumes for a whole print.
#[derive(Clone, Debug, Default)]
pub struct SliceDataStorage {
    pub meshes: Vec<Arc<SliceMeshStorage>>,
    pub support: SupportStorage,
    ///Skirt or brim contours, per extruder.
    pub skirt_brim: Vec<Vec<Shape>>,
    pub raft_outline: Shape,
    ///Prime tower contours, per extruder, outside-in.
    pub prime_tower: Vec<Shape>,
    ///Whether each extruder is used anywhere in the print.
    pub extruder_is_used: Vec<bool>,
    pub total_layers: usize,
}

impl SliceDataStorage {
    ///Union of all printable areas on a layer, used to build comb
    ///boundaries and to check whether positions are inside the print.
    pub fn layer_outlines(&self, layer_nr: i64) -> Shape {
        let mut result = Shape::default();
        if layer_nr < 0 {
            return result;
        }
        for mesh in &self.meshes {
            if let Some(layer) = mesh.layers.get(layer_nr as usize) {
                for part in &layer.parts {
                    for polygon in part.outline.iter() {
                        result.push(polygon.clone());
                    }
                }
            }
        }
        result
    }
}
