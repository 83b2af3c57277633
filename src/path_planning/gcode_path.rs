use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::geometry::{Coord, Point3};
use crate::path_config::GCodePathConfig;
use crate::path_planning::TimeMaterialEstimates;
use crate::storage::SliceMeshStorage;

///What kind of space filling a path is part of; the exporter and plugins
///use this to group related paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceFillType {
    None,
    Polygons,
    PolyLines,
    Lines,
}

///One contiguous planned motion of uniform configuration.
///
///A path is either a travel (its config has no extrusion) or an extrusion.
///Paths are created by the layer planner, mutated until `done` is set, and
///immutable afterwards.
#[derive(Clone, Debug)]
pub struct GCodePath {
    pub config: GCodePathConfig,
    ///The mesh this path came from, if any. Shared with the slice storage;
    ///the storage outlives every layer plan.
    pub mesh: Option<Arc<SliceMeshStorage>>,
    pub space_fill_type: SpaceFillType,
    ///Flow modifier on top of the config flow.
    pub flow: f64,
    ///Line width modifier; also feeds back-pressure compensation.
    pub width_factor: f64,
    ///Gradually increase Z over this path (vase mode).
    pub spiralize: bool,
    ///Speed modifier on top of the config speed.
    pub speed_factor: f64,
    ///Extra speed factor applied by back-pressure compensation.
    pub speed_back_pressure_factor: f64,
    ///This is a travel path preceded by a retraction.
    pub retract: bool,
    ///Unretract just before the last travel segment, so the unretraction
    ///happens right next to the following outer wall.
    pub unretract_before_last_travel_move: bool,
    ///Z hop during this (travel) path.
    pub perform_z_hop: bool,
    ///Prime before this path starts extruding.
    pub perform_prime: bool,
    ///Vertical offset on top of the config z offset, µm.
    pub z_offset: Coord,
    pub points: Vec<Point3>,
    ///No more points may be added; the next move starts a new path.
    pub done: bool,
    ///Fan override in percent; None falls back to the config.
    pub fan_speed: Option<f64>,
    pub estimates: TimeMaterialEstimates,
}

impl GCodePath {
    pub fn new(
        config: GCodePathConfig,
        mesh: Option<Arc<SliceMeshStorage>>,
        space_fill_type: SpaceFillType,
        flow: f64,
        width_factor: f64,
        spiralize: bool,
        speed_factor: f64,
    ) -> Self {
        GCodePath {
            config,
            mesh,
            space_fill_type,
            flow,
            width_factor,
            spiralize,
            speed_factor,
            speed_back_pressure_factor: 1.0,
            retract: false,
            unretract_before_last_travel_move: false,
            perform_z_hop: false,
            perform_prime: false,
            z_offset: 0,
            points: vec![],
            done: false,
            fan_speed: None,
            estimates: TimeMaterialEstimates::default(),
        }
    }

    pub fn is_travel_path(&self) -> bool {
        self.config.is_travel_path()
    }

    ///Material flow in mm³ per mm traversed, with path modifiers applied.
    pub fn extrusion_mm3_per_mm(&self) -> f64 {
        self.config.extrusion_mm3_per_mm() * self.flow * self.width_factor
    }

    ///The effective fan speed: the override if set, the config otherwise.
    pub fn fan_speed(&self) -> Option<f64> {
        match self.fan_speed {
            Some(speed) if (0.0..=100.0).contains(&speed) => Some(speed),
            _ => self.config.fan_speed(),
        }
    }

    ///Print speed of this path with all factors applied.
    pub fn effective_speed(&self) -> f64 {
        self.config.speed() * self.speed_factor * self.speed_back_pressure_factor
    }

    ///Total XY length of the path from `start`, µm.
    pub fn length(&self, start: Point3) -> Coord {
        let mut total = 0;
        let mut last = start;
        for p in &self.points {
            total += (p.xy() - last.xy()).vsize();
            last = *p;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_config::{PrintFeatureType, SpeedDerivatives};

    fn wall_config() -> GCodePathConfig {
        GCodePathConfig::new(
            PrintFeatureType::OuterWall,
            400,
            200,
            1.0,
            SpeedDerivatives {
                speed: 50.0,
                acceleration: 1000.0,
                jerk: 10.0,
            },
        )
    }

    #[test]
    fn flow_and_width_factor_scale_extrusion() {
        let mut path = GCodePath::new(
            wall_config(),
            None,
            SpaceFillType::Polygons,
            1.0,
            1.0,
            false,
            1.0,
        );
        let base = path.extrusion_mm3_per_mm();
        path.flow = 0.5;
        path.width_factor = 0.5;
        assert!((path.extrusion_mm3_per_mm() - base * 0.25).abs() < 1e-12);
    }

    #[test]
    fn out_of_range_fan_override_falls_back_to_config() {
        let mut path = GCodePath::new(
            wall_config().with_fan_speed(70.0),
            None,
            SpaceFillType::Polygons,
            1.0,
            1.0,
            false,
            1.0,
        );
        path.fan_speed = Some(250.0);
        assert_eq!(path.fan_speed(), Some(70.0));
        path.fan_speed = Some(30.0);
        assert_eq!(path.fan_speed(), Some(30.0));
    }
}
