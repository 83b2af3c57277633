//!Per-feature print configurations for one layer: line widths, flows and
//!speed profiles, with first-layer speed smoothing.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::geometry::{to_mm, Coord};
use crate::settings::{Settings, SpeedSection};

///The kind of line being printed, written as `;TYPE:` comments and used to
///break down time estimates.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
pub enum PrintFeatureType {
    #[strum(serialize = "NONE")]
    None,
    #[strum(serialize = "WALL-OUTER")]
    OuterWall,
    #[strum(serialize = "WALL-INNER")]
    InnerWall,
    #[strum(serialize = "SKIN")]
    Skin,
    #[strum(serialize = "SUPPORT")]
    Support,
    #[strum(serialize = "SKIRT")]
    SkirtBrim,
    #[strum(serialize = "FILL")]
    Infill,
    #[strum(serialize = "SUPPORT-INFILL")]
    SupportInfill,
    #[strum(serialize = "SUPPORT-INTERFACE")]
    SupportInterface,
    #[strum(serialize = "PRIME-TOWER")]
    PrimeTower,
    #[strum(serialize = "MOVE-UNRETRACTED")]
    MoveUnretracted,
    #[strum(serialize = "MOVE-RETRACTED")]
    MoveRetracted,
    #[strum(serialize = "MOVE-WHILE-RETRACTING")]
    MoveWhileRetracting,
    #[strum(serialize = "MOVE-WHILE-UNRETRACTING")]
    MoveWhileUnretracting,
    #[strum(serialize = "STATIONARY-RETRACT-UNRETRACT")]
    StationaryRetractUnretract,
}

impl PrintFeatureType {
    ///Number of distinct feature kinds, for per-feature accumulation arrays.
    pub const COUNT: usize = 15;

    pub fn index(self) -> usize {
        self as usize
    }

    ///Whether a `;TYPE:` comment should be written for this feature.
    pub fn is_printed_feature(self) -> bool {
        !matches!(
            self,
            PrintFeatureType::None
                | PrintFeatureType::MoveUnretracted
                | PrintFeatureType::MoveRetracted
                | PrintFeatureType::MoveWhileRetracting
                | PrintFeatureType::MoveWhileUnretracting
                | PrintFeatureType::StationaryRetractUnretract
        )
    }
}

///Speed, acceleration and jerk of a path config. Mutable so the first-layer
///speedup can blend it towards a first-layer profile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeedDerivatives {
    pub speed: f64,
    pub acceleration: f64,
    pub jerk: f64,
}

impl SpeedDerivatives {
    pub fn from_section(section: SpeedSection) -> Self {
        SpeedDerivatives {
            speed: section.speed,
            acceleration: section.acceleration,
            jerk: section.jerk,
        }
    }

    ///Blend between a first-layer profile and the nominal profile so that
    ///layer 0 runs the first-layer values and `max_speed_layer` runs nominal.
    pub fn smooth_speed(
        &mut self,
        first_layer: &SpeedDerivatives,
        layer_nr: i64,
        max_speed_layer: i64,
    ) {
        if layer_nr >= max_speed_layer || max_speed_layer <= 0 {
            return;
        }
        let layer_nr = layer_nr.max(0) as f64;
        let max_layer = max_speed_layer as f64;
        self.speed = first_layer.speed + (self.speed - first_layer.speed) * layer_nr / max_layer;
        self.acceleration = first_layer.acceleration
            + (self.acceleration - first_layer.acceleration) * layer_nr / max_layer;
        self.jerk = first_layer.jerk + (self.jerk - first_layer.jerk) * layer_nr / max_layer;
    }
}

///Configuration of one kind of move: line geometry, flow and speed. Paths
///coalesce while their configs compare equal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GCodePathConfig {
    feature: PrintFeatureType,
    line_width: Coord,
    layer_thickness: Coord,
    flow: f64,
    speed_derivatives: SpeedDerivatives,
    is_bridge_path: bool,
    ///Fan override in percent; None keeps the layer's fan speed.
    fan_speed: Option<f64>,
    ///Vertical offset from the nominal layer height, µm.
    z_offset: Coord,
    ///mm³ of filament per mm travelled; derived, kept in sync by
    ///the constructors.
    extrusion_mm3_per_mm: f64,
}

impl GCodePathConfig {
    pub fn new(
        feature: PrintFeatureType,
        line_width: Coord,
        layer_thickness: Coord,
        flow: f64,
        speed: SpeedDerivatives,
    ) -> Self {
        GCodePathConfig {
            feature,
            line_width,
            layer_thickness,
            flow,
            speed_derivatives: speed,
            is_bridge_path: false,
            fan_speed: None,
            z_offset: 0,
            extrusion_mm3_per_mm: calculate_extrusion(line_width, layer_thickness, flow),
        }
    }

    ///A non-extruding config; only the speed fields are meaningful.
    pub fn travel(speed: SpeedDerivatives) -> Self {
        GCodePathConfig {
            feature: PrintFeatureType::MoveUnretracted,
            line_width: 0,
            layer_thickness: 0,
            flow: 0.0,
            speed_derivatives: speed,
            is_bridge_path: false,
            fan_speed: None,
            z_offset: 0,
            extrusion_mm3_per_mm: 0.0,
        }
    }

    pub fn as_bridge(mut self) -> Self {
        self.is_bridge_path = true;
        self
    }

    pub fn with_fan_speed(mut self, fan_speed: f64) -> Self {
        self.fan_speed = Some(fan_speed);
        self
    }

    pub fn with_z_offset(mut self, z_offset: Coord) -> Self {
        self.z_offset = z_offset;
        self
    }

    pub fn with_flow(mut self, flow: f64) -> Self {
        self.flow = flow;
        self.extrusion_mm3_per_mm =
            calculate_extrusion(self.line_width, self.layer_thickness, flow);
        self
    }

    pub fn smooth_speed(&mut self, first_layer: &SpeedDerivatives, layer_nr: i64, max_layer: i64) {
        self.speed_derivatives
            .smooth_speed(first_layer, layer_nr, max_layer);
    }

    pub fn feature(&self) -> PrintFeatureType {
        self.feature
    }

    pub fn speed(&self) -> f64 {
        self.speed_derivatives.speed
    }

    pub fn acceleration(&self) -> f64 {
        self.speed_derivatives.acceleration
    }

    pub fn jerk(&self) -> f64 {
        self.speed_derivatives.jerk
    }

    pub fn line_width(&self) -> Coord {
        self.line_width
    }

    pub fn layer_thickness(&self) -> Coord {
        self.layer_thickness
    }

    pub fn flow_ratio(&self) -> f64 {
        self.flow
    }

    pub fn extrusion_mm3_per_mm(&self) -> f64 {
        self.extrusion_mm3_per_mm
    }

    pub fn is_travel_path(&self) -> bool {
        self.line_width == 0
    }

    pub fn is_bridge_path(&self) -> bool {
        self.is_bridge_path
    }

    pub fn fan_speed(&self) -> Option<f64> {
        self.fan_speed
    }

    pub fn z_offset(&self) -> Coord {
        self.z_offset
    }
}

fn calculate_extrusion(line_width: Coord, layer_thickness: Coord, flow: f64) -> f64 {
    to_mm(line_width) * to_mm(layer_thickness) * flow
}

///All path configs of one mesh on one layer.
#[derive(Clone, Debug)]
pub struct MeshPathConfigs {
    pub inset0_config: GCodePathConfig,
    pub inset_x_config: GCodePathConfig,
    pub inset0_roofing_config: GCodePathConfig,
    pub inset_x_roofing_config: GCodePathConfig,
    pub inset0_flooring_config: GCodePathConfig,
    pub inset_x_flooring_config: GCodePathConfig,
    pub bridge_inset0_config: GCodePathConfig,
    pub bridge_inset_x_config: GCodePathConfig,
    pub skin_config: GCodePathConfig,
    pub bridge_skin_config: GCodePathConfig,
    pub roofing_config: GCodePathConfig,
    pub flooring_config: GCodePathConfig,
    pub infill_config: GCodePathConfig,
    pub ironing_config: GCodePathConfig,
}

impl MeshPathConfigs {
    pub fn new(settings: &Settings, mesh_idx: usize, layer_thickness: Coord) -> Self {
        let mesh = &settings.meshes[mesh_idx];
        let flow = mesh.flow_ratio;
        MeshPathConfigs {
            inset0_config: GCodePathConfig::new(
                PrintFeatureType::OuterWall,
                mesh.wall_line_width_0,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.wall_0),
            ),
            inset_x_config: GCodePathConfig::new(
                PrintFeatureType::InnerWall,
                mesh.wall_line_width_x,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.wall_x),
            ),
            inset0_roofing_config: GCodePathConfig::new(
                PrintFeatureType::OuterWall,
                mesh.wall_line_width_0,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.roofing),
            ),
            inset_x_roofing_config: GCodePathConfig::new(
                PrintFeatureType::InnerWall,
                mesh.wall_line_width_x,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.roofing),
            ),
            inset0_flooring_config: GCodePathConfig::new(
                PrintFeatureType::OuterWall,
                mesh.wall_line_width_0,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.flooring),
            ),
            inset_x_flooring_config: GCodePathConfig::new(
                PrintFeatureType::InnerWall,
                mesh.wall_line_width_x,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.flooring),
            ),
            bridge_inset0_config: GCodePathConfig::new(
                PrintFeatureType::OuterWall,
                mesh.wall_line_width_0,
                layer_thickness,
                flow * mesh.bridge_wall_flow,
                SpeedDerivatives::from_section(mesh.bridge_wall),
            )
            .as_bridge()
            .with_fan_speed(100.0),
            bridge_inset_x_config: GCodePathConfig::new(
                PrintFeatureType::InnerWall,
                mesh.wall_line_width_x,
                layer_thickness,
                flow * mesh.bridge_wall_flow,
                SpeedDerivatives::from_section(mesh.bridge_wall),
            )
            .as_bridge()
            .with_fan_speed(100.0),
            skin_config: GCodePathConfig::new(
                PrintFeatureType::Skin,
                mesh.skin_line_width,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.skin),
            ),
            bridge_skin_config: GCodePathConfig::new(
                PrintFeatureType::Skin,
                mesh.skin_line_width,
                layer_thickness,
                flow * mesh.bridge_skin_flow,
                SpeedDerivatives::from_section(mesh.bridge_skin),
            )
            .as_bridge()
            .with_fan_speed(100.0),
            roofing_config: GCodePathConfig::new(
                PrintFeatureType::Skin,
                mesh.skin_line_width,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.roofing),
            ),
            flooring_config: GCodePathConfig::new(
                PrintFeatureType::Skin,
                mesh.skin_line_width,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.flooring),
            ),
            infill_config: GCodePathConfig::new(
                PrintFeatureType::Infill,
                mesh.infill_line_width,
                layer_thickness,
                flow,
                SpeedDerivatives::from_section(mesh.infill),
            ),
            ironing_config: GCodePathConfig::new(
                PrintFeatureType::Skin,
                mesh.skin_line_width,
                layer_thickness,
                flow * 0.1,
                SpeedDerivatives::from_section(mesh.ironing),
            ),
        }
    }

    fn smooth_all_speeds(&mut self, first_layer: &SpeedDerivatives, layer_nr: i64, max_layer: i64) {
        for config in [
            &mut self.inset0_config,
            &mut self.inset_x_config,
            &mut self.inset0_roofing_config,
            &mut self.inset_x_roofing_config,
            &mut self.inset0_flooring_config,
            &mut self.inset_x_flooring_config,
            &mut self.bridge_inset0_config,
            &mut self.bridge_inset_x_config,
            &mut self.skin_config,
            &mut self.bridge_skin_config,
            &mut self.roofing_config,
            &mut self.flooring_config,
            &mut self.infill_config,
            &mut self.ironing_config,
        ] {
            config.smooth_speed(first_layer, layer_nr, max_layer);
        }
    }
}

///All path configs of one layer: per-extruder travel and helper configs
///plus the per-mesh feature configs.
#[derive(Clone, Debug)]
pub struct PathConfigStorage {
    pub travel_config_per_extruder: Vec<GCodePathConfig>,
    pub skirt_brim_config_per_extruder: Vec<GCodePathConfig>,
    pub prime_tower_config_per_extruder: Vec<GCodePathConfig>,
    pub support_infill_config: Vec<GCodePathConfig>,
    pub support_roof_config: Vec<GCodePathConfig>,
    pub support_bottom_config: Vec<GCodePathConfig>,
    pub raft_base_config: GCodePathConfig,
    pub raft_interface_config: GCodePathConfig,
    pub raft_surface_config: GCodePathConfig,
    pub mesh_configs: Vec<MeshPathConfigs>,
}

impl PathConfigStorage {
    pub fn new(settings: &Settings, layer_nr: i64, layer_thickness: Coord) -> Self {
        let mut storage = PathConfigStorage {
            travel_config_per_extruder: settings
                .extruders
                .iter()
                .map(|ext| GCodePathConfig::travel(SpeedDerivatives::from_section(ext.travel)))
                .collect(),
            skirt_brim_config_per_extruder: settings
                .extruders
                .iter()
                .map(|ext| {
                    GCodePathConfig::new(
                        PrintFeatureType::SkirtBrim,
                        ext.skirt_brim_line_width,
                        layer_thickness,
                        1.0,
                        SpeedDerivatives::from_section(ext.skirt_brim),
                    )
                })
                .collect(),
            prime_tower_config_per_extruder: settings
                .extruders
                .iter()
                .map(|ext| {
                    GCodePathConfig::new(
                        PrintFeatureType::PrimeTower,
                        ext.prime_tower_line_width,
                        layer_thickness,
                        ext.prime_tower_flow,
                        SpeedDerivatives::from_section(ext.prime_tower),
                    )
                })
                .collect(),
            support_infill_config: settings
                .extruders
                .iter()
                .map(|ext| {
                    GCodePathConfig::new(
                        PrintFeatureType::SupportInfill,
                        ext.support_infill_line_width,
                        layer_thickness,
                        1.0,
                        SpeedDerivatives::from_section(ext.support_infill),
                    )
                })
                .collect(),
            support_roof_config: settings
                .extruders
                .iter()
                .map(|ext| {
                    GCodePathConfig::new(
                        PrintFeatureType::SupportInterface,
                        ext.support_roof_line_width,
                        layer_thickness,
                        1.0,
                        SpeedDerivatives::from_section(ext.support_roof),
                    )
                })
                .collect(),
            support_bottom_config: settings
                .extruders
                .iter()
                .map(|ext| {
                    GCodePathConfig::new(
                        PrintFeatureType::SupportInterface,
                        ext.support_bottom_line_width,
                        layer_thickness,
                        1.0,
                        SpeedDerivatives::from_section(ext.support_bottom),
                    )
                })
                .collect(),
            raft_base_config: GCodePathConfig::new(
                PrintFeatureType::SupportInterface,
                settings.extruders[0].nozzle_size * 2,
                settings.raft_base_thickness,
                1.0,
                SpeedDerivatives::from_section(settings.extruders[0].support_infill),
            ),
            raft_interface_config: GCodePathConfig::new(
                PrintFeatureType::Support,
                settings.extruders[0].nozzle_size,
                settings.raft_interface_thickness,
                1.0,
                SpeedDerivatives::from_section(settings.extruders[0].support_infill),
            ),
            raft_surface_config: GCodePathConfig::new(
                PrintFeatureType::SupportInterface,
                settings.extruders[0].nozzle_size,
                settings.raft_surface_thickness,
                1.0,
                SpeedDerivatives::from_section(settings.extruders[0].support_roof),
            ),
            mesh_configs: (0..settings.meshes.len())
                .map(|mesh_idx| MeshPathConfigs::new(settings, mesh_idx, layer_thickness))
                .collect(),
        };
        storage.handle_initial_layer_speedup(settings, layer_nr);
        storage
    }

    fn handle_initial_layer_speedup(&mut self, settings: &Settings, layer_nr: i64) {
        let max_layer = settings.initial_speedup_layer_count as i64;
        if layer_nr >= max_layer {
            return;
        }
        let first_print = SpeedDerivatives::from_section(settings.first_layer_print);
        let first_travel = SpeedDerivatives::from_section(settings.first_layer_travel);
        for config in &mut self.travel_config_per_extruder {
            config.smooth_speed(&first_travel, layer_nr, max_layer);
        }
        for configs in [
            &mut self.skirt_brim_config_per_extruder,
            &mut self.prime_tower_config_per_extruder,
            &mut self.support_infill_config,
            &mut self.support_roof_config,
            &mut self.support_bottom_config,
        ] {
            for config in configs.iter_mut() {
                config.smooth_speed(&first_print, layer_nr, max_layer);
            }
        }
        for mesh_config in &mut self.mesh_configs {
            mesh_config.smooth_all_speeds(&first_print, layer_nr, max_layer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extrusion_derives_from_width_thickness_flow() {
        let config = GCodePathConfig::new(
            PrintFeatureType::OuterWall,
            400,
            200,
            1.0,
            SpeedDerivatives {
                speed: 60.0,
                acceleration: 3000.0,
                jerk: 20.0,
            },
        );
        assert!((config.extrusion_mm3_per_mm() - 0.08).abs() < 1e-12);
        let doubled = config.clone().with_flow(2.0);
        assert!((doubled.extrusion_mm3_per_mm() - 0.16).abs() < 1e-12);
    }

    #[test]
    fn first_layer_uses_first_layer_speed() {
        let settings = Settings::default();
        let configs = PathConfigStorage::new(&settings, 0, settings.layer_height_0);
        let wall = &configs.mesh_configs[0].inset0_config;
        assert_eq!(wall.speed(), settings.first_layer_print.speed);

        let nominal = PathConfigStorage::new(
            &settings,
            settings.initial_speedup_layer_count as i64,
            settings.layer_height,
        );
        assert_eq!(
            nominal.mesh_configs[0].inset0_config.speed(),
            settings.meshes[0].wall_0.speed
        );
    }

    #[test]
    fn speedup_interpolates_between_layers() {
        let settings = Settings::default();
        let halfway = PathConfigStorage::new(&settings, 2, settings.layer_height);
        let wall = &halfway.mesh_configs[0].inset0_config;
        let expected = settings.first_layer_print.speed
            + (settings.meshes[0].wall_0.speed - settings.first_layer_print.speed) * 2.0 / 4.0;
        assert!((wall.speed() - expected).abs() < 1e-9);
    }

    #[test]
    fn travel_config_has_no_extrusion() {
        let settings = Settings::default();
        let configs = PathConfigStorage::new(&settings, 10, settings.layer_height);
        assert!(configs.travel_config_per_extruder[0].is_travel_path());
        assert_eq!(configs.travel_config_per_extruder[0].extrusion_mm3_per_mm(), 0.0);
    }
}
