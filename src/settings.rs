use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::SlicerError;
use crate::geometry::{Coord, Point};

macro_rules! setting_less_than_or_equal_to_zero {
    ($settings:expr, $setting:ident) => {{
        if ($settings.$setting as f64) <= 0.0 {
            return Err(SlicerError::SettingLessThanOrEqualToZero {
                setting: stringify!($setting).to_string(),
                value: $settings.$setting as f64,
            });
        }
    }};
}

macro_rules! setting_less_than_zero {
    ($settings:expr, $setting:ident) => {{
        if ($settings.$setting as f64) < 0.0 {
            return Err(SlicerError::SettingLessThanZero {
                setting: stringify!($setting).to_string(),
                value: $settings.$setting as f64,
            });
        }
    }};
}

///The dialect of G-code to emit.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
pub enum GCodeFlavor {
    #[strum(serialize = "Marlin")]
    Marlin,
    #[strum(serialize = "RepRap")]
    RepRap,
    #[strum(serialize = "UltiGCode")]
    UltiGCode,
    #[strum(serialize = "Makerbot")]
    Makerbot,
    #[strum(serialize = "BFB")]
    Bfb,
    #[strum(serialize = "Mach3")]
    Mach3,
    #[strum(serialize = "Griffin")]
    Griffin,
    #[strum(serialize = "Repetier")]
    Repetier,
    #[strum(serialize = "Marlin(Volumetric)")]
    MarlinVolumetric,
}

impl GCodeFlavor {
    ///Whether E values are cubic millimeters instead of filament millimeters.
    pub fn is_volumetric(self) -> bool {
        matches!(self, GCodeFlavor::UltiGCode | GCodeFlavor::MarlinVolumetric)
    }

    ///Whether the flavor has a separate travel acceleration command.
    pub fn has_travel_acceleration(self) -> bool {
        matches!(self, GCodeFlavor::Marlin | GCodeFlavor::MarlinVolumetric)
    }
}

///How travel moves may be routed through the layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum CombingMode {
    ///No combing; travels go straight with retraction.
    Off,
    ///Comb through everything printed this layer.
    All,
    ///Comb, but never across top/bottom skin.
    NoSkin,
    ///Comb only within infill.
    Infill,
}

///Where the seam of a closed contour should be placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum SeamType {
    ///A random vertex on each contour.
    Random,
    ///The vertex closest to a user-specified position.
    UserSpecified,
    ///The vertex closest to the previous position.
    Shortest,
    ///The vertex with the sharpest corner.
    SharpestCorner,
}

///Filter/preference on corner shape when placing a seam.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum SeamCornerPref {
    None,
    Inner,
    Outer,
    Any,
    Weighted,
}

///Seam placement configuration for closed contours.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZSeamConfig {
    pub seam_type: SeamType,
    ///Target position for `UserSpecified` seams.
    pub pos: Point,
    pub corner_pref: SeamCornerPref,
}

impl Default for ZSeamConfig {
    fn default() -> Self {
        ZSeamConfig {
            seam_type: SeamType::Shortest,
            pos: Point::default(),
            corner_pref: SeamCornerPref::None,
        }
    }
}

///Speed, acceleration and jerk for one kind of move.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeedSection {
    ///mm/s
    pub speed: f64,
    ///mm/s²
    pub acceleration: f64,
    ///Instantaneous speed change at a corner, mm/s.
    pub jerk: f64,
}

impl SpeedSection {
    pub fn new(speed: f64, acceleration: f64, jerk: f64) -> Self {
        SpeedSection {
            speed,
            acceleration,
            jerk,
        }
    }
}

///Retraction behavior of one extruder, also used for extruder switches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetractionSettings {
    pub enabled: bool,
    ///Filament length to pull back, mm.
    pub amount: f64,
    ///mm/s
    pub speed: f64,
    ///mm/s, used when pushing the filament back.
    pub prime_speed: f64,
    ///Extra material to prime after an unretract, mm³.
    pub prime_volume: f64,
    ///Travels shorter than this never retract, µm.
    pub min_travel: Coord,
    ///Maximum number of retractions within `extrusion_window`.
    pub count_max: usize,
    ///Window in mm of extruded filament over which `count_max` is enforced.
    pub extrusion_window: f64,
    pub hop_enabled: bool,
    ///Z hop height, µm.
    pub hop: Coord,
    ///mm/s
    pub hop_speed: f64,
}

impl Default for RetractionSettings {
    fn default() -> Self {
        RetractionSettings {
            enabled: true,
            amount: 6.5,
            speed: 25.0,
            prime_speed: 25.0,
            prime_volume: 0.0,
            min_travel: 1_500,
            count_max: 90,
            extrusion_window: 4.5,
            hop_enabled: false,
            hop: 200,
            hop_speed: 10.0,
        }
    }
}

///Distribution of a retraction over the phases of a travel move, so the
///nozzle keeps moving while the filament is pulled back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AntiOozeSettings {
    pub enabled: bool,
    ///Fraction of the retraction done before the head starts moving.
    pub still_ratio: f64,
    ///Fraction done during the z-hop (if any).
    pub zhop_ratio: f64,
    ///Retraction speed during travel, mm/s.
    pub speed: f64,
}

impl Default for AntiOozeSettings {
    fn default() -> Self {
        AntiOozeSettings {
            enabled: false,
            still_ratio: 0.25,
            zhop_ratio: 0.25,
            speed: 20.0,
        }
    }
}

///Fan and minimum-layer-time limits of one extruder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanSpeedLayerTimeSettings {
    ///Layers must take at least this long, seconds.
    pub cool_min_layer_time: f64,
    ///Below this layer time the fan runs at maximum, seconds.
    pub cool_min_layer_time_fan_speed_max: f64,
    ///Fan speed on the very first layer, percent.
    pub cool_fan_speed_0: f64,
    ///Regular fan speed, percent.
    pub cool_fan_speed_min: f64,
    ///Fan speed when layers print too fast, percent.
    pub cool_fan_speed_max: f64,
    ///Print moves never slow down below this, mm/s.
    pub cool_min_speed: f64,
    ///The layer at which the fan reaches its regular speed.
    pub cool_fan_full_layer: usize,
}

impl Default for FanSpeedLayerTimeSettings {
    fn default() -> Self {
        FanSpeedLayerTimeSettings {
            cool_min_layer_time: 5.0,
            cool_min_layer_time_fan_speed_max: 10.0,
            cool_fan_speed_0: 0.0,
            cool_fan_speed_min: 100.0,
            cool_fan_speed_max: 100.0,
            cool_min_speed: 10.0,
            cool_fan_full_layer: 2,
        }
    }
}

///Coasting: finish paths on residual nozzle pressure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoastingSettings {
    pub enabled: bool,
    ///Volume to coast at the end of a path, mm³.
    pub volume: f64,
    ///Paths must extrude at least this much for partial coasting, mm³.
    pub min_volume: f64,
    ///Coasting move speed as a ratio of the path speed.
    pub speed_ratio: f64,
}

impl Default for CoastingSettings {
    fn default() -> Self {
        CoastingSettings {
            enabled: false,
            volume: 0.064,
            min_volume: 0.8,
            speed_ratio: 0.9,
        }
    }
}

///Nozzle wipe script executed after a configurable amount of extrusion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WipeScriptSettings {
    ///Run the script each time this much material was extruded, mm³; zero
    ///disables the script.
    pub max_extrusion_before_wipe: f64,
    pub retraction_enable: bool,
    ///mm
    pub retraction_amount: f64,
    ///mm/s
    pub retraction_speed: f64,
    ///Seconds to pause after retracting.
    pub pause: f64,
    pub hop_enable: bool,
    ///µm
    pub hop_amount: Coord,
    ///mm/s
    pub hop_speed: f64,
    ///X of the wipe brush, µm.
    pub brush_pos_x: Coord,
    pub repeat_count: usize,
    ///Length of each back-and-forth wipe stroke, µm.
    pub move_distance: Coord,
    ///mm/s
    pub move_speed: f64,
}

impl Default for WipeScriptSettings {
    fn default() -> Self {
        WipeScriptSettings {
            max_extrusion_before_wipe: 0.0,
            retraction_enable: true,
            retraction_amount: 1.0,
            retraction_speed: 3.0,
            pause: 0.0,
            hop_enable: false,
            hop_amount: 1_000,
            hop_speed: 10.0,
            brush_pos_x: 0,
            repeat_count: 5,
            move_distance: 20_000,
            move_speed: 120.0,
        }
    }
}

///Piecewise-linear flow (mm³/s) to temperature (°C) curve of a material.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowTempGraph {
    ///Sorted by flow, ascending.
    pub points: Vec<(f64, f64)>,
}

impl FlowTempGraph {
    ///The temperature for a flow, interpolating between graph points and
    ///clamping at the ends. Falls back to `default_temp` on an empty graph.
    pub fn temperature_for_flow(&self, flow: f64, default_temp: f64) -> f64 {
        if self.points.is_empty() {
            return default_temp;
        }
        if flow <= self.points[0].0 {
            return self.points[0].1;
        }
        for w in self.points.windows(2) {
            let (f0, t0) = w[0];
            let (f1, t1) = w[1];
            if flow <= f1 {
                if f1 == f0 {
                    return t1;
                }
                return t0 + (t1 - t0) * (flow - f0) / (f1 - f0);
            }
        }
        self.points.last().expect("graph is non-empty").1
    }
}

///Material temperatures and heating rates of one extruder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialSettings {
    ///GUID identifying the material, written into Griffin headers.
    pub guid: String,
    ///°C while printing.
    pub print_temperature: f64,
    ///°C required before the extruder starts its first paths of a plan.
    pub initial_print_temperature: f64,
    ///°C allowed at the end of this extruder's last paths.
    pub final_print_temperature: f64,
    ///°C to drop to when another extruder takes over.
    pub standby_temperature: f64,
    ///°C for the very first layer.
    pub print_temperature_layer_0: f64,
    pub bed_temperature: f64,
    pub bed_temperature_layer_0: f64,
    ///°C/s while heating.
    pub heat_up_speed: f64,
    ///°C/s while cooling.
    pub cool_down_speed: f64,
    ///Pick the print temperature from the average flow instead.
    pub flow_dependent_temperature: bool,
    pub flow_temp_graph: FlowTempGraph,
    ///Filament diameter, mm.
    pub diameter: f64,
}

impl Default for MaterialSettings {
    fn default() -> Self {
        MaterialSettings {
            guid: String::new(),
            print_temperature: 210.0,
            initial_print_temperature: 205.0,
            final_print_temperature: 195.0,
            standby_temperature: 150.0,
            print_temperature_layer_0: 215.0,
            bed_temperature: 60.0,
            bed_temperature_layer_0: 60.0,
            heat_up_speed: 2.0,
            cool_down_speed: 0.7,
            flow_dependent_temperature: false,
            flow_temp_graph: FlowTempGraph::default(),
            diameter: 2.85,
        }
    }
}

///All settings of a single extruder train.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtruderSettings {
    ///Nozzle inner diameter, µm; the default line width.
    pub nozzle_size: Coord,
    ///Outer diameter of the nozzle tip, µm. Travels shorter than this skip
    ///all travel logic.
    pub nozzle_outer_diameter: Coord,
    ///Offset of this nozzle from the head origin, µm.
    pub nozzle_offset: Point,
    ///Whether the firmware performs retractions itself (G10/G11).
    pub firmware_retract: bool,
    pub material: MaterialSettings,
    pub retraction: RetractionSettings,
    ///Retraction performed when switching away from this extruder.
    pub switch_retraction: RetractionSettings,
    pub anti_ooze: AntiOozeSettings,
    pub fan_speed_layer_time: FanSpeedLayerTimeSettings,
    ///Index of the print cooling fan of this extruder.
    pub fan_number: usize,
    pub coasting: CoastingSettings,
    pub wipe: WipeScriptSettings,
    pub travel: SpeedSection,
    pub skirt_brim: SpeedSection,
    ///Line width for skirt and brim, µm.
    pub skirt_brim_line_width: Coord,
    pub prime_tower: SpeedSection,
    pub prime_tower_line_width: Coord,
    pub prime_tower_flow: f64,
    pub support_infill: SpeedSection,
    pub support_infill_line_width: Coord,
    pub support_roof: SpeedSection,
    pub support_roof_line_width: Coord,
    pub support_bottom: SpeedSection,
    pub support_bottom_line_width: Coord,
    ///Where this extruder starts a layer when nothing was planned before.
    pub layer_start_position: Point,
    ///Location of the prime blob, if the machine primes off the print.
    pub prime_position: Point,
    pub prime_blob_enabled: bool,
    ///Compensation of the print speed against the current extrusion rate;
    ///zero disables it.
    pub back_pressure_compensation_factor: f64,
    ///Limit on the change of extrusion rate, mm³/s².
    pub max_flow_acceleration: f64,
    pub gradual_flow_enabled: bool,
    ///Step length used when discretizing a flow ramp, µm.
    pub gradual_flow_discretisation_step: Coord,
    ///Start G-code of this extruder (template).
    pub start_code: String,
    ///End G-code of this extruder (template).
    pub end_code: String,
}

impl Default for ExtruderSettings {
    fn default() -> Self {
        ExtruderSettings {
            nozzle_size: 400,
            nozzle_outer_diameter: 1_000,
            nozzle_offset: Point::default(),
            firmware_retract: false,
            material: MaterialSettings::default(),
            retraction: RetractionSettings::default(),
            switch_retraction: RetractionSettings {
                amount: 16.0,
                speed: 20.0,
                ..RetractionSettings::default()
            },
            anti_ooze: AntiOozeSettings::default(),
            fan_speed_layer_time: FanSpeedLayerTimeSettings::default(),
            fan_number: 0,
            coasting: CoastingSettings::default(),
            wipe: WipeScriptSettings::default(),
            travel: SpeedSection::new(250.0, 5_000.0, 30.0),
            skirt_brim: SpeedSection::new(30.0, 1_000.0, 10.0),
            skirt_brim_line_width: 400,
            prime_tower: SpeedSection::new(60.0, 3_000.0, 20.0),
            prime_tower_line_width: 400,
            prime_tower_flow: 1.0,
            support_infill: SpeedSection::new(60.0, 3_000.0, 20.0),
            support_infill_line_width: 400,
            support_roof: SpeedSection::new(40.0, 3_000.0, 20.0),
            support_roof_line_width: 400,
            support_bottom: SpeedSection::new(40.0, 3_000.0, 20.0),
            support_bottom_line_width: 400,
            layer_start_position: Point::default(),
            prime_position: Point::default(),
            prime_blob_enabled: false,
            back_pressure_compensation_factor: 0.0,
            max_flow_acceleration: 1.0,
            gradual_flow_enabled: false,
            gradual_flow_discretisation_step: 200,
            start_code: String::new(),
            end_code: String::new(),
        }
    }
}

///Per-mesh print tuning: widths, speeds, seams and wall processing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshSettings {
    pub wall_line_width_0: Coord,
    pub wall_line_width_x: Coord,
    pub skin_line_width: Coord,
    pub infill_line_width: Coord,
    pub wall_0: SpeedSection,
    pub wall_x: SpeedSection,
    pub roofing: SpeedSection,
    pub flooring: SpeedSection,
    pub skin: SpeedSection,
    pub infill: SpeedSection,
    pub ironing: SpeedSection,
    pub bridge_wall: SpeedSection,
    pub bridge_skin: SpeedSection,
    pub bridge_wall_flow: f64,
    pub bridge_skin_flow: f64,
    ///Minimum length of an unsupported segment to print it as a bridge, µm.
    pub bridge_wall_min_length: Coord,
    pub seam: ZSeamConfig,
    ///Distance to wipe along the outer wall after closing it, µm.
    pub wall_0_wipe_dist: Coord,
    ///Distance to wipe after an infill line, µm.
    pub infill_wipe_dist: Coord,
    ///Print outer wall before inner walls.
    pub outer_inset_first: bool,
    ///Group wall ordering per region instead of per inset index.
    pub order_walls_per_region: bool,
    ///Always retract before travelling to an outer wall.
    pub retract_before_outer_wall: bool,
    ///Closed walls shorter than this print at `small_feature_speed_factor`, µm.
    pub small_feature_max_length: Coord,
    pub small_feature_speed_factor: f64,
    ///Length of the overlapping tapered seam; zero disables scarf seams, µm.
    pub scarf_seam_length: Coord,
    ///Flow/width ratio at the start of the scarf ramp.
    pub scarf_seam_start_ratio: f64,
    ///Longest segment kept intact when ramping the scarf, µm.
    pub scarf_split_distance: Coord,
    ///Ramp length over which the wall accelerates to full speed, µm.
    pub wall_0_accelerate_length: Coord,
    pub wall_0_start_speed_ratio: f64,
    ///Ramp length over which the wall decelerates at its end, µm.
    pub wall_0_decelerate_length: Coord,
    pub wall_0_end_speed_ratio: f64,
    ///Longest segment kept intact when ramping speed, µm.
    pub wall_0_speed_split_distance: Coord,
    ///Speed factors of the gradual overhang bands, outermost band last.
    pub overhang_speed_factors: Vec<f64>,
    ///Splitting tolerances, µm.
    pub max_resolution: Coord,
    pub flow_ratio: f64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        MeshSettings {
            wall_line_width_0: 400,
            wall_line_width_x: 400,
            skin_line_width: 400,
            infill_line_width: 400,
            wall_0: SpeedSection::new(30.0, 1_000.0, 10.0),
            wall_x: SpeedSection::new(60.0, 2_000.0, 15.0),
            roofing: SpeedSection::new(25.0, 1_000.0, 10.0),
            flooring: SpeedSection::new(25.0, 1_000.0, 10.0),
            skin: SpeedSection::new(30.0, 1_500.0, 15.0),
            infill: SpeedSection::new(80.0, 3_000.0, 20.0),
            ironing: SpeedSection::new(20.0, 1_000.0, 10.0),
            bridge_wall: SpeedSection::new(15.0, 1_000.0, 10.0),
            bridge_skin: SpeedSection::new(15.0, 1_000.0, 10.0),
            bridge_wall_flow: 0.5,
            bridge_skin_flow: 0.6,
            bridge_wall_min_length: 5_000,
            seam: ZSeamConfig::default(),
            wall_0_wipe_dist: 200,
            infill_wipe_dist: 0,
            outer_inset_first: false,
            order_walls_per_region: true,
            retract_before_outer_wall: false,
            small_feature_max_length: 0,
            small_feature_speed_factor: 0.5,
            scarf_seam_length: 0,
            scarf_seam_start_ratio: 0.3,
            scarf_split_distance: 1_000,
            wall_0_accelerate_length: 0,
            wall_0_start_speed_ratio: 0.5,
            wall_0_decelerate_length: 0,
            wall_0_end_speed_ratio: 0.5,
            wall_0_speed_split_distance: 1_000,
            overhang_speed_factors: vec![],
            max_resolution: 250,
            flow_ratio: 1.0,
        }
    }
}

///The complete settings bundle for a slice. Configuration loading is
///external; this struct is the only way settings enter the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub machine_name: String,
    pub flavor: GCodeFlavor,
    ///Build plate size, µm.
    pub machine_width: Coord,
    pub machine_depth: Coord,
    pub machine_height: Coord,
    ///Encode nozzle offsets into emitted coordinates.
    pub use_extruder_offset_to_offset_coords: bool,
    pub machine_heated_build_volume: bool,
    pub build_volume_temperature: f64,
    ///Number of controllable fans on the machine.
    pub fans_count: usize,
    pub relative_extrusion: bool,
    pub always_write_active_tool: bool,
    ///Whether M204/M205 commands may be emitted.
    pub acceleration_enabled: bool,
    pub jerk_enabled: bool,
    ///Layers over which first-layer speeds blend into nominal speeds.
    pub initial_speedup_layer_count: usize,
    ///Print speed profile on the first layer.
    pub first_layer_print: SpeedSection,
    ///Travel speed profile on the first layer.
    pub first_layer_travel: SpeedSection,
    pub layer_height: Coord,
    pub layer_height_0: Coord,
    ///Raft configuration; layer counts and gaps, µm.
    pub raft_enabled: bool,
    pub raft_base_thickness: Coord,
    pub raft_interface_layers: usize,
    pub raft_interface_thickness: Coord,
    pub raft_surface_layers: usize,
    pub raft_surface_thickness: Coord,
    pub raft_airgap: Coord,
    pub layer_0_z_overlap: Coord,
    pub combing_mode: CombingMode,
    ///Combed travels longer than this retract anyway, µm.
    pub retraction_combing_max_distance: Coord,
    ///Offset from the outline used to build the minimum comb boundary, µm.
    pub comb_boundary_offset: Coord,
    ///Distance to stay inside the comb boundary after moving in, µm.
    pub comb_move_inside_distance: Coord,
    ///Avoidance distance for travels through air, µm.
    pub travel_avoid_distance: Coord,
    pub magic_spiralize: bool,
    ///Start/end G-code templates.
    pub start_gcode: String,
    pub end_gcode: String,
    ///Firmware kinematics for the time estimator: X, Y, Z, E.
    pub max_feedrate: [f64; 4],
    pub max_acceleration: [f64; 4],
    pub default_acceleration: f64,
    pub max_xy_jerk: f64,
    pub max_z_jerk: f64,
    pub max_e_jerk: f64,
    pub minimum_feedrate: f64,
    pub extruders: Vec<ExtruderSettings>,
    pub meshes: Vec<MeshSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            machine_name: "Generic FFF Printer".to_string(),
            flavor: GCodeFlavor::Marlin,
            machine_width: 220_000,
            machine_depth: 220_000,
            machine_height: 240_000,
            use_extruder_offset_to_offset_coords: false,
            machine_heated_build_volume: false,
            build_volume_temperature: 0.0,
            fans_count: 1,
            relative_extrusion: false,
            always_write_active_tool: false,
            acceleration_enabled: false,
            jerk_enabled: false,
            initial_speedup_layer_count: 4,
            first_layer_print: SpeedSection::new(20.0, 1_000.0, 10.0),
            first_layer_travel: SpeedSection::new(100.0, 3_000.0, 20.0),
            layer_height: 200,
            layer_height_0: 270,
            raft_enabled: false,
            raft_base_thickness: 360,
            raft_interface_layers: 1,
            raft_interface_thickness: 300,
            raft_surface_layers: 2,
            raft_surface_thickness: 200,
            raft_airgap: 300,
            layer_0_z_overlap: 150,
            combing_mode: CombingMode::All,
            retraction_combing_max_distance: 30_000,
            comb_boundary_offset: 200,
            comb_move_inside_distance: 400,
            travel_avoid_distance: 625,
            magic_spiralize: false,
            start_gcode: String::new(),
            end_gcode: String::new(),
            max_feedrate: [600.0, 600.0, 40.0, 25.0],
            max_acceleration: [9_000.0, 9_000.0, 100.0, 10_000.0],
            default_acceleration: 3_000.0,
            max_xy_jerk: 20.0,
            max_z_jerk: 0.4,
            max_e_jerk: 5.0,
            minimum_feedrate: 0.01,
            extruders: vec![ExtruderSettings::default()],
            meshes: vec![MeshSettings::default()],
        }
    }
}

impl Settings {
    pub fn from_json(input: &str) -> Result<Self, SlicerError> {
        let settings: Settings = serde_json::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn extruder(&self, extruder_nr: usize) -> &ExtruderSettings {
        &self.extruders[extruder_nr]
    }

    pub fn extruder_count(&self) -> usize {
        self.extruders.len()
    }

    ///Reject out-of-range values before any planning starts.
    pub fn validate(&self) -> Result<(), SlicerError> {
        if self.extruders.is_empty() {
            return Err(SlicerError::NoExtruders);
        }
        setting_less_than_or_equal_to_zero!(self, layer_height);
        setting_less_than_or_equal_to_zero!(self, layer_height_0);
        setting_less_than_or_equal_to_zero!(self, machine_width);
        setting_less_than_or_equal_to_zero!(self, machine_depth);
        setting_less_than_or_equal_to_zero!(self, minimum_feedrate);
        setting_less_than_zero!(self, retraction_combing_max_distance);
        setting_less_than_zero!(self, travel_avoid_distance);
        for axis in 0..4 {
            if self.max_feedrate[axis] <= 0.0 || self.max_acceleration[axis] <= 0.0 {
                return Err(SlicerError::SettingOutOfRange {
                    setting: "max_feedrate/max_acceleration".to_string(),
                    message: format!("axis {axis} limits must be positive"),
                });
            }
        }
        for extruder in &self.extruders {
            setting_less_than_or_equal_to_zero!(extruder, nozzle_size);
            setting_less_than_or_equal_to_zero!(extruder.material, diameter);
            setting_less_than_zero!(extruder.retraction, amount);
            setting_less_than_or_equal_to_zero!(extruder.travel, speed);
            if extruder.fan_number >= self.fans_count.max(1) {
                return Err(SlicerError::SettingOutOfRange {
                    setting: "fan_number".to_string(),
                    message: format!(
                        "fan {} does not exist on a machine with {} fans",
                        extruder.fan_number, self.fans_count
                    ),
                });
            }
        }
        for mesh in &self.meshes {
            setting_less_than_or_equal_to_zero!(mesh, wall_line_width_0);
            setting_less_than_or_equal_to_zero!(mesh, wall_line_width_x);
            setting_less_than_or_equal_to_zero!(mesh, flow_ratio);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        Settings::default().validate().expect("defaults are valid");
    }

    #[test]
    fn zero_layer_height_is_rejected() {
        let mut settings = Settings::default();
        settings.layer_height = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).expect("settings serialize");
        let parsed = Settings::from_json(&json).expect("settings parse back");
        assert_eq!(settings, parsed);
    }

    #[test]
    fn flow_temp_graph_interpolates() {
        let graph = FlowTempGraph {
            points: vec![(1.0, 200.0), (3.0, 220.0)],
        };
        assert_eq!(graph.temperature_for_flow(2.0, 0.0), 210.0);
        assert_eq!(graph.temperature_for_flow(0.5, 0.0), 200.0);
        assert_eq!(graph.temperature_for_flow(5.0, 0.0), 220.0);
        assert_eq!(FlowTempGraph::default().temperature_for_flow(2.0, 123.0), 123.0);
    }
}
