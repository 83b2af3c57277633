//!Textual G-code emission. This is the only module that knows how G-code
//!looks: flavor differences, E-value bookkeeping, retraction and z-hop
//!state, fan and temperature deduplication, and the embedded time
//!estimation all live here.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as FmtWrite;
use std::io::Write;

use crate::geometry::{to_mm, Coord, Point, Point3};
use crate::path_config::PrintFeatureType;
use crate::settings::{GCodeFlavor, RetractionSettings, Settings, WipeScriptSettings};
use crate::template::{resolve_gcode_template, TemplateEnvironment, Value};
use crate::time_estimate::{Position, TimeEstimateCalculator};

///Extruder state tracked while writing.
#[derive(Clone, Debug)]
struct ExtruderTrainAttributes {
    is_primed: bool,
    is_used: bool,
    ///mm² of the filament cross section.
    filament_area: f64,
    ///Total filament pushed through this extruder, mm³.
    total_filament: f64,
    current_temperature: f64,
    waited_for_temperature: bool,
    initial_temp: f64,
    ///Currently retracted amount in E units; zero when not retracted.
    retraction_e_amount_current: f64,
    ///Retraction state at the moment E was last reset to zero.
    retraction_e_amount_at_e_start: f64,
    ///Material to prime after the next unretraction, mm³.
    prime_volume: f64,
    last_retraction_prime_speed: f64,
    last_e_value_after_wipe: f64,
    fan_number: usize,
    nozzle_offset: Point,
    machine_firmware_retract: bool,
    extruded_volume_at_previous_n_retractions: VecDeque<f64>,
}

impl ExtruderTrainAttributes {
    fn new() -> Self {
        ExtruderTrainAttributes {
            is_primed: false,
            is_used: false,
            filament_area: 0.0,
            total_filament: 0.0,
            current_temperature: 0.0,
            waited_for_temperature: false,
            initial_temp: 0.0,
            retraction_e_amount_current: 0.0,
            retraction_e_amount_at_e_start: 0.0,
            prime_volume: 0.0,
            last_retraction_prime_speed: 0.0,
            last_e_value_after_wipe: 0.0,
            fan_number: 0,
            nozzle_offset: Point::default(),
            machine_firmware_retract: false,
            extruded_volume_at_previous_n_retractions: VecDeque::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct RetractionAmounts {
    old_e: f64,
    new_e: f64,
    diff_e: f64,
}

impl RetractionAmounts {
    fn has_retraction(&self) -> bool {
        self.diff_e.abs() >= 1e-6
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Aabb3 {
    min: Point3,
    max: Point3,
    initialized: bool,
}

impl Aabb3 {
    fn include(&mut self, p: Point3) {
        if !self.initialized {
            self.min = p;
            self.max = p;
            self.initialized = true;
            return;
        }
        self.min = Point3::new(self.min.x.min(p.x), self.min.y.min(p.y), self.min.z.min(p.z));
        self.max = Point3::new(self.max.x.max(p.x), self.max.y.max(p.y), self.max.z.max(p.z));
    }
}

///Writes the actual G-code and tracks all printer state while doing so.
pub struct GCodeExport {
    output: String,
    settings: Settings,
    template_env: TemplateEnvironment,
    extruder_attrs: Vec<ExtruderTrainAttributes>,
    flavor: GCodeFlavor,
    machine_name: String,
    use_extruder_offset_to_offset_coords: bool,
    is_volumetric: bool,
    relative_extrusion: bool,
    always_write_active_tool: bool,
    current_e_value: f64,
    ///Flow-compensation offset added to written E values.
    current_e_offset: f64,
    max_extrusion_offset: f64,
    extrusion_offset_factor: f64,
    current_position: Point3,
    current_speed: f64,
    current_print_acceleration: f64,
    current_travel_acceleration: f64,
    current_jerk: f64,
    current_layer_z: Coord,
    ///Height the head is currently z-hopped by, zero when not hopped.
    is_z_hopped: Coord,
    ///Prime left over from an anti-ooze travel, to be processed while
    ///z-hopping back down: (absolute E target, ratio of the hop move).
    z_hop_prime_leftover: Option<(f64, f64)>,
    current_extruder: usize,
    current_fan_speeds: HashMap<usize, f64>,
    fans_count: usize,
    bed_temperature: f64,
    ///E value of the last written line, for relative extrusion output.
    last_written_e_cache: f64,
    total_print_times: Vec<f64>,
    estimate_calculator: TimeEstimateCalculator,
    total_bounding_box: Aabb3,
    bfb_extruder_on: bool,
    bfb_last_rpm: f64,
}

impl GCodeExport {
    pub fn new() -> Self {
        GCodeExport {
            output: String::new(),
            settings: Settings::default(),
            template_env: TemplateEnvironment::default(),
            extruder_attrs: vec![],
            flavor: GCodeFlavor::Marlin,
            machine_name: String::new(),
            use_extruder_offset_to_offset_coords: false,
            is_volumetric: false,
            relative_extrusion: false,
            always_write_active_tool: false,
            current_e_value: 0.0,
            current_e_offset: 0.0,
            max_extrusion_offset: 0.0,
            extrusion_offset_factor: 1.0,
            current_position: Point3::new(0, 0, 0),
            current_speed: 0.0,
            current_print_acceleration: -1.0,
            current_travel_acceleration: -1.0,
            current_jerk: -1.0,
            current_layer_z: 0,
            is_z_hopped: 0,
            z_hop_prime_leftover: None,
            current_extruder: 0,
            current_fan_speeds: HashMap::new(),
            fans_count: 1,
            bed_temperature: 0.0,
            last_written_e_cache: 0.0,
            total_print_times: vec![0.0; PrintFeatureType::COUNT],
            estimate_calculator: TimeEstimateCalculator::default(),
            total_bounding_box: Aabb3::default(),
            bfb_extruder_on: false,
            bfb_last_rpm: 0.0,
        }
    }

    ///Configure the exporter from the settings bundle.
    pub fn pre_setup(&mut self, settings: &Settings, start_extruder: usize) {
        self.settings = settings.clone();
        self.template_env = build_template_environment(settings);
        self.flavor = settings.flavor;
        self.machine_name = settings.machine_name.clone();
        self.use_extruder_offset_to_offset_coords = settings.use_extruder_offset_to_offset_coords;
        self.is_volumetric = settings.flavor.is_volumetric();
        self.relative_extrusion =
            settings.relative_extrusion || settings.flavor == GCodeFlavor::UltiGCode;
        self.always_write_active_tool = settings.always_write_active_tool;
        self.fans_count = settings.fans_count;
        self.current_extruder = start_extruder;
        self.extruder_attrs = settings
            .extruders
            .iter()
            .map(|ext| {
                let mut attr = ExtruderTrainAttributes::new();
                let diameter = ext.material.diameter;
                attr.filament_area = std::f64::consts::PI * (diameter / 2.0) * (diameter / 2.0);
                attr.fan_number = ext.fan_number;
                attr.nozzle_offset = ext.nozzle_offset;
                attr.machine_firmware_retract = ext.firmware_retract;
                attr.last_retraction_prime_speed = ext.retraction.prime_speed;
                attr
            })
            .collect();
        self.estimate_calculator.set_firmware_defaults(settings);
    }

    pub fn set_flow_rate_extrusion_settings(&mut self, max_extrusion_offset: f64, factor: f64) {
        self.max_extrusion_offset = max_extrusion_offset;
        self.extrusion_offset_factor = factor;
    }

    // --- basic state access ----------------------------------------------

    pub fn flavor(&self) -> GCodeFlavor {
        self.flavor
    }

    pub fn position(&self) -> Point3 {
        self.current_position
    }

    pub fn position_xy(&self) -> Point {
        self.current_position.xy()
    }

    pub fn extruder_nr(&self) -> usize {
        self.current_extruder
    }

    pub fn set_z(&mut self, z: Coord) {
        self.current_layer_z = z;
    }

    pub fn current_layer_z(&self) -> Coord {
        self.current_layer_z
    }

    pub fn is_retracted(&self) -> bool {
        self.extruder_attrs[self.current_extruder].retraction_e_amount_current != 0.0
    }

    pub fn is_z_hopped(&self) -> Coord {
        self.is_z_hopped
    }

    pub fn mark_extruder_used(&mut self, extruder_nr: usize) {
        self.extruder_attrs[extruder_nr].is_used = true;
    }

    pub fn set_initial_temp(&mut self, extruder_nr: usize, temp: f64) {
        let attr = &mut self.extruder_attrs[extruder_nr];
        attr.initial_temp = temp;
        attr.current_temperature = temp;
    }

    pub fn set_filament_diameter(&mut self, extruder_nr: usize, diameter_um: Coord) {
        let diameter = to_mm(diameter_um);
        self.extruder_attrs[extruder_nr].filament_area =
            std::f64::consts::PI * (diameter / 2.0) * (diameter / 2.0);
    }

    ///Queue extra material to prime after the next unretraction.
    pub fn add_extra_prime_amount(&mut self, extra_prime_volume: f64) {
        self.extruder_attrs[self.current_extruder].prime_volume += extra_prime_volume.max(0.0);
    }

    pub fn get_total_filament_used(&self, extruder_nr: usize) -> f64 {
        self.extruder_attrs[extruder_nr].total_filament
    }

    ///Volume extruded since the last E reset, mm³.
    pub fn current_extruded_volume(&self) -> f64 {
        let attr = &self.extruder_attrs[self.current_extruder];
        self.e_to_mm3(
            self.current_e_value + attr.retraction_e_amount_at_e_start,
            self.current_extruder,
        )
    }

    pub fn get_extruded_volume_after_last_wipe(&self, extruder_nr: usize) -> f64 {
        let attr = &self.extruder_attrs[extruder_nr];
        self.e_to_mm3(self.current_e_value - attr.last_e_value_after_wipe, extruder_nr)
    }

    pub fn reset_last_e_value_after_wipe(&mut self, extruder_nr: usize) {
        self.extruder_attrs[extruder_nr].last_e_value_after_wipe = self.current_e_value;
    }

    // --- E value conversions ---------------------------------------------

    fn mm_to_e(&self, mm: f64) -> f64 {
        if self.is_volumetric {
            mm * self.extruder_attrs[self.current_extruder].filament_area
        } else {
            mm
        }
    }

    fn e_to_mm(&self, e: f64) -> f64 {
        if self.is_volumetric {
            e / self.extruder_attrs[self.current_extruder].filament_area
        } else {
            e
        }
    }

    pub fn mm3_to_e(&self, mm3: f64) -> f64 {
        if self.is_volumetric {
            mm3
        } else {
            mm3 / self.extruder_attrs[self.current_extruder].filament_area
        }
    }

    fn e_to_mm3(&self, e: f64, extruder_nr: usize) -> f64 {
        if self.is_volumetric {
            e
        } else {
            e * self.extruder_attrs[extruder_nr].filament_area
        }
    }

    ///Build plate coordinates shifted by the nozzle offset when offsets are
    ///encoded into the written coordinates.
    fn gcode_pos(&self, x: Coord, y: Coord, extruder_nr: usize) -> Point {
        if self.use_extruder_offset_to_offset_coords {
            Point::new(x, y) - self.extruder_attrs[extruder_nr].nozzle_offset
        } else {
            Point::new(x, y)
        }
    }

    // --- output access ----------------------------------------------------

    ///Drain the buffered text into the given sink.
    pub fn flush_output(&mut self, sink: &mut dyn Write) -> std::io::Result<()> {
        sink.write_all(self.output.as_bytes())?;
        self.output.clear();
        Ok(())
    }

    ///The buffered text, without draining it. Mostly useful in tests.
    pub fn buffered_output(&self) -> &str {
        &self.output
    }

    fn line(&mut self, text: &str) {
        self.output.push_str(text);
        self.output.push('\n');
    }

    // --- comments and headers --------------------------------------------

    pub fn write_comment(&mut self, comment: &str) {
        for part in comment.split('\n') {
            let _ = writeln!(self.output, ";{part}");
        }
    }

    pub fn write_type_comment(&mut self, feature: PrintFeatureType) {
        if feature.is_printed_feature() {
            let _ = writeln!(self.output, ";TYPE:{feature}");
        }
    }

    pub fn write_layer_comment(&mut self, layer_nr: i64) {
        let _ = writeln!(self.output, ";LAYER:{layer_nr}");
    }

    pub fn write_layer_count_comment(&mut self, layer_count: usize) {
        let _ = writeln!(self.output, ";LAYER_COUNT:{layer_count}");
    }

    pub fn write_time_comment(&mut self, time: f64) {
        let _ = writeln!(self.output, ";TIME_ELAPSED:{time:.6}");
    }

    pub fn write_line(&mut self, text: &str) {
        self.line(text);
    }

    pub fn write_code(&mut self, code: &str) {
        if !code.is_empty() {
            self.line(code);
        }
    }

    ///The file header; flavor-specific and written before anything else.
    pub fn get_file_header(
        &self,
        extruder_is_used: &[bool],
        print_time: Option<f64>,
        filament_used_mm3: &[f64],
        material_guids: &[String],
    ) -> String {
        let mut header = String::new();
        match self.flavor {
            GCodeFlavor::Griffin => {
                let _ = writeln!(header, ";START_OF_HEADER");
                let _ = writeln!(header, ";HEADER_VERSION:0.1");
                let _ = writeln!(header, ";FLAVOR:{}", self.flavor);
                let _ = writeln!(
                    header,
                    ";GENERATOR.NAME:{}",
                    env!("CARGO_PKG_NAME")
                );
                let _ = writeln!(header, ";GENERATOR.VERSION:{}", env!("CARGO_PKG_VERSION"));
                let _ = writeln!(header, ";TARGET_MACHINE.NAME:{}", self.machine_name);
                for (nr, used) in extruder_is_used.iter().enumerate() {
                    if !used {
                        continue;
                    }
                    let ext = &self.settings.extruders[nr];
                    let _ = writeln!(
                        header,
                        ";EXTRUDER_TRAIN.{nr}.INITIAL_TEMPERATURE:{:.0}",
                        self.extruder_attrs[nr].initial_temp
                    );
                    if let Some(volume) = filament_used_mm3.get(nr) {
                        let _ = writeln!(
                            header,
                            ";EXTRUDER_TRAIN.{nr}.MATERIAL.VOLUME_USED:{volume:.0}"
                        );
                    }
                    if let Some(guid) = material_guids.get(nr).filter(|g| !g.is_empty()) {
                        let _ = writeln!(header, ";EXTRUDER_TRAIN.{nr}.MATERIAL.GUID:{guid}");
                    }
                    let _ = writeln!(
                        header,
                        ";EXTRUDER_TRAIN.{nr}.NOZZLE.DIAMETER:{}",
                        to_mm(ext.nozzle_size)
                    );
                    let _ = writeln!(
                        header,
                        ";EXTRUDER_TRAIN.{nr}.NOZZLE.FAN_INDEX:{}",
                        ext.fan_number
                    );
                }
                let _ = writeln!(header, ";BUILD_PLATE.INITIAL_TEMPERATURE:{:.0}", self.bed_temperature);
                let _ = writeln!(header, ";PRINT.TIME:{:.0}", print_time.unwrap_or(0.0));
                let bb = &self.total_bounding_box;
                let _ = writeln!(header, ";PRINT.SIZE.MIN.X:{:.3}", to_mm(bb.min.x));
                let _ = writeln!(header, ";PRINT.SIZE.MIN.Y:{:.3}", to_mm(bb.min.y));
                let _ = writeln!(header, ";PRINT.SIZE.MIN.Z:{:.3}", to_mm(bb.min.z));
                let _ = writeln!(header, ";PRINT.SIZE.MAX.X:{:.3}", to_mm(bb.max.x));
                let _ = writeln!(header, ";PRINT.SIZE.MAX.Y:{:.3}", to_mm(bb.max.y));
                let _ = writeln!(header, ";PRINT.SIZE.MAX.Z:{:.3}", to_mm(bb.max.z));
                let _ = writeln!(header, ";END_OF_HEADER");
            }
            GCodeFlavor::UltiGCode => {
                let _ = writeln!(header, ";FLAVOR:{}", self.flavor);
                let _ = writeln!(header, ";TIME:{:.0}", print_time.unwrap_or(6666.0));
                let first = filament_used_mm3.first().copied().unwrap_or(0.0);
                let _ = writeln!(header, ";MATERIAL:{first:.0}");
                let second = filament_used_mm3.get(1).copied().unwrap_or(0.0);
                let _ = writeln!(header, ";MATERIAL2:{second:.0}");
                let _ = writeln!(
                    header,
                    ";NOZZLE_DIAMETER:{}",
                    to_mm(self.settings.extruders[0].nozzle_size)
                );
            }
            _ => {
                let _ = writeln!(header, ";FLAVOR:{}", self.flavor);
                let _ = writeln!(header, ";TIME:{:.0}", print_time.unwrap_or(6666.0));
                let lengths: Vec<String> = filament_used_mm3
                    .iter()
                    .enumerate()
                    .filter(|(nr, _)| *extruder_is_used.get(*nr).unwrap_or(&false))
                    .map(|(nr, volume)| {
                        let area = self.extruder_attrs[nr].filament_area;
                        let meters = if area > 0.0 { volume / area / 1000.0 } else { 0.0 };
                        format!("{meters:.6}m")
                    })
                    .collect();
                if !lengths.is_empty() {
                    let _ = writeln!(header, ";Filament used: {}", lengths.join(", "));
                }
                let _ = writeln!(header, ";Layer height: {}", to_mm(self.settings.layer_height));
                let bb = &self.total_bounding_box;
                let _ = writeln!(header, ";MINX:{:.3}", to_mm(bb.min.x));
                let _ = writeln!(header, ";MINY:{:.3}", to_mm(bb.min.y));
                let _ = writeln!(header, ";MINZ:{:.3}", to_mm(bb.min.z));
                let _ = writeln!(header, ";MAXX:{:.3}", to_mm(bb.max.x));
                let _ = writeln!(header, ";MAXY:{:.3}", to_mm(bb.max.y));
                let _ = writeln!(header, ";MAXZ:{:.3}", to_mm(bb.max.z));
                let _ = writeln!(header, ";TARGET_MACHINE.NAME:{}", self.machine_name);
            }
        }
        header
    }

    // --- moves ------------------------------------------------------------

    ///Travel to an XY position at the current (possibly hopped) height.
    pub fn write_travel_xy(&mut self, p: Point, speed: f64) {
        self.write_travel(
            Point3::new(p.x, p.y, self.current_layer_z + self.is_z_hopped),
            speed,
            None,
        );
    }

    ///Travel to an absolute 3D position. When `retract_target` is given the
    ///travel simultaneously retracts to that absolute amount (anti-ooze).
    pub fn write_travel(&mut self, p: Point3, speed: f64, retract_target: Option<f64>) {
        if self.flavor == GCodeFlavor::Bfb {
            self.write_move_bfb(p, speed, 0.0, PrintFeatureType::MoveUnretracted);
            return;
        }
        let retraction_amounts = retract_target.map(|target| {
            let attr = &self.extruder_attrs[self.current_extruder];
            let new_e = self.mm_to_e(target);
            RetractionAmounts {
                old_e: attr.retraction_e_amount_current,
                new_e,
                diff_e: new_e - attr.retraction_e_amount_current,
            }
        });
        let feature = match &retraction_amounts {
            Some(amounts) if amounts.has_retraction() => {
                if amounts.diff_e > 0.0 {
                    PrintFeatureType::MoveWhileRetracting
                } else {
                    PrintFeatureType::MoveWhileUnretracting
                }
            }
            _ => {
                if self.is_retracted() {
                    PrintFeatureType::MoveRetracted
                } else {
                    PrintFeatureType::MoveUnretracted
                }
            }
        };
        self.write_fxyze(speed, p.x, p.y, p.z, self.current_e_value, feature, retraction_amounts);
    }

    ///Write an extrusion move; unretracts and primes first when needed.
    pub fn write_extrusion(
        &mut self,
        p: Point3,
        speed: f64,
        extrusion_mm3_per_mm: f64,
        feature: PrintFeatureType,
        update_extrusion_offset: bool,
    ) {
        if self.flavor == GCodeFlavor::Bfb {
            self.write_move_bfb(p, speed, extrusion_mm3_per_mm, feature);
            return;
        }
        if self.is_z_hopped > 0 {
            self.write_zhop_end(0.0, 0);
        }
        self.write_unretraction_and_prime();

        // Flow-rate compensation: shift E proportionally to the flow.
        if update_extrusion_offset && self.max_extrusion_offset > 0.0 {
            let extrusion_offset =
                (speed * extrusion_mm3_per_mm * self.extrusion_offset_factor).min(self.max_extrusion_offset);
            if (extrusion_offset - self.current_e_offset).abs() > 1e-9 {
                self.current_e_offset = extrusion_offset;
                let _ = writeln!(self.output, ";FLOW_RATE_COMPENSATED_OFFSET = {extrusion_offset}");
            }
        }

        let delta = p.xy() - self.current_position.xy();
        let length_mm = delta.vsize_mm();
        let extrusion_per_mm = self.mm3_to_e(extrusion_mm3_per_mm);
        let e_delta = extrusion_per_mm * length_mm;
        let new_e_value = self.current_e_value + e_delta;
        self.extruder_attrs[self.current_extruder].total_filament +=
            self.e_to_mm3(e_delta, self.current_extruder);
        self.total_bounding_box.include(p);
        self.write_fxyze(speed, p.x, p.y, p.z, new_e_value, feature, None);
    }

    ///Write the F/X/Y/Z/E words, skipping what did not change, and feed the
    ///time estimator.
    fn write_fxyze(
        &mut self,
        speed: f64,
        x: Coord,
        y: Coord,
        z: Coord,
        e: f64,
        feature: PrintFeatureType,
        retraction_amounts: Option<RetractionAmounts>,
    ) {
        let is_extrusion = e != self.current_e_value || retraction_amounts.is_some();
        let gcode_pos = self.gcode_pos(x, y, self.current_extruder);

        let command = if is_extrusion { "G1" } else { "G0" };
        let mut line = String::from(command);
        if (self.current_speed - speed).abs() > 1e-9 {
            let _ = write!(line, " F{:.0}", speed * 60.0);
            self.current_speed = speed;
        }
        let _ = write!(line, " X{:.3} Y{:.3}", to_mm(gcode_pos.x), to_mm(gcode_pos.y));
        if z != self.current_position.z {
            let _ = write!(line, " Z{:.3}", to_mm(z));
        }
        // current_e_value always equals the base E minus the currently
        // retracted amount, so a moving retraction rewrites both.
        let written_e = match retraction_amounts {
            Some(amounts) => {
                let attr = &mut self.extruder_attrs[self.current_extruder];
                let e = self.current_e_value + amounts.old_e - amounts.new_e;
                attr.retraction_e_amount_current = amounts.new_e;
                self.current_e_value = e;
                e
            }
            None => e,
        };
        if is_extrusion {
            let output_e = if self.relative_extrusion {
                written_e - self.last_written_e()
            } else {
                written_e + self.current_e_offset
            };
            let _ = write!(line, " E{output_e:.5}");
        }
        self.line(&line);

        self.estimate_calculator.plan(
            Position::new(to_mm(x), to_mm(y), to_mm(z), self.e_to_mm(written_e)),
            speed,
            feature,
        );
        self.last_written_e_set(written_e);
        self.current_e_value = written_e;
        self.current_position = Point3::new(x, y, z);
    }

    ///The E value of the previously written line; used for relative E.
    fn last_written_e(&self) -> f64 {
        self.last_written_e_cache
    }

    fn last_written_e_set(&mut self, e: f64) {
        self.last_written_e_cache = e;
    }

    fn write_move_bfb(&mut self, p: Point3, speed: f64, extrusion_mm3_per_mm: f64, feature: PrintFeatureType) {
        // BFB machines take extrusion as an RPM instead of an E axis.
        let delta = p.xy() - self.current_position.xy();
        let length_mm = delta.vsize_mm();
        let mut speed = speed;
        if extrusion_mm3_per_mm > 0.0 && length_mm > 0.0 {
            let mm_per_rpm = 4.0;
            let rpm = extrusion_mm3_per_mm * speed * 60.0 / mm_per_rpm;
            if (rpm - self.bfb_last_rpm).abs() > 1e-3 || !self.bfb_extruder_on {
                let _ = writeln!(self.output, "M108 R{rpm:.1}");
                self.bfb_last_rpm = rpm;
            }
            if !self.bfb_extruder_on {
                self.line("M101");
                self.bfb_extruder_on = true;
            }
            // BFB machines lose accuracy at high feed rates while extruding.
            speed = speed.min(60.0);
        } else if self.bfb_extruder_on {
            self.line("M103");
            self.bfb_extruder_on = false;
        }
        let gcode_pos = self.gcode_pos(p.x, p.y, self.current_extruder);
        let _ = writeln!(
            self.output,
            "G1 X{:.3} Y{:.3} Z{:.3} F{:.1}",
            to_mm(gcode_pos.x),
            to_mm(gcode_pos.y),
            to_mm(p.z),
            speed * 60.0
        );
        self.estimate_calculator.plan(
            Position::new(to_mm(p.x), to_mm(p.y), to_mm(p.z), self.e_to_mm(self.current_e_value)),
            speed,
            feature,
        );
        self.current_position = p;
        self.current_speed = speed;
    }

    // --- retraction, priming, z-hop --------------------------------------

    ///Unretract (G11 or an E move) and prime pending material.
    pub fn write_unretraction_and_prime(&mut self) {
        let prime_volume = self.extruder_attrs[self.current_extruder].prime_volume;
        let prime_e = self.mm3_to_e(prime_volume);
        let retracted = self.extruder_attrs[self.current_extruder].retraction_e_amount_current;
        let firmware_retract = self.extruder_attrs[self.current_extruder].machine_firmware_retract;
        let prime_speed = self.extruder_attrs[self.current_extruder]
            .last_retraction_prime_speed
            .max(1.0);

        if retracted != 0.0 {
            if firmware_retract {
                self.line("G11");
                self.current_e_value += retracted;
                self.last_written_e_set(self.current_e_value);
                if prime_e != 0.0 {
                    self.write_prime_e_move(prime_e, prime_speed);
                }
                let unretract_mm = self.e_to_mm(retracted);
                self.estimate_calculator.plan_e_only(unretract_mm, 25.0);
            } else {
                let new_e = self.current_e_value + retracted + prime_e;
                self.write_absolute_e_move(new_e, prime_speed);
                let moved_mm = self.e_to_mm(retracted + prime_e);
                self.estimate_calculator.plan_e_only(moved_mm, prime_speed);
            }
            self.extruder_attrs[self.current_extruder].retraction_e_amount_current = 0.0;
        } else if prime_e != 0.0 {
            self.write_prime_e_move(prime_e, prime_speed);
        }
        self.extruder_attrs[self.current_extruder].prime_volume = 0.0;
    }

    fn write_prime_e_move(&mut self, prime_e: f64, speed: f64) {
        let new_e = self.current_e_value + prime_e;
        self.write_absolute_e_move(new_e, speed);
        let prime_mm = self.e_to_mm(prime_e);
        self.estimate_calculator.plan_e_only(prime_mm, speed);
    }

    ///Emit a stationary E move to the given absolute E value.
    fn write_absolute_e_move(&mut self, new_e: f64, speed: f64) {
        let output_e = if self.relative_extrusion {
            new_e - self.last_written_e()
        } else {
            new_e + self.current_e_offset
        };
        let _ = writeln!(self.output, "G1 F{:.0} E{output_e:.5}", speed * 60.0);
        self.current_e_value = new_e;
        self.last_written_e_set(new_e);
        self.current_speed = speed;
    }

    ///Write a stationary retraction. Returns false when the retraction was
    ///skipped (already retracted, or the retraction count limit is hit).
    pub fn write_retraction(
        &mut self,
        config: &RetractionSettings,
        force: bool,
        extruder_switch: bool,
        retract_distance: Option<f64>,
    ) -> bool {
        if self.machine_handles_retraction() {
            return false;
        }
        let distance = retract_distance.unwrap_or(config.amount);
        if !config.enabled && !force {
            return false;
        }
        let new_retraction = self.mm_to_e(distance);
        let old_retraction = self.extruder_attrs[self.current_extruder].retraction_e_amount_current;
        if (new_retraction - old_retraction).abs() < 1e-6 {
            // Already retracted this far; a repeated request is a no-op.
            return false;
        }

        if !force && config.count_max > 0 {
            let current_volume = self.extruder_attrs[self.current_extruder].total_filament;
            let deque = &mut self.extruder_attrs[self.current_extruder]
                .extruded_volume_at_previous_n_retractions;
            while deque.len() > config.count_max {
                deque.pop_back();
            }
            if deque.len() == config.count_max
                && deque
                    .back()
                    .map(|oldest| current_volume - oldest < config.extrusion_window)
                    .unwrap_or(false)
            {
                return false;
            }
            deque.push_front(current_volume);
        }

        let firmware_retract = self.extruder_attrs[self.current_extruder].machine_firmware_retract;
        {
            let attr = &mut self.extruder_attrs[self.current_extruder];
            attr.retraction_e_amount_current = new_retraction;
            attr.prime_volume += config.prime_volume;
            attr.last_retraction_prime_speed = config.prime_speed;
        }

        let retract_mm = self.e_to_mm(new_retraction - old_retraction);
        if firmware_retract {
            self.line(if extruder_switch { "G10 S1" } else { "G10" });
            self.current_e_value -= new_retraction - old_retraction;
            self.last_written_e_set(self.current_e_value);
            self.estimate_calculator
                .plan_e_only(-retract_mm, config.speed.max(1.0));
        } else {
            let new_e = self.current_e_value - (new_retraction - old_retraction);
            self.write_absolute_e_move(new_e, config.speed.max(1.0));
            self.estimate_calculator
                .plan_e_only(-retract_mm, config.speed.max(1.0));
        }
        true
    }

    ///Start a z-hop. When `retract_ratio` is within (0, 1) the hop is split
    ///and the first part carries a simultaneous retraction to
    ///`retract_target`.
    pub fn write_zhop_start(
        &mut self,
        hop_height: Coord,
        speed: f64,
        retract_target: Option<f64>,
        retract_ratio: f64,
    ) {
        if hop_height <= 0 {
            return;
        }
        let speed = if speed > 0.0 {
            speed
        } else {
            self.settings.extruders[self.current_extruder].retraction.hop_speed
        };
        self.is_z_hopped = hop_height;
        let target_z = self.current_layer_z + hop_height;
        match retract_target {
            Some(target) if retract_ratio > 0.0 && retract_ratio < 1.0 => {
                let split_z = self.current_layer_z + (hop_height as f64 * retract_ratio) as Coord;
                let xy = self.current_position.xy();
                self.write_travel(Point3::new(xy.x, xy.y, split_z), speed, Some(target));
                self.write_travel(Point3::new(xy.x, xy.y, target_z), speed, None);
            }
            Some(target) => {
                let xy = self.current_position.xy();
                self.write_travel(Point3::new(xy.x, xy.y, target_z), speed, Some(target));
            }
            None => {
                let _ = writeln!(self.output, "G1 F{:.0} Z{:.3}", speed * 60.0, to_mm(target_z));
                self.current_speed = speed;
                self.current_position =
                    Point3::new(self.current_position.x, self.current_position.y, target_z);
                self.estimate_calculator.plan(
                    Position::new(
                        to_mm(self.current_position.x),
                        to_mm(self.current_position.y),
                        to_mm(target_z),
                        self.e_to_mm(self.current_e_value),
                    ),
                    speed,
                    PrintFeatureType::MoveRetracted,
                );
            }
        }
    }

    ///End a z-hop: go back to the layer height, processing any leftover
    ///anti-ooze prime on the way down.
    pub fn write_zhop_end(&mut self, speed: f64, height: Coord) {
        if self.is_z_hopped == 0 {
            return;
        }
        let speed = if speed > 0.0 {
            speed
        } else {
            self.settings.extruders[self.current_extruder].retraction.hop_speed
        };
        self.is_z_hopped = height;
        let target_z = self.current_layer_z + height;
        if let Some((prime_target, ratio)) = self.z_hop_prime_leftover.take() {
            let xy = self.current_position.xy();
            if ratio > 0.0 && ratio < 1.0 {
                let split_z = target_z
                    + ((self.current_position.z - target_z) as f64 * ratio) as Coord;
                self.write_travel(Point3::new(xy.x, xy.y, split_z), speed, None);
                self.write_travel(Point3::new(xy.x, xy.y, target_z), speed, Some(prime_target));
            } else {
                self.write_travel(Point3::new(xy.x, xy.y, target_z), speed, Some(prime_target));
            }
            return;
        }
        let _ = writeln!(self.output, "G1 F{:.0} Z{:.3}", speed * 60.0, to_mm(target_z));
        self.current_speed = speed;
        self.current_position =
            Point3::new(self.current_position.x, self.current_position.y, target_z);
        self.estimate_calculator.plan(
            Position::new(
                to_mm(self.current_position.x),
                to_mm(self.current_position.y),
                to_mm(target_z),
                self.e_to_mm(self.current_e_value),
            ),
            speed,
            PrintFeatureType::MoveRetracted,
        );
    }

    pub fn set_z_hop_prime_leftover(&mut self, prime_target: f64, ratio: f64) {
        self.z_hop_prime_leftover = Some((prime_target, ratio));
    }

    // --- extruder management ---------------------------------------------

    ///Reset the E axis to zero to keep E values small.
    pub fn reset_extrusion_value(&mut self) {
        if self.current_e_value == 0.0 {
            return;
        }
        self.line("G92 E0");
        let attr = &mut self.extruder_attrs[self.current_extruder];
        attr.retraction_e_amount_at_e_start = attr.retraction_e_amount_current;
        self.current_e_value = 0.0;
        self.last_written_e_set(0.0);
        self.estimate_calculator.reset_e();
    }

    ///Activate an extruder: tool change, start code, E reset.
    pub fn start_extruder(&mut self, new_extruder: usize) {
        self.current_extruder = new_extruder;
        self.extruder_attrs[new_extruder].is_used = true;
        if self.flavor != GCodeFlavor::UltiGCode || self.always_write_active_tool {
            let _ = writeln!(self.output, "T{new_extruder}");
        }
        self.reset_extrusion_value();
        let start_code = self.settings.extruders[new_extruder].start_code.clone();
        if !start_code.is_empty() {
            let resolved = resolve_gcode_template(
                &start_code,
                Some(new_extruder),
                &self.template_env,
                &HashMap::new(),
            );
            self.output.push_str(&resolved);
        }
        self.write_prepare_fans_for_nozzle_switch();
        // The next move must re-emit its feedrate for the new tool.
        self.current_speed = 0.0;
    }

    ///Full extruder switch: switch-retract, end code, tool change, start
    ///code.
    pub fn switch_extruder(
        &mut self,
        new_extruder: usize,
        retraction_config_old_extruder: &RetractionSettings,
        perform_z_hop: Coord,
    ) {
        if self.current_extruder == new_extruder {
            return;
        }
        self.write_retraction(retraction_config_old_extruder, true, true, None);
        if perform_z_hop > 0 {
            self.write_zhop_start(perform_z_hop, 0.0, None, 0.0);
        }
        let end_code = self.settings.extruders[self.current_extruder].end_code.clone();
        if !end_code.is_empty() {
            let resolved = resolve_gcode_template(
                &end_code,
                Some(self.current_extruder),
                &self.template_env,
                &HashMap::new(),
            );
            self.output.push_str(&resolved);
        }
        self.start_extruder(new_extruder);
    }

    ///Prime the current extruder if this print still needs it.
    pub fn write_prime_train(&mut self, travel_speed: f64) {
        if self.extruder_attrs[self.current_extruder].is_primed {
            return;
        }
        let prime_blob = self.settings.extruders[self.current_extruder].prime_blob_enabled;
        if prime_blob {
            let prime_pos = self.settings.extruders[self.current_extruder].prime_position;
            self.write_travel_xy(prime_pos, travel_speed);
        }
        match self.flavor {
            GCodeFlavor::Griffin => {
                self.line(if prime_blob { "G280" } else { "G280 S1" });
            }
            _ => {
                // Other flavors prime through the normal unretract path.
            }
        }
        self.extruder_attrs[self.current_extruder].is_primed = true;
    }

    pub fn reset_extruder_to_primed(&mut self, extruder_nr: usize, initial_retraction: f64) {
        self.extruder_attrs[extruder_nr].is_primed = true;
        self.extruder_attrs[extruder_nr].retraction_e_amount_current =
            self.mm_to_e(initial_retraction);
    }

    // --- fans, temperatures, kinematics ----------------------------------

    pub fn write_fan_command(&mut self, speed: f64, extruder: Option<usize>) {
        let fan_number = self.extruder_attrs[extruder.unwrap_or(self.current_extruder)].fan_number;
        self.write_specific_fan_command(speed, fan_number);
    }

    pub fn write_specific_fan_command(&mut self, speed: f64, fan_number: usize) {
        let current = self.current_fan_speeds.get(&fan_number).copied();
        if current.map(|c| (c - speed).abs() < 0.1).unwrap_or(false) {
            return;
        }
        let fan_index_words = if self.fans_count > 1 {
            format!(" P{fan_number}")
        } else {
            String::new()
        };
        if speed > 0.0 {
            match self.flavor {
                GCodeFlavor::Makerbot => {
                    let _ = writeln!(self.output, "M126 T0");
                }
                _ => {
                    let _ = writeln!(
                        self.output,
                        "M106 S{:.0}{fan_index_words}",
                        (speed * 255.0 / 100.0).round()
                    );
                }
            }
        } else {
            match self.flavor {
                GCodeFlavor::Makerbot => {
                    let _ = writeln!(self.output, "M127 T0");
                }
                _ => {
                    let _ = writeln!(self.output, "M107{fan_index_words}");
                }
            }
        }
        self.current_fan_speeds.insert(fan_number, speed);
    }

    ///Turn off every cooling fan but the upcoming extruder's one.
    pub fn write_prepare_fans_for_nozzle_switch(&mut self) {
        let active_fan = self.extruder_attrs[self.current_extruder].fan_number;
        let fans: Vec<usize> = self.extruder_attrs.iter().map(|attr| attr.fan_number).collect();
        for fan_number in fans {
            if fan_number != active_fan {
                self.write_specific_fan_command(0.0, fan_number);
            }
        }
    }

    pub fn write_prepare_fans_for_extrusion(&mut self, current_extruder_new_speed: f64) {
        let active_fan = self.extruder_attrs[self.current_extruder].fan_number;
        let fans: Vec<usize> = self.extruder_attrs.iter().map(|attr| attr.fan_number).collect();
        for fan_number in fans {
            if fan_number != active_fan {
                self.write_specific_fan_command(0.0, fan_number);
            }
        }
        self.write_specific_fan_command(current_extruder_new_speed, active_fan);
    }

    pub fn write_temperature_command(
        &mut self,
        extruder: usize,
        temperature: f64,
        wait: bool,
        force_write_on_equal: bool,
    ) {
        if self.flavor == GCodeFlavor::UltiGCode {
            // The machine regulates nozzle temperatures itself.
            return;
        }
        let attr = &mut self.extruder_attrs[extruder];
        if !force_write_on_equal
            && (attr.current_temperature - temperature).abs() < 1e-9
            && (!wait || attr.waited_for_temperature)
        {
            return;
        }
        let command = if wait { "M109" } else { "M104" };
        let mut line = String::from(command);
        if extruder != self.current_extruder || self.extruder_attrs.len() > 1 {
            let _ = write!(line, " T{extruder}");
        }
        let _ = write!(line, " S{temperature:.0}");
        self.line(&line);
        let attr = &mut self.extruder_attrs[extruder];
        attr.current_temperature = temperature;
        attr.waited_for_temperature = wait;
        if wait {
            // A wait stalls the print; account a rough heat-up time.
            self.estimate_calculator.add_time(10.0);
        }
    }

    pub fn write_bed_temperature_command(&mut self, temperature: f64, wait: bool) {
        if (self.bed_temperature - temperature).abs() < 1e-9 && !wait {
            return;
        }
        let _ = writeln!(
            self.output,
            "{} S{temperature:.0}",
            if wait { "M190" } else { "M140" }
        );
        self.bed_temperature = temperature;
    }

    pub fn write_build_volume_temperature_command(&mut self, temperature: f64, wait: bool) {
        let _ = writeln!(
            self.output,
            "{} S{temperature:.0}",
            if wait { "M191" } else { "M141" }
        );
    }

    pub fn write_print_acceleration(&mut self, acceleration: f64) {
        if !self.settings.acceleration_enabled {
            return;
        }
        if (self.current_print_acceleration - acceleration).abs() < 1e-9 {
            return;
        }
        match self.flavor {
            GCodeFlavor::RepRap => {
                let _ = writeln!(self.output, "M204 P{acceleration:.0}");
            }
            GCodeFlavor::Repetier => {
                let _ = writeln!(self.output, "M201 X{acceleration:.0} Y{acceleration:.0}");
            }
            _ => {
                let _ = writeln!(self.output, "M204 S{acceleration:.0}");
            }
        }
        self.current_print_acceleration = acceleration;
        self.estimate_calculator.set_acceleration(acceleration);
    }

    pub fn write_travel_acceleration(&mut self, acceleration: f64) {
        if !self.settings.acceleration_enabled {
            return;
        }
        if !self.flavor.has_travel_acceleration() && self.flavor != GCodeFlavor::RepRap {
            // No separate travel acceleration on this flavor.
            self.write_print_acceleration(acceleration);
            return;
        }
        if (self.current_travel_acceleration - acceleration).abs() < 1e-9 {
            return;
        }
        let _ = writeln!(self.output, "M204 T{acceleration:.0}");
        self.current_travel_acceleration = acceleration;
        self.estimate_calculator.set_acceleration(acceleration);
    }

    pub fn write_jerk(&mut self, jerk: f64) {
        if !self.settings.jerk_enabled {
            return;
        }
        if (self.current_jerk - jerk).abs() < 1e-9 {
            return;
        }
        match self.flavor {
            GCodeFlavor::RepRap => {
                let _ = writeln!(self.output, "M566 X{:.0} Y{:.0}", jerk * 60.0, jerk * 60.0);
            }
            GCodeFlavor::Repetier => {
                let _ = writeln!(self.output, "M207 X{jerk:.2}");
            }
            _ => {
                let _ = writeln!(self.output, "M205 X{jerk:.2} Y{jerk:.2}");
            }
        }
        self.current_jerk = jerk;
        self.estimate_calculator.set_max_xy_jerk(jerk);
    }

    pub fn write_extrusion_mode(&mut self, relative: bool) {
        self.line(if relative { "M83" } else { "M82" });
    }

    pub fn write_delay(&mut self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        let _ = writeln!(self.output, "G4 P{:.0}", seconds * 1000.0);
        self.estimate_calculator.add_time(seconds);
    }

    // --- wipe script ------------------------------------------------------

    ///Wipe the nozzle on a brush: retract, hop, strokes, return.
    pub fn insert_wipe_script(&mut self, config: &WipeScriptSettings) {
        let prev_position = self.current_position;
        self.write_comment("WIPE_SCRIPT_BEGIN");

        let retraction = RetractionSettings {
            enabled: true,
            amount: config.retraction_amount,
            speed: config.retraction_speed,
            prime_speed: config.retraction_speed,
            ..RetractionSettings::default()
        };
        if config.retraction_enable {
            self.write_retraction(&retraction, true, false, None);
        }
        if config.pause > 0.0 {
            self.write_delay(config.pause);
        }
        if config.hop_enable {
            self.write_zhop_start(config.hop_amount, config.hop_speed, None, 0.0);
        }

        let travel_speed = self.settings.extruders[self.current_extruder].travel.speed;
        let start = Point::new(config.brush_pos_x, self.current_position.y);
        self.write_travel_xy(start, travel_speed);
        for i in 0..config.repeat_count {
            let x = if i % 2 == 0 {
                config.brush_pos_x + config.move_distance
            } else {
                config.brush_pos_x
            };
            self.write_travel_xy(Point::new(x, self.current_position.y), config.move_speed);
        }

        if config.hop_enable {
            self.write_zhop_end(config.hop_speed, 0);
        }
        if config.retraction_enable {
            self.write_unretraction_and_prime();
        }
        self.write_travel_xy(prev_position.xy(), travel_speed);

        self.write_comment("WIPE_SCRIPT_END");
        self.reset_last_e_value_after_wipe(self.current_extruder);
    }

    // --- time bookkeeping -------------------------------------------------

    ///Fold the estimator's pending blocks into the running totals.
    pub fn update_total_print_time(&mut self) {
        let times = self.estimate_calculator.calculate();
        for (total, time) in self.total_print_times.iter_mut().zip(times) {
            *total += time;
        }
        self.estimate_calculator.reset();
    }

    pub fn total_print_time_per_feature(&self) -> &[f64] {
        &self.total_print_times
    }

    pub fn sum_total_print_times(&self) -> f64 {
        self.total_print_times.iter().sum()
    }

    pub fn machine_handles_retraction(&self) -> bool {
        matches!(self.flavor, GCodeFlavor::UltiGCode | GCodeFlavor::Bfb)
    }

    ///Finish the print: fans off, end code, fold in remaining time.
    pub fn finalize(&mut self, end_code: &str) {
        self.write_fan_command(0.0, None);
        if !end_code.is_empty() {
            let resolved =
                resolve_gcode_template(end_code, None, &self.template_env, &HashMap::new());
            self.output.push_str(&resolved);
        }
        self.update_total_print_time();
        log::debug!("print takes {:.0}s", self.sum_total_print_times());
    }
}

impl Default for GCodeExport {
    fn default() -> Self {
        GCodeExport::new()
    }
}

///Expose settings as template values: machine-level keys globally, material
///keys per extruder.
pub fn build_template_environment(settings: &Settings) -> TemplateEnvironment {
    let mut env = TemplateEnvironment::default();
    env.global
        .insert("machine_name".into(), Value::Str(settings.machine_name.clone()));
    env.global.insert(
        "machine_width".into(),
        Value::Float(to_mm(settings.machine_width)),
    );
    env.global.insert(
        "machine_depth".into(),
        Value::Float(to_mm(settings.machine_depth)),
    );
    env.global.insert(
        "machine_height".into(),
        Value::Float(to_mm(settings.machine_height)),
    );
    env.global.insert(
        "layer_height".into(),
        Value::Float(to_mm(settings.layer_height)),
    );
    env.global
        .insert("initial_extruder".into(), Value::Int(0));
    if let Some(first) = settings.extruders.first() {
        env.global.insert(
            "material_bed_temperature".into(),
            Value::Float(first.material.bed_temperature),
        );
        env.global.insert(
            "material_bed_temperature_layer_0".into(),
            Value::Float(first.material.bed_temperature_layer_0),
        );
    }
    for ext in &settings.extruders {
        let mut map = HashMap::new();
        map.insert(
            "material_print_temperature".to_string(),
            Value::Float(ext.material.print_temperature),
        );
        map.insert(
            "material_print_temperature_layer_0".to_string(),
            Value::Float(ext.material.print_temperature_layer_0),
        );
        map.insert(
            "material_standby_temperature".to_string(),
            Value::Float(ext.material.standby_temperature),
        );
        map.insert(
            "material_initial_print_temperature".to_string(),
            Value::Float(ext.material.initial_print_temperature),
        );
        map.insert(
            "material_final_print_temperature".to_string(),
            Value::Float(ext.material.final_print_temperature),
        );
        map.insert(
            "machine_nozzle_size".to_string(),
            Value::Float(to_mm(ext.nozzle_size)),
        );
        env.per_extruder.push(map);
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exporter() -> GCodeExport {
        let mut gcode = GCodeExport::new();
        gcode.pre_setup(&Settings::default(), 0);
        gcode.set_z(200);
        gcode
    }

    #[test]
    fn travel_writes_g0_extrusion_writes_g1() {
        let mut gcode = exporter();
        gcode.write_travel_xy(Point::new(10_000, 0), 150.0);
        gcode.write_extrusion(
            Point3::new(20_000, 0, 200),
            50.0,
            0.08,
            PrintFeatureType::OuterWall,
            false,
        );
        let output = gcode.buffered_output();
        assert!(output.contains("G0 F9000 X10.000 Y0.000"), "{output}");
        assert!(output.contains("G1 F3000 X20.000 Y0.000 E"), "{output}");
    }

    #[test]
    fn feedrate_is_only_written_when_it_changes() {
        let mut gcode = exporter();
        gcode.write_travel_xy(Point::new(10_000, 0), 150.0);
        gcode.write_travel_xy(Point::new(20_000, 0), 150.0);
        let output = gcode.buffered_output();
        assert_eq!(output.matches("F9000").count(), 1, "{output}");
    }

    #[test]
    fn double_retraction_is_a_no_op() {
        let mut gcode = exporter();
        let config = RetractionSettings::default();
        assert!(gcode.write_retraction(&config, false, false, None));
        assert!(!gcode.write_retraction(&config, false, false, None));
        assert!(!gcode.write_retraction(&config, true, false, None));
        assert!(gcode.is_retracted());
    }

    #[test]
    fn extrusion_unretracts_first() {
        let mut gcode = exporter();
        let config = RetractionSettings::default();
        gcode.write_retraction(&config, false, false, None);
        assert!(gcode.is_retracted());
        gcode.write_extrusion(
            Point3::new(5_000, 0, 200),
            50.0,
            0.08,
            PrintFeatureType::OuterWall,
            false,
        );
        assert!(!gcode.is_retracted());
        // E dips for the retraction and comes back up before the extrusion.
        let output = gcode.buffered_output();
        let retract_line = output
            .lines()
            .find(|line| line.starts_with("G1 F1500 E"))
            .expect("retraction line present");
        let e_value: f64 = retract_line.trim_start_matches("G1 F1500 E").parse().unwrap();
        assert!(e_value < 0.0);
    }

    #[test]
    fn fan_commands_deduplicate() {
        let mut gcode = exporter();
        gcode.write_fan_command(50.0, None);
        gcode.write_fan_command(50.0, None);
        gcode.write_fan_command(0.0, None);
        let output = gcode.buffered_output();
        assert_eq!(output.matches("M106").count(), 1, "{output}");
        assert_eq!(output.matches("M107").count(), 1, "{output}");
    }

    #[test]
    fn header_time_matches_reported_total() {
        let mut gcode = exporter();
        gcode.write_extrusion(
            Point3::new(100_000, 0, 200),
            50.0,
            0.08,
            PrintFeatureType::OuterWall,
            false,
        );
        gcode.update_total_print_time();
        let total = gcode.sum_total_print_times();
        assert!(total > 0.0);
        let header = gcode.get_file_header(&[true], Some(total), &[123.4], &[String::new()]);
        let time_line = header
            .lines()
            .find(|line| line.starts_with(";TIME:"))
            .expect("TIME line present");
        let parsed: f64 = time_line.trim_start_matches(";TIME:").parse().unwrap();
        assert!((parsed - total).abs() <= 1.0);
    }

    #[test]
    fn z_hop_moves_up_and_back() {
        let mut gcode = exporter();
        gcode.write_travel_xy(Point::new(10_000, 10_000), 150.0);
        gcode.write_zhop_start(1_000, 0.0, None, 0.0);
        assert_eq!(gcode.is_z_hopped(), 1_000);
        gcode.write_zhop_end(0.0, 0);
        assert_eq!(gcode.is_z_hopped(), 0);
        let output = gcode.buffered_output();
        assert!(output.contains("Z1.200"), "{output}");
        assert!(output.lines().last().unwrap().contains("Z0.200"), "{output}");
    }

    #[test]
    fn temperature_commands_deduplicate_and_wait() {
        let mut gcode = exporter();
        gcode.write_temperature_command(0, 210.0, false, false);
        gcode.write_temperature_command(0, 210.0, false, false);
        gcode.write_temperature_command(0, 210.0, true, false);
        let output = gcode.buffered_output();
        assert_eq!(output.matches("M104").count(), 1, "{output}");
        assert_eq!(output.matches("M109").count(), 1, "{output}");
    }

    #[test]
    fn griffin_header_has_delimiters() {
        let mut settings = Settings::default();
        settings.flavor = GCodeFlavor::Griffin;
        let mut gcode = GCodeExport::new();
        gcode.pre_setup(&settings, 0);
        let header = gcode.get_file_header(&[true], Some(100.0), &[0.0], &["abc".to_string()]);
        assert!(header.starts_with(";START_OF_HEADER"));
        assert!(header.contains(";EXTRUDER_TRAIN.0.MATERIAL.GUID:abc"));
        assert!(header.trim_end().ends_with(";END_OF_HEADER"));
    }
}
