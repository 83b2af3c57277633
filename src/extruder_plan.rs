//!All work a single extruder performs on a single layer: the ordered paths,
//!the temperature inserts scheduled between them, time/material accounting
//!and the cooling adjustments derived from it.

use crate::export::GCodeExport;
use crate::geometry::{Coord, Point, Point3};
use crate::path_planning::{GCodePath, NozzleTempInsert, TimeMaterialEstimates};
use crate::settings::{FanSpeedLayerTimeSettings, RetractionSettings};

#[derive(Debug)]
pub struct ExtruderPlan {
    pub extruder_nr: usize,
    pub layer_nr: i64,
    pub is_initial_layer: bool,
    pub is_raft_layer: bool,
    pub layer_thickness: Coord,
    pub fan_speed_layer_time_settings: FanSpeedLayerTimeSettings,
    pub retraction_config: RetractionSettings,
    pub paths: Vec<GCodePath>,
    ///Kept sorted by (path index, time after path start).
    inserts: Vec<NozzleTempInsert>,
    ///Seconds of travel at the start of the plan during which the nozzle is
    ///already held at its initial print temperature.
    pub heated_pre_travel_time: f64,
    ///The temperature the nozzle must have when this plan starts printing.
    pub required_start_temperature: f64,
    ///The steady printing temperature; None when the plan has no extrusion.
    pub extrusion_temperature: Option<f64>,
    ///Standby temperature for the previously active extruder, set on a
    ///plan that follows an extruder switch.
    pub prev_extruder_standby_temp: Option<f64>,
    pub estimates: TimeMaterialEstimates,
    ///The speed every extrusion path would print at if slowed to the plan's
    ///slowest configured path speed.
    pub slowest_path_speed: f64,
    ///Dwell time appended at the end of the plan for cooling, seconds.
    pub extra_time: f64,
    fan_speed: f64,
    ///Whether the minimum layer time forced a slow-down or dwell.
    pub min_layer_time_used: bool,
}

impl ExtruderPlan {
    pub fn new(
        extruder_nr: usize,
        layer_nr: i64,
        is_initial_layer: bool,
        is_raft_layer: bool,
        layer_thickness: Coord,
        fan_speed_layer_time_settings: FanSpeedLayerTimeSettings,
        retraction_config: RetractionSettings,
    ) -> Self {
        ExtruderPlan {
            extruder_nr,
            layer_nr,
            is_initial_layer,
            is_raft_layer,
            layer_thickness,
            fan_speed_layer_time_settings,
            retraction_config,
            paths: vec![],
            inserts: vec![],
            heated_pre_travel_time: 0.0,
            required_start_temperature: -1.0,
            extrusion_temperature: None,
            prev_extruder_standby_temp: None,
            estimates: TimeMaterialEstimates::default(),
            slowest_path_speed: 0.0,
            extra_time: 0.0,
            fan_speed: 0.0,
            min_layer_time_used: false,
        }
    }

    pub fn insert_command(&mut self, insert: NozzleTempInsert) {
        let pos = self.inserts.partition_point(|existing| *existing <= insert);
        self.inserts.insert(pos, insert);
    }

    pub fn inserts(&self) -> &[NozzleTempInsert] {
        &self.inserts
    }

    ///Write the inserts that are due before `path_idx`, or due within the
    ///current path once `cumulative_path_time` seconds of it have passed.
    pub fn handle_inserts(&mut self, path_idx: usize, gcode: &mut GCodeExport, cumulative_path_time: f64) {
        while let Some(first) = self.inserts.first() {
            let due = first.path_idx < path_idx
                || (first.path_idx == path_idx && first.time_after_path_start <= cumulative_path_time);
            if !due {
                break;
            }
            let insert = self.inserts.remove(0);
            insert.write(gcode);
        }
    }

    ///Write every insert still pending; called at the end of the plan.
    pub fn handle_all_remaining_inserts(&mut self, gcode: &mut GCodeExport) {
        for insert in std::mem::take(&mut self.inserts) {
            insert.write(gcode);
        }
    }

    ///Naive per-path time and material accounting, without acceleration.
    ///Also fills the hypothetical slowed-down times used by the minimum
    ///layer time enforcement.
    pub fn compute_naive_time_estimates(&mut self, starting_position: Point) -> TimeMaterialEstimates {
        self.estimates.reset();
        self.slowest_path_speed = self
            .paths
            .iter()
            .filter(|path| !path.is_travel_path())
            .map(|path| path.effective_speed())
            .fold(f64::INFINITY, f64::min);
        if self.slowest_path_speed.is_infinite() {
            self.slowest_path_speed = 0.0;
        }

        let min_speed = self.fan_speed_layer_time_settings.cool_min_speed;
        let mut position = Point3::from_xy(starting_position);
        for path in &mut self.paths {
            path.estimates.reset();
            let length_mm = crate::geometry::to_mm(path.length(position));
            if let Some(&last) = path.points.last() {
                position = last;
            }

            if path.is_travel_path() {
                let speed = path.config.speed() * path.speed_factor;
                let time = if speed > 0.0 { length_mm / speed } else { 0.0 };
                if path.retract {
                    path.estimates.retracted_travel_time += time;
                    // The stationary retract and prime both take time too.
                    if self.retraction_config.speed > 0.0 {
                        path.estimates.retracted_travel_time +=
                            self.retraction_config.amount / self.retraction_config.speed;
                    }
                    if self.retraction_config.prime_speed > 0.0 {
                        path.estimates.retracted_travel_time +=
                            self.retraction_config.amount / self.retraction_config.prime_speed;
                    }
                } else {
                    path.estimates.unretracted_travel_time += time;
                }
            } else {
                let speed = path.effective_speed();
                if speed > 0.0 {
                    path.estimates.extrude_time += length_mm / speed;
                }
                if self.slowest_path_speed > 0.0 {
                    path.estimates.extrude_time_at_slowest_path_speed +=
                        length_mm / self.slowest_path_speed;
                }
                if min_speed > 0.0 {
                    path.estimates.extrude_time_at_minimum_speed += length_mm / min_speed;
                }
                path.estimates.material += length_mm * path.extrusion_mm3_per_mm();
            }
            self.estimates += path.estimates;
        }
        self.estimates
    }

    ///Slow the plan down (never below the minimum speed) and dwell at the
    ///end so this layer takes at least its share of the minimum layer time.
    pub fn force_minimal_layer_time(&mut self, maximum_cool_min_layer_time: f64, time_other_extr_plans: f64) {
        let min_time = maximum_cool_min_layer_time - time_other_extr_plans;
        let total_time = self.estimates.total_time();
        if total_time >= min_time || min_time <= 0.0 {
            return;
        }
        self.min_layer_time_used = true;

        if self.estimates.extrude_time <= 0.0 {
            // Nothing to slow down; dwell for the whole difference.
            self.extra_time = min_time - total_time;
            return;
        }

        let travel_time = self.estimates.travel_time();
        let target_extrude_time = min_time - travel_time;
        if target_extrude_time <= 0.0 {
            self.extra_time = min_time - total_time;
            return;
        }

        let min_speed = self.fan_speed_layer_time_settings.cool_min_speed;
        // First try a uniform slow-down; paths hitting the speed floor are
        // clamped and the remainder becomes a dwell.
        let factor = self.estimates.extrude_time / target_extrude_time;
        let mut achieved_extrude_time = 0.0;
        for path in &mut self.paths {
            if path.is_travel_path() {
                continue;
            }
            let nominal_speed = path.effective_speed();
            if nominal_speed <= 0.0 {
                continue;
            }
            let slowed = (nominal_speed * factor).max(min_speed.min(nominal_speed));
            path.speed_factor *= slowed / nominal_speed;
            if path.estimates.extrude_time > 0.0 {
                let length_over_speed = path.estimates.extrude_time * nominal_speed;
                let new_time = length_over_speed / slowed;
                achieved_extrude_time += new_time;
                let delta = new_time - path.estimates.extrude_time;
                path.estimates.extrude_time = new_time;
                self.estimates.extrude_time += delta;
            }
        }
        if achieved_extrude_time + travel_time < min_time {
            self.extra_time = min_time - travel_time - achieved_extrude_time;
        }
    }

    ///Fan speed from the layer time that actually resulted: fast layers get
    ///more cooling, interpolating between the regular and maximum fan speed.
    pub fn process_fan_speed_for_minimal_layer_time(&mut self, time_other_extr_plans: f64) {
        let settings = &self.fan_speed_layer_time_settings;
        self.fan_speed = settings.cool_fan_speed_min;
        let total_layer_time = self.estimates.total_time() + self.extra_time + time_other_extr_plans;
        if total_layer_time < settings.cool_min_layer_time {
            self.fan_speed = settings.cool_fan_speed_max;
        } else if settings.cool_min_layer_time_fan_speed_max > settings.cool_min_layer_time
            && total_layer_time < settings.cool_min_layer_time_fan_speed_max
        {
            let fraction = (total_layer_time - settings.cool_min_layer_time)
                / (settings.cool_min_layer_time_fan_speed_max - settings.cool_min_layer_time);
            self.fan_speed = settings.cool_fan_speed_max
                - fraction * (settings.cool_fan_speed_max - settings.cool_fan_speed_min);
        }
    }

    ///On the first layers the fan ramps up from its initial speed.
    pub fn process_fan_speed_for_first_layers(&mut self) {
        let settings = &self.fan_speed_layer_time_settings;
        if self.layer_nr < settings.cool_fan_full_layer as i64
            && settings.cool_fan_full_layer > 0
            && !self.is_raft_layer
        {
            let layer_nr = self.layer_nr.max(0) as f64;
            self.fan_speed = settings.cool_fan_speed_0
                + (self.fan_speed - settings.cool_fan_speed_0) * layer_nr
                    / settings.cool_fan_full_layer as f64;
            self.fan_speed = self.fan_speed.max(0.0);
        }
    }

    pub fn fan_speed(&self) -> f64 {
        self.fan_speed
    }

    pub fn set_fan_speed(&mut self, fan_speed: f64) {
        self.fan_speed = fan_speed;
    }

    ///Scale path speeds against their line width so thick lines (high back
    ///pressure) print slower and thin ones faster. A factor of 0 is a no-op.
    pub fn apply_back_pressure_compensation(&mut self, back_pressure_compensation: f64) {
        if back_pressure_compensation == 0.0 {
            return;
        }
        for path in &mut self.paths {
            if path.is_travel_path() || path.config.is_bridge_path() {
                continue;
            }
            let nominal_width = path.config.line_width() as f64;
            let line_width = path.width_factor * nominal_width;
            if line_width <= 0.0 || nominal_width <= 0.0 {
                continue;
            }
            path.speed_back_pressure_factor =
                (1.0 + (nominal_width / line_width - 1.0) * back_pressure_compensation).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_config::{GCodePathConfig, PrintFeatureType, SpeedDerivatives};
    use crate::path_planning::SpaceFillType;

    fn extrusion_path(speed: f64, length: Coord) -> GCodePath {
        let config = GCodePathConfig::new(
            PrintFeatureType::OuterWall,
            400,
            200,
            1.0,
            SpeedDerivatives {
                speed,
                acceleration: 1000.0,
                jerk: 10.0,
            },
        );
        let mut path = GCodePath::new(config, None, SpaceFillType::Polygons, 1.0, 1.0, false, 1.0);
        path.points.push(Point3::new(length, 0, 0));
        path
    }

    fn plan_with_path(speed: f64, length: Coord) -> ExtruderPlan {
        let mut plan = ExtruderPlan::new(
            0,
            5,
            false,
            false,
            200,
            FanSpeedLayerTimeSettings {
                cool_min_layer_time: 10.0,
                cool_min_speed: 10.0,
                ..Default::default()
            },
            RetractionSettings::default(),
        );
        plan.paths.push(extrusion_path(speed, length));
        plan
    }

    #[test]
    fn naive_estimates_use_length_over_speed() {
        // 300 mm at 60 mm/s is five seconds.
        let mut plan = plan_with_path(60.0, 300_000);
        let estimates = plan.compute_naive_time_estimates(Point::default());
        assert!((estimates.extrude_time - 5.0).abs() < 1e-9);
        assert!((estimates.material - 300.0 * 0.08).abs() < 1e-9);
    }

    #[test]
    fn min_layer_time_slows_down_by_factor_two() {
        // A 5 s layer with a 10 s minimum and a floor well below the halved
        // speed: exactly a factor two slow-down, no dwell.
        let mut plan = plan_with_path(60.0, 300_000);
        plan.compute_naive_time_estimates(Point::default());
        plan.force_minimal_layer_time(10.0, 0.0);
        assert!(plan.min_layer_time_used);
        assert!((plan.estimates.extrude_time - 10.0).abs() < 1e-6);
        assert!((plan.paths[0].effective_speed() - 30.0).abs() < 1e-6);
        assert!(plan.extra_time.abs() < 1e-6);
    }

    #[test]
    fn min_layer_time_clamps_at_floor_and_dwells() {
        // 1 s of printing at 60 mm/s; minimum 10 s. The floor of 20 mm/s
        // only stretches it to 3 s, the rest must be dwelled.
        let mut plan = plan_with_path(60.0, 60_000);
        plan.fan_speed_layer_time_settings.cool_min_speed = 20.0;
        plan.compute_naive_time_estimates(Point::default());
        plan.force_minimal_layer_time(10.0, 0.0);
        assert!((plan.paths[0].effective_speed() - 20.0).abs() < 1e-6);
        assert!((plan.extra_time - 7.0).abs() < 1e-6);
    }

    #[test]
    fn fast_layer_gets_maximum_fan() {
        let mut plan = plan_with_path(60.0, 60_000);
        plan.compute_naive_time_estimates(Point::default());
        plan.process_fan_speed_for_minimal_layer_time(0.0);
        assert_eq!(
            plan.fan_speed(),
            plan.fan_speed_layer_time_settings.cool_fan_speed_max
        );
    }

    #[test]
    fn back_pressure_compensation_zero_is_noop() {
        let mut plan = plan_with_path(60.0, 60_000);
        plan.paths[0].width_factor = 0.5;
        plan.apply_back_pressure_compensation(0.0);
        assert_eq!(plan.paths[0].speed_back_pressure_factor, 1.0);
        plan.apply_back_pressure_compensation(1.0);
        assert!((plan.paths[0].speed_back_pressure_factor - 2.0).abs() < 1e-9);
    }

    #[test]
    fn inserts_stay_sorted() {
        let mut plan = plan_with_path(60.0, 60_000);
        let insert = |path_idx, time| NozzleTempInsert {
            path_idx,
            extruder: 0,
            temperature: 200.0,
            wait: false,
            time_after_path_start: time,
        };
        plan.insert_command(insert(3, 0.0));
        plan.insert_command(insert(1, 2.0));
        plan.insert_command(insert(1, 0.5));
        let order: Vec<(usize, f64)> = plan
            .inserts()
            .iter()
            .map(|i| (i.path_idx, i.time_after_path_start))
            .collect();
        assert_eq!(order, vec![(1, 0.5), (1, 2.0), (3, 0.0)]);
    }
}
