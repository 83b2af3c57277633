//!Multi-layer look-ahead. Layer plans are held back in a rolling window so
//!that forward-looking decisions can still be taken: preheating a nozzle in
//!time for its next use, cooling the previous one to standby, and fixing up
//!each layer's first travel with the previous layer's end position.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::export::GCodeExport;
use crate::geometry::Point;
use crate::layer_plan::LayerPlan;
use crate::path_planning::NozzleTempInsert;
use crate::settings::Settings;

///Number of layers planned ahead before the oldest is written out.
const BUFFER_SIZE: usize = 5;

pub struct LayerPlanBuffer {
    settings: Arc<Settings>,
    buffer: VecDeque<LayerPlan>,
    ///Whether the very first extruder plan of the print still needs its
    ///initial temperatures.
    first_plan_handled: bool,
}

impl LayerPlanBuffer {
    pub fn new(settings: Arc<Settings>) -> Self {
        LayerPlanBuffer {
            settings,
            buffer: VecDeque::new(),
            first_plan_handled: false,
        }
    }

    pub fn buffered_layers(&self) -> usize {
        self.buffer.len()
    }

    ///Take ownership of a finished layer plan. Once the buffer runs over,
    ///the oldest plan is written to the exporter.
    ///
    ///`process_fan_speed_and_minimum_layer_time` must already have run on
    ///the plan so its time estimates are valid.
    pub fn handle(&mut self, layer_plan: LayerPlan, gcode: &mut GCodeExport) {
        self.buffer.push_back(layer_plan);
        self.insert_temp_commands();
        while self.buffer.len() > BUFFER_SIZE {
            self.write_front(gcode);
        }
    }

    ///Write out all remaining plans at the end of the slice.
    pub fn flush(&mut self, gcode: &mut GCodeExport) {
        while !self.buffer.is_empty() {
            self.write_front(gcode);
        }
    }

    fn write_front(&mut self, gcode: &mut GCodeExport) {
        let mut layer = self.buffer.pop_front().expect("buffer is non-empty");
        self.fix_first_travel(&mut layer, gcode.position_xy());
        layer.write_gcode(gcode);
    }

    ///The first travel of a layer was planned without knowing the previous
    ///layer's end position; retrofit the retraction decision now.
    fn fix_first_travel(&self, layer: &mut LayerPlan, previous_end: Point) {
        let Some((destination, destination_is_inside)) = layer.first_travel_destination() else {
            return;
        };
        let retraction = &self
            .settings
            .extruder(layer.extruder())
            .retraction;
        let distance = (destination - previous_end).vsize();
        let retract = retraction.enabled
            && distance >= retraction.min_travel
            && !(destination_is_inside
                && !layer.comb_boundary_preferred().is_empty()
                && !layer
                    .comb_boundary_preferred()
                    .collides_with_segment(previous_end, destination));
        if let Some(plan) = layer.extruder_plans.first_mut() {
            if let Some(path) = plan.paths.first_mut() {
                if path.is_travel_path() {
                    path.retract = retract;
                    path.perform_z_hop = retract && retraction.hop_enabled;
                }
            }
        }
    }

    // --- temperature scheduling ------------------------------------------

    ///The printing temperature of a plan, optionally derived from its
    ///average material flow.
    fn extrusion_temperature(&self, layer: &LayerPlan, plan_idx: usize) -> f64 {
        let plan = &layer.extruder_plans[plan_idx];
        let material = &self.settings.extruder(plan.extruder_nr).material;
        let default_temp = if layer.is_initial_layer() {
            material.print_temperature_layer_0
        } else {
            material.print_temperature
        };
        if material.flow_dependent_temperature && plan.estimates.extrude_time > 0.0 {
            let average_flow = plan.estimates.material / plan.estimates.extrude_time;
            material
                .flow_temp_graph
                .temperature_for_flow(average_flow, default_temp)
        } else {
            default_temp
        }
    }

    ///Fill in the temperatures of the newest layer's plans and schedule the
    ///preheats that make them achievable.
    fn insert_temp_commands(&mut self) {
        let newest = self.buffer.len() - 1;
        let plan_count = self.buffer[newest].extruder_plans.len();

        for plan_idx in 0..plan_count {
            let extruder_nr = self.buffer[newest].extruder_plans[plan_idx].extruder_nr;
            let extrusion_temp = self.extrusion_temperature(&self.buffer[newest], plan_idx);
            let material = self.settings.extruder(extruder_nr).material.clone();

            let same_extruder_as_previous = self
                .previous_plan_extruder(newest, plan_idx)
                .map(|nr| nr == extruder_nr)
                .unwrap_or(true);

            {
                let plan = &mut self.buffer[newest].extruder_plans[plan_idx];
                plan.extrusion_temperature = if plan.estimates.extrude_time > 0.0 {
                    Some(extrusion_temp)
                } else {
                    None
                };
                plan.required_start_temperature = if same_extruder_as_previous {
                    extrusion_temp
                } else {
                    material.initial_print_temperature
                };
            }

            if !self.first_plan_handled && newest == 0 && plan_idx == 0 {
                // The initial temperatures are written with the start code,
                // not with an insert.
                self.first_plan_handled = true;
                continue;
            }

            if same_extruder_as_previous {
                // The nozzle is already hot; retarget gradually at the start
                // of the plan.
                let required = self.buffer[newest].extruder_plans[plan_idx].required_start_temperature;
                let plan = &mut self.buffer[newest].extruder_plans[plan_idx];
                plan.insert_command(NozzleTempInsert {
                    path_idx: 0,
                    extruder: extruder_nr,
                    temperature: required,
                    wait: false,
                    time_after_path_start: 0.0,
                });
            } else {
                self.insert_preheat_command(newest, plan_idx, extruder_nr, &material);
            }
        }
    }

    ///The extruder of the plan immediately before (layer, plan_idx) in
    ///emission order.
    fn previous_plan_extruder(&self, layer_idx: usize, plan_idx: usize) -> Option<usize> {
        if plan_idx > 0 {
            return Some(self.buffer[layer_idx].extruder_plans[plan_idx - 1].extruder_nr);
        }
        if layer_idx > 0 {
            return self.buffer[layer_idx - 1]
                .extruder_plans
                .last()
                .map(|plan| plan.extruder_nr);
        }
        None
    }

    ///Schedule a heat-up insert so the nozzle reaches its required start
    ///temperature exactly when the plan begins.
    fn insert_preheat_command(
        &mut self,
        layer_idx: usize,
        plan_idx: usize,
        extruder_nr: usize,
        material: &crate::settings::MaterialSettings,
    ) {
        let required = self.buffer[layer_idx].extruder_plans[plan_idx].required_start_temperature;
        let heat_up_time = if material.heat_up_speed > 0.0 {
            (required - material.standby_temperature).max(0.0) / material.heat_up_speed
        } else {
            0.0
        };

        // Walk backwards through the preceding plans to find the point that
        // lies `heat_up_time` before this plan starts.
        let mut remaining = heat_up_time;
        let mut cursor_layer = layer_idx;
        let mut cursor_plan = plan_idx;
        loop {
            let (prev_layer, prev_plan) = if cursor_plan > 0 {
                (cursor_layer, cursor_plan - 1)
            } else if cursor_layer > 0 {
                let prev_layer = cursor_layer - 1;
                let last = self.buffer[prev_layer].extruder_plans.len() - 1;
                (prev_layer, last)
            } else {
                // Not enough buffered time; heat as early as possible.
                log::warn!(
                    "not enough buffered time to preheat extruder {extruder_nr}, heating early"
                );
                self.buffer[cursor_layer].extruder_plans[cursor_plan].insert_command(
                    NozzleTempInsert {
                        path_idx: 0,
                        extruder: extruder_nr,
                        temperature: required,
                        wait: false,
                        time_after_path_start: 0.0,
                    },
                );
                return;
            };

            let plan_time = self.buffer[prev_layer].extruder_plans[prev_plan]
                .estimates
                .total_time()
                + self.buffer[prev_layer].extruder_plans[prev_plan].extra_time;
            if plan_time >= remaining {
                let time_after_start = (plan_time - remaining).max(0.0);
                let insert = self.locate_insert(
                    prev_layer,
                    prev_plan,
                    extruder_nr,
                    required,
                    time_after_start,
                );
                self.buffer[prev_layer].extruder_plans[prev_plan].insert_command(insert);
                return;
            }
            remaining -= plan_time;
            cursor_layer = prev_layer;
            cursor_plan = prev_plan;
        }
    }

    ///Convert a time offset within a plan into (path index, time after that
    ///path's start).
    fn locate_insert(
        &self,
        layer_idx: usize,
        plan_idx: usize,
        extruder_nr: usize,
        temperature: f64,
        time_after_plan_start: f64,
    ) -> NozzleTempInsert {
        let plan = &self.buffer[layer_idx].extruder_plans[plan_idx];
        let mut elapsed = 0.0;
        for (path_idx, path) in plan.paths.iter().enumerate() {
            let path_time = path.estimates.total_time();
            if elapsed + path_time >= time_after_plan_start {
                return NozzleTempInsert {
                    path_idx,
                    extruder: extruder_nr,
                    temperature,
                    wait: false,
                    time_after_path_start: time_after_plan_start - elapsed,
                };
            }
            elapsed += path_time;
        }
        // Past the last path: clamp to the plan end.
        log::warn!("temperature insert time exceeds plan time, clamping to plan end");
        NozzleTempInsert {
            path_idx: plan.paths.len(),
            extruder: extruder_nr,
            temperature,
            wait: false,
            time_after_path_start: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point3;
    use crate::path_config::{GCodePathConfig, PrintFeatureType, SpeedDerivatives};
    use crate::path_planning::{GCodePath, SpaceFillType};
    use crate::storage::SliceDataStorage;

    fn simple_layer(
        storage: &Arc<SliceDataStorage>,
        settings: &Arc<Settings>,
        layer_nr: i64,
    ) -> LayerPlan {
        let mut layer = LayerPlan::new(
            storage.clone(),
            settings.clone(),
            layer_nr,
            200 + layer_nr * 200,
            200,
            0,
        );
        let config = GCodePathConfig::new(
            PrintFeatureType::OuterWall,
            400,
            200,
            1.0,
            SpeedDerivatives {
                speed: 50.0,
                acceleration: 1000.0,
                jerk: 10.0,
            },
        );
        let mut path = GCodePath::new(
            config,
            None,
            SpaceFillType::Polygons,
            1.0,
            1.0,
            false,
            1.0,
        );
        path.points.push(Point3::new(100_000, 0, 0));
        layer.extruder_plans[0].paths.push(path);
        layer.process_fan_speed_and_minimum_layer_time(Point::default());
        layer
    }

    #[test]
    fn buffer_delays_output_until_full() {
        let storage = Arc::new(SliceDataStorage::default());
        let settings = Arc::new(Settings::default());
        let mut buffer = LayerPlanBuffer::new(settings.clone());
        let mut gcode = GCodeExport::new();
        gcode.pre_setup(&settings, 0);

        for layer_nr in 0..BUFFER_SIZE as i64 {
            buffer.handle(simple_layer(&storage, &settings, layer_nr), &mut gcode);
        }
        assert_eq!(buffer.buffered_layers(), BUFFER_SIZE);
        assert!(!gcode.buffered_output().contains(";LAYER:0") || BUFFER_SIZE == 0);

        buffer.handle(simple_layer(&storage, &settings, BUFFER_SIZE as i64), &mut gcode);
        assert!(gcode.buffered_output().contains(";LAYER:0"));
        assert_eq!(buffer.buffered_layers(), BUFFER_SIZE);

        buffer.flush(&mut gcode);
        assert_eq!(buffer.buffered_layers(), 0);
        let last_layer = format!(";LAYER:{BUFFER_SIZE}");
        assert!(gcode.buffered_output().contains(&last_layer));
    }

    #[test]
    fn plans_get_their_temperatures_filled_in() {
        let storage = Arc::new(SliceDataStorage::default());
        let settings = Arc::new(Settings::default());
        let mut buffer = LayerPlanBuffer::new(settings.clone());
        let mut gcode = GCodeExport::new();
        gcode.pre_setup(&settings, 0);

        buffer.handle(simple_layer(&storage, &settings, 0), &mut gcode);
        buffer.handle(simple_layer(&storage, &settings, 1), &mut gcode);
        let layer = &buffer.buffer[1];
        let plan = &layer.extruder_plans[0];
        assert!(plan.extrusion_temperature.is_some());
        assert!(plan.required_start_temperature > 0.0);
    }
}
