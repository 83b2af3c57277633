//!The layer planner: accumulates the planned paths of one layer per
//!extruder, decides travels (combing, retraction, z-hop), walks walls with
//!seams and speed gradients, and finally writes everything through the
//!G-code exporter.

use std::collections::HashSet;
use std::sync::Arc;

use crate::comb::{move_inside, Comb, CombResult};
use crate::export::GCodeExport;
use crate::extruder_plan::ExtruderPlan;
use crate::geometry::{
    to_mm, Coord, ExtrusionLine, Point, Point3, Polygon, Polyline, Shape,
};
use crate::geometry::polygon_operations::PolygonOperations;
use crate::inset_order;
use crate::path_config::{GCodePathConfig, PathConfigStorage, PrintFeatureType};
use crate::path_order::PathOrderOptimizer;
use crate::path_planning::{GCodePath, SpaceFillType};
use crate::raft::{self, RaftLayerType};
use crate::settings::{CombingMode, MeshSettings, Settings, ZSeamConfig};
use crate::storage::{SliceDataStorage, SliceMeshStorage};

///A region of overhanging walls together with the speed modifier used
///inside it. The last mask is the most overhanging.
#[derive(Clone, Debug)]
pub struct OverhangMask {
    pub supported_region: Shape,
    pub speed_ratio: f64,
}

///How coasting applies to one written path.
#[derive(Clone, Copy, Debug, PartialEq)]
enum ApplyCoasting {
    NoCoasting,
    CoastEntirePath,
    PartialCoasting,
}

#[derive(Clone, Debug)]
struct PathCoasting {
    apply: ApplyCoasting,
    ///Index of the point from which the path only coasts.
    start_index: usize,
    ///Exact position where extrusion stops.
    start_pos: Point3,
}

///An external transformation applied to the planned paths of each extruder
///plan before they are written.
pub trait PlanModifier {
    fn modify(&self, extruder_nr: usize, layer_nr: i64, paths: &mut Vec<GCodePath>);
}

///All planned work of a single layer.
pub struct LayerPlan {
    storage: Arc<SliceDataStorage>,
    settings: Arc<Settings>,
    pub configs_storage: PathConfigStorage,
    pub layer_nr: i64,
    pub z: Coord,
    pub final_travel_z: Coord,
    pub layer_thickness: Coord,
    is_initial_layer: bool,
    layer_type: RaftLayerType,
    layer_start_pos_per_extruder: Vec<Point>,
    has_prime_tower_planned_per_extruder: Vec<bool>,
    skirt_brim_is_processed: Vec<bool>,
    last_planned_position: Option<Point>,
    current_mesh: Option<Arc<SliceMeshStorage>>,
    pub extruder_plans: Vec<ExtruderPlan>,
    pub last_extruder_previous_layer: usize,
    last_planned_extruder: usize,
    first_travel_destination: Option<Point>,
    first_travel_destination_is_inside: bool,
    ///Acceleration and jerk of the first extrusion, for fixing up the final
    ///travel of the previous layer.
    pub first_extrusion_acc_jerk: Option<(f64, f64)>,
    pub next_layer_acc_jerk: Option<(f64, f64)>,
    was_inside: bool,
    is_inside: bool,
    comb_boundary_minimum: Shape,
    comb_boundary_preferred: Shape,
    comb_move_inside_distance: Coord,
    bridge_wall_mask: Shape,
    overhang_masks: Vec<OverhangMask>,
    seam_overhang_mask: Shape,
    roofing_mask: Shape,
    flooring_mask: Shape,
    pub min_layer_time_used: bool,
    force_new_path: bool,
}

impl LayerPlan {
    pub fn new(
        storage: Arc<SliceDataStorage>,
        settings: Arc<Settings>,
        layer_nr: i64,
        z: Coord,
        layer_thickness: Coord,
        start_extruder: usize,
    ) -> Self {
        let configs_storage = PathConfigStorage::new(&settings, layer_nr, layer_thickness);
        let layer_type = raft::layer_type(&settings, layer_nr);
        let is_initial_layer =
            layer_nr == -(raft::total_extra_layers(&settings) as i64);

        let outlines = storage.layer_outlines(layer_nr);
        let (comb_boundary_minimum, comb_boundary_preferred) = match settings.combing_mode {
            CombingMode::Off => (Shape::default(), Shape::default()),
            _ => {
                let minimum = outlines.offset_from(-settings.comb_boundary_offset);
                let preferred = outlines
                    .offset_from(-(settings.comb_boundary_offset + settings.comb_move_inside_distance));
                (minimum, preferred)
            }
        };

        let extruder_count = settings.extruder_count();
        let mut plan = LayerPlan {
            configs_storage,
            layer_nr,
            z,
            final_travel_z: z,
            layer_thickness,
            is_initial_layer,
            layer_type,
            layer_start_pos_per_extruder: settings
                .extruders
                .iter()
                .map(|ext| ext.layer_start_position)
                .collect(),
            has_prime_tower_planned_per_extruder: vec![false; extruder_count],
            skirt_brim_is_processed: vec![false; extruder_count],
            last_planned_position: None,
            current_mesh: None,
            extruder_plans: vec![],
            last_extruder_previous_layer: start_extruder,
            last_planned_extruder: start_extruder,
            first_travel_destination: None,
            first_travel_destination_is_inside: false,
            first_extrusion_acc_jerk: None,
            next_layer_acc_jerk: None,
            was_inside: false,
            is_inside: false,
            comb_boundary_minimum,
            comb_boundary_preferred,
            comb_move_inside_distance: settings.comb_move_inside_distance,
            bridge_wall_mask: Shape::default(),
            overhang_masks: vec![],
            seam_overhang_mask: Shape::default(),
            roofing_mask: Shape::default(),
            flooring_mask: Shape::default(),
            min_layer_time_used: false,
            force_new_path: false,
            storage,
            settings,
        };
        let first_plan = plan.new_extruder_plan(start_extruder);
        plan.extruder_plans.push(first_plan);
        plan
    }

    fn new_extruder_plan(&self, extruder_nr: usize) -> ExtruderPlan {
        let ext = self.settings.extruder(extruder_nr);
        ExtruderPlan::new(
            extruder_nr,
            self.layer_nr,
            self.is_initial_layer,
            self.layer_type != RaftLayerType::Model && self.layer_type != RaftLayerType::Airgap,
            self.layer_thickness,
            ext.fan_speed_layer_time.clone(),
            ext.retraction.clone(),
        )
    }

    // --- simple state -----------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn storage(&self) -> &SliceDataStorage {
        &self.storage
    }

    pub fn extruder(&self) -> usize {
        self.last_planned_extruder
    }

    pub fn layer_nr(&self) -> i64 {
        self.layer_nr
    }

    pub fn is_initial_layer(&self) -> bool {
        self.is_initial_layer
    }

    pub fn last_planned_position(&self) -> Option<Point> {
        self.last_planned_position
    }

    ///The last planned position, or the user-specified layer start position
    ///when nothing was planned yet. The start position may be off the bed.
    pub fn last_planned_position_or_starting_position(&self) -> Point {
        self.last_planned_position.unwrap_or_else(|| {
            let start = self.layer_start_pos_per_extruder[self.last_planned_extruder];
            if start.x < 0
                || start.y < 0
                || start.x > self.settings.machine_width
                || start.y > self.settings.machine_depth
            {
                log::warn!("layer start position {start:?} is outside the build plate");
            }
            start
        })
    }

    pub fn is_inside_mesh(&self) -> bool {
        self.was_inside
    }

    ///Whether the destination of the next travel is inside a layer part.
    ///Walls, skin and infill are inside; support and prime tower are not.
    pub fn set_is_inside(&mut self, is_inside: bool) {
        self.is_inside = is_inside;
    }

    pub fn set_mesh(&mut self, mesh: Option<Arc<SliceMeshStorage>>) {
        self.current_mesh = mesh;
    }

    pub fn set_bridge_wall_mask(&mut self, mask: Shape) {
        self.bridge_wall_mask = mask;
    }

    pub fn set_overhang_masks(&mut self, masks: Vec<OverhangMask>) {
        self.overhang_masks = masks;
    }

    pub fn set_seam_overhang_mask(&mut self, mask: Shape) {
        self.seam_overhang_mask = mask;
    }

    pub fn seam_overhang_mask(&self) -> &Shape {
        &self.seam_overhang_mask
    }

    pub fn set_roofing_mask(&mut self, mask: Shape) {
        self.roofing_mask = mask;
    }

    pub fn set_flooring_mask(&mut self, mask: Shape) {
        self.flooring_mask = mask;
    }

    pub fn comb_boundary_preferred(&self) -> &Shape {
        &self.comb_boundary_preferred
    }

    pub fn prime_tower_is_planned(&self, extruder_nr: usize) -> bool {
        self.has_prime_tower_planned_per_extruder[extruder_nr]
    }

    pub fn set_prime_tower_is_planned(&mut self, extruder_nr: usize) {
        self.has_prime_tower_planned_per_extruder[extruder_nr] = true;
    }

    pub fn skirt_brim_is_planned(&self, extruder_nr: usize) -> bool {
        self.skirt_brim_is_processed[extruder_nr]
    }

    pub fn set_skirt_brim_is_planned(&mut self, extruder_nr: usize) {
        self.skirt_brim_is_processed[extruder_nr] = true;
    }

    ///Destination and insideness of the first travel, if the layer is not
    ///empty. The buffer uses this to fix the travel up with the previous
    ///layer's end position.
    pub fn first_travel_destination(&self) -> Option<(Point, bool)> {
        self.first_travel_destination
            .map(|p| (p, self.first_travel_destination_is_inside))
    }

    ///Force the next `get_latest_path_with_config` call to start a new path
    ///even when the config still matches.
    pub fn force_new_path_start(&mut self) {
        self.force_new_path = true;
    }

    fn current_plan(&mut self) -> &mut ExtruderPlan {
        self.extruder_plans
            .last_mut()
            .expect("a layer plan always has at least one extruder plan")
    }

    ///The last path if its config (and modifiers) still match, otherwise a
    ///freshly started path.
    #[allow(clippy::too_many_arguments)]
    fn get_latest_path_with_config(
        &mut self,
        config: &GCodePathConfig,
        space_fill_type: SpaceFillType,
        z_offset: Coord,
        flow: f64,
        width_factor: f64,
        spiralize: bool,
        speed_factor: f64,
    ) -> &mut GCodePath {
        let force_new = std::mem::take(&mut self.force_new_path);
        let mesh = self.current_mesh.clone();
        let plan = self
            .extruder_plans
            .last_mut()
            .expect("a layer plan always has at least one extruder plan");
        let matches = plan
            .paths
            .last()
            .map(|path| {
                !path.done
                    && !force_new
                    && path.config == *config
                    && path.z_offset == z_offset
                    && path.flow == flow
                    && path.width_factor == width_factor
                    && path.spiralize == spiralize
                    && path.speed_factor == speed_factor
                    && path.mesh.as_ref().map(|m| Arc::as_ptr(m))
                        == mesh.as_ref().map(|m| Arc::as_ptr(m))
            })
            .unwrap_or(false);
        if !matches {
            let mut path = GCodePath::new(
                config.clone(),
                mesh,
                space_fill_type,
                flow,
                width_factor,
                spiralize,
                speed_factor,
            );
            path.z_offset = z_offset;
            plan.paths.push(path);
        }
        plan.paths.last_mut().expect("path was just ensured")
    }

    // --- extruder switching ----------------------------------------------

    ///Plan a switch to another extruder. Returns whether the active
    ///extruder changed.
    pub fn set_extruder(&mut self, extruder_nr: usize) -> bool {
        if self.last_planned_extruder == extruder_nr && !self.extruder_plans.is_empty() {
            return false;
        }
        let previous_extruder = self.last_planned_extruder;

        // The switch retraction itself is written at export time; here the
        // plan boundaries and the standby temperature are recorded.
        {
            let plan = self.current_plan();
            if let Some(path) = plan.paths.last_mut() {
                path.done = true;
            }
        }
        let mut new_plan = self.new_extruder_plan(extruder_nr);
        new_plan.prev_extruder_standby_temp =
            Some(self.settings.extruder(previous_extruder).material.standby_temperature);
        self.extruder_plans.push(new_plan);
        self.last_planned_extruder = extruder_nr;
        self.force_new_path = true;

        // Move towards where the new extruder wants to start its layer.
        let start_pos = self.layer_start_pos_per_extruder[extruder_nr];
        if start_pos != Point::default() && self.last_planned_position.is_some() {
            self.add_travel(start_pos, true);
        }
        true
    }

    // --- travels ----------------------------------------------------------

    ///Append a travel without any combing or retraction logic.
    pub fn add_travel_simple(&mut self, p: Point) -> &mut GCodePath {
        let config = self.configs_storage.travel_config_per_extruder[self.last_planned_extruder].clone();
        if self.last_planned_position.is_none() && self.first_travel_destination.is_none() {
            self.first_travel_destination = Some(p);
            self.first_travel_destination_is_inside = self.is_inside;
        }
        self.last_planned_position = Some(p);
        let path =
            self.get_latest_path_with_config(&config, SpaceFillType::None, 0, 1.0, 1.0, false, 1.0);
        path.points.push(Point3::from_xy(p));
        path
    }

    ///Travel to `p` with the full decision tree: short moves go straight,
    ///combing avoids retractions where it can, everything else retracts and
    ///optionally z-hops.
    pub fn add_travel(&mut self, p: Point, force_retract: bool) -> &mut GCodePath {
        let extruder_nr = self.last_planned_extruder;
        let extruder = self.settings.extruder(extruder_nr).clone();
        let retraction = &extruder.retraction;
        let combing = self.settings.combing_mode;
        let combing_max_distance = self.settings.retraction_combing_max_distance;

        let Some(last_position) = self.last_planned_position else {
            // The first travel of a layer is a placeholder; the look-ahead
            // buffer fixes it up with the previous layer's end position.
            return self.add_travel_simple(p);
        };

        let distance = (p - last_position).vsize();
        if distance < extruder.nozzle_outer_diameter {
            return self.add_travel_simple(p);
        }

        let mut retract = force_retract || (retraction.enabled && distance >= retraction.min_travel);
        let mut perform_z_hop = false;
        let mut via_points: Vec<Point> = vec![];

        if combing != CombingMode::Off && !self.comb_boundary_minimum.is_empty() {
            let comb = Comb::new(
                &self.comb_boundary_preferred,
                &self.comb_boundary_minimum,
                self.comb_move_inside_distance,
            );
            match comb.calc(last_position, p) {
                CombResult::Direct => {
                    retract = force_retract;
                }
                CombResult::Path(points) => {
                    let mut length = 0;
                    let mut prev = last_position;
                    for &point in points.iter().chain(std::iter::once(&p)) {
                        length += (point - prev).vsize();
                        prev = point;
                    }
                    // Short combed travels stay unretracted; long ones
                    // retract but still follow the combed route.
                    retract = force_retract || length > combing_max_distance;
                    via_points = points;
                }
                CombResult::Fail => {
                    retract = retraction.enabled || force_retract;
                    perform_z_hop = retraction.hop_enabled;
                    if !perform_z_hop {
                        // No hop to clear printed parts; at least approach
                        // through the inside of the boundary on both ends.
                        if let Some(q) =
                            move_inside(&self.comb_boundary_minimum, last_position, self.comb_move_inside_distance)
                        {
                            via_points.push(q);
                        }
                        if let Some(q) =
                            move_inside(&self.comb_boundary_minimum, p, self.comb_move_inside_distance)
                        {
                            via_points.push(q);
                        }
                    }
                }
            }
        } else if retract {
            perform_z_hop = retraction.hop_enabled;
        }

        for point in via_points {
            self.add_travel_simple(point);
        }
        let path = self.add_travel_simple(p);
        path.retract = retract;
        path.perform_z_hop = retract && perform_z_hop;
        // Keep the via points and the destination in one logical move.
        self.was_inside = self.is_inside;
        self.extruder_plans
            .last_mut()
            .expect("plan exists")
            .paths
            .last_mut()
            .expect("path exists")
    }

    ///Plan a prime blob at the current location, wiping away from it so
    ///the blob does not end up inside the print.
    pub fn plan_prime(&mut self, prime_blob_wipe_length_mm: f64) {
        let Some(position) = self.last_planned_position else {
            return;
        };
        self.force_new_path_start();
        let wipe = crate::geometry::from_mm(prime_blob_wipe_length_mm);
        let path = self.add_travel_simple(position + Point::new(wipe, 0));
        path.retract = false;
        path.perform_prime = true;
    }

    // --- extrusion moves --------------------------------------------------

    ///Append an extrusion move, coalescing into the previous path when the
    ///configuration matches.
    #[allow(clippy::too_many_arguments)]
    pub fn add_extrusion_move(
        &mut self,
        p: Point3,
        config: &GCodePathConfig,
        space_fill_type: SpaceFillType,
        flow: f64,
        width_factor: f64,
        spiralize: bool,
        speed_factor: f64,
        fan_speed: Option<f64>,
    ) {
        if self.first_extrusion_acc_jerk.is_none() {
            self.first_extrusion_acc_jerk = Some((config.acceleration(), config.jerk()));
        }
        let path = self.get_latest_path_with_config(
            config,
            space_fill_type,
            0,
            flow,
            width_factor,
            spiralize,
            speed_factor,
        );
        path.points.push(p);
        path.fan_speed = fan_speed;
        self.last_planned_position = Some(p.xy());
        self.was_inside = self.is_inside;
    }

    ///Like `add_extrusion_move`, but splits the segment wherever it crosses
    ///an overhang band and slows each piece down by that band's factor.
    #[allow(clippy::too_many_arguments)]
    pub fn add_extrusion_move_with_gradual_overhang(
        &mut self,
        p: Point3,
        config: &GCodePathConfig,
        space_fill_type: SpaceFillType,
        flow: f64,
        width_factor: f64,
        spiralize: bool,
        speed_factor: f64,
        fan_speed: Option<f64>,
    ) {
        let Some(start) = self.last_planned_position else {
            self.add_extrusion_move(
                p,
                config,
                space_fill_type,
                flow,
                width_factor,
                spiralize,
                speed_factor,
                fan_speed,
            );
            return;
        };
        if self.overhang_masks.is_empty() || start == p.xy() {
            self.add_extrusion_move(
                p,
                config,
                space_fill_type,
                flow,
                width_factor,
                spiralize,
                speed_factor,
                fan_speed,
            );
            return;
        }

        // Gather the crossing parameters with every band boundary, then emit
        // one sub-move per piece with the factor of the band its middle is in.
        let mut params = vec![0.0, 1.0];
        for mask in &self.overhang_masks {
            for (piece_start, piece_end) in mask.supported_region.cut_segment(start, p.xy()) {
                for q in [piece_start, piece_end] {
                    let t = segment_parameter(start, p.xy(), q);
                    params.push(t);
                }
            }
        }
        params.sort_by(|a, b| a.partial_cmp(b).expect("finite parameters"));
        params.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

        for window in params.windows(2) {
            let mid = start.lerp(p.xy(), (window[0] + window[1]) / 2.0);
            let mut band_factor = 1.0;
            for mask in &self.overhang_masks {
                // Masks are ordered; the last matching band wins.
                if !mask.supported_region.inside(mid, true) {
                    band_factor = mask.speed_ratio;
                }
            }
            let target_xy = start.lerp(p.xy(), window[1]);
            let target = Point3::new(target_xy.x, target_xy.y, p.z);
            self.add_extrusion_move(
                target,
                config,
                space_fill_type,
                flow,
                width_factor,
                spiralize,
                speed_factor * band_factor,
                fan_speed,
            );
        }
    }

    // --- polygons and lines ----------------------------------------------

    ///Print one closed polygon starting at `start_idx`, with an optional
    ///wipe afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn add_polygon(
        &mut self,
        polygon: &Polygon,
        start_idx: usize,
        backwards: bool,
        config: &GCodePathConfig,
        wall_0_wipe_dist: Coord,
        spiralize: bool,
        flow_ratio: f64,
        always_retract: bool,
    ) {
        if polygon.is_empty() {
            return;
        }
        let start = polygon.at(start_idx);
        self.add_travel(start, always_retract);
        let count = polygon.len();
        let total_length = polygon.length();
        let mut travelled = 0;
        let mut prev = start;
        for i in 1..=count {
            let vertex = if backwards {
                polygon.at((start_idx + count).saturating_sub(i) % count)
            } else {
                polygon.at(start_idx + i)
            };
            travelled += (vertex - prev).vsize();
            let z_offset = if spiralize {
                ((self.layer_thickness as f64) * travelled as f64 / total_length as f64) as Coord
            } else {
                0
            };
            self.add_extrusion_move(
                Point3::new(vertex.x, vertex.y, z_offset),
                config,
                SpaceFillType::Polygons,
                flow_ratio,
                1.0,
                spiralize,
                1.0,
                None,
            );
            prev = vertex;
        }

        if wall_0_wipe_dist > 0 && !spiralize {
            // Wipe the seam closed without extruding, continuing in the
            // direction the polygon was printed.
            let mut wipe_left = wall_0_wipe_dist;
            for i in 1..=count {
                let vertex = if backwards {
                    polygon.at((start_idx + count * 2).saturating_sub(i) % count)
                } else {
                    polygon.at(start_idx + i)
                };
                let edge = (vertex - prev).vsize();
                if edge >= wipe_left {
                    let target = prev.lerp(vertex, wipe_left as f64 / edge.max(1) as f64);
                    self.add_travel_simple(target);
                    break;
                }
                self.add_travel_simple(vertex);
                wipe_left -= edge;
                prev = vertex;
            }
            self.force_new_path_start();
        }
    }

    ///Print closed polygons in optimized order.
    #[allow(clippy::too_many_arguments)]
    pub fn add_polygons_by_optimizer(
        &mut self,
        polygons: &Shape,
        config: &GCodePathConfig,
        z_seam_config: ZSeamConfig,
        wall_0_wipe_dist: Coord,
        spiralize: bool,
        flow_ratio: f64,
        always_retract: bool,
        reverse_order: bool,
        start_near_location: Option<Point>,
    ) {
        let start = start_near_location.unwrap_or(self.last_planned_position_or_starting_position());
        let mut optimizer = PathOrderOptimizer::new(start, z_seam_config)
            .with_reverse_direction(reverse_order);
        for polygon in polygons.iter() {
            if polygon.len() < 3 {
                log::debug!("dropping degenerate polygon with {} vertices", polygon.len());
                continue;
            }
            optimizer.add_polygon(polygon);
        }
        optimizer.optimize();
        let ordered: Vec<(usize, usize, bool)> = optimizer
            .paths
            .iter()
            .map(|p| (p.insertion_index, p.start_vertex, p.backwards))
            .collect();
        let kept: Vec<&Polygon> = polygons.iter().filter(|p| p.len() >= 3).collect();
        for (insertion_index, start_vertex, backwards) in ordered {
            self.add_polygon(
                kept[insertion_index],
                start_vertex,
                backwards,
                config,
                wall_0_wipe_dist,
                spiralize,
                flow_ratio,
                always_retract,
            );
        }
    }

    ///Print open polylines in optimized order, each one as travel + extrude,
    ///with an optional wipe after each line.
    #[allow(clippy::too_many_arguments)]
    pub fn add_lines_by_optimizer(
        &mut self,
        lines: &[Polyline],
        config: &GCodePathConfig,
        space_fill_type: SpaceFillType,
        enable_travel_optimization: bool,
        wipe_dist: Coord,
        flow_ratio: f64,
        near_start_location: Option<Point>,
        fan_speed: Option<f64>,
        reverse_print_direction: bool,
        order_requirements: HashSet<(usize, usize)>,
    ) {
        let start = near_start_location.unwrap_or(self.last_planned_position_or_starting_position());
        let boundary = self.comb_boundary_minimum.clone();
        let mut optimizer = PathOrderOptimizer::new(start, ZSeamConfig::default())
            .with_reverse_direction(reverse_print_direction)
            .with_order_requirements(order_requirements)
            .with_detect_loops();
        if enable_travel_optimization && !boundary.is_empty() {
            optimizer = optimizer.with_combing_boundary(&boundary);
        }
        for line in lines {
            if line.len() < 2 || line.length() == 0 {
                log::debug!("dropping degenerate line");
                continue;
            }
            optimizer.add_polyline(line);
        }
        optimizer.optimize();
        let ordered: Vec<(usize, usize, bool, bool)> = optimizer
            .paths
            .iter()
            .map(|p| (p.insertion_index, p.start_vertex, p.backwards, p.is_closed))
            .collect();
        drop(optimizer);
        let kept: Vec<&Polyline> = lines
            .iter()
            .filter(|line| line.len() >= 2 && line.length() > 0)
            .collect();
        for (insertion_index, start_vertex, backwards, is_closed) in ordered {
            let line = kept[insertion_index];
            if is_closed {
                self.add_polygon(
                    &line.to_polygon(),
                    start_vertex,
                    backwards,
                    config,
                    wipe_dist,
                    false,
                    flow_ratio,
                    false,
                );
                continue;
            }
            let points: Vec<Point> = if backwards {
                line.points().iter().rev().copied().collect()
            } else {
                line.points().to_vec()
            };
            self.add_travel(points[0], false);
            for &point in &points[1..] {
                self.add_extrusion_move(
                    Point3::from_xy(point),
                    config,
                    space_fill_type,
                    flow_ratio,
                    1.0,
                    false,
                    1.0,
                    fan_speed,
                );
            }
            if wipe_dist > 0 && points.len() >= 2 {
                let last = points[points.len() - 1];
                let before = points[points.len() - 2];
                let direction = last - before;
                if direction.vsize() > wipe_dist {
                    self.add_travel_simple(last + direction.with_length(wipe_dist));
                    self.force_new_path_start();
                }
            }
        }
    }

    ///Print lines in a monotonic order along `monotonic_direction`. Lines
    ///that are mutually adjacent within `max_adjacent_distance` keep their
    ///sorted order; a line is exempt when its midpoint lies within
    ///`exclude_distance` of the area boundary and it is shorter than that
    ///distance.
    #[allow(clippy::too_many_arguments)]
    pub fn add_lines_monotonic(
        &mut self,
        area: &Shape,
        lines: &[Polyline],
        config: &GCodePathConfig,
        space_fill_type: SpaceFillType,
        monotonic_direction: f64,
        max_adjacent_distance: Coord,
        exclude_distance: Coord,
        wipe_dist: Coord,
        flow_ratio: f64,
        fan_speed: Option<f64>,
    ) {
        let direction = glam::DVec2::new(monotonic_direction.cos(), monotonic_direction.sin());
        let midpoint = |line: &Polyline| -> Point {
            let front = line.front().unwrap_or_default();
            let back = line.back().unwrap_or_default();
            front.lerp(back, 0.5)
        };
        let excluded = |line: &Polyline| -> bool {
            if exclude_distance <= 0 || line.length() >= exclude_distance {
                return false;
            }
            let mid = midpoint(line);
            area.closest_point_on_boundary(mid)
                .map(|q| (q - mid).vsize() < exclude_distance)
                .unwrap_or(false)
        };

        // Sort all non-exempt lines along the monotonic direction and chain
        // adjacent ones with order requirements.
        let mut keys: Vec<(usize, f64)> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.len() >= 2)
            .map(|(i, line)| (i, midpoint(line).as_dvec2().dot(direction)))
            .collect();
        keys.sort_by_key(|&(_, key)| ordered_float::OrderedFloat(key));

        // Map original indices to the indices the optimizer will see after
        // degenerate lines are dropped.
        let mut requirements: HashSet<(usize, usize)> = HashSet::new();
        let mut kept_order: Vec<usize> = vec![0; lines.len()];
        {
            let mut kept_idx = 0;
            for (i, line) in lines.iter().enumerate() {
                if line.len() >= 2 {
                    kept_order[i] = kept_idx;
                    kept_idx += 1;
                }
            }
        }
        for (pos, &(i, _)) in keys.iter().enumerate() {
            if excluded(&lines[i]) {
                continue;
            }
            for &(j, _) in keys.iter().skip(pos + 1) {
                if excluded(&lines[j]) {
                    continue;
                }
                let a = midpoint(&lines[i]);
                let b = midpoint(&lines[j]);
                if (b - a).vsize() <= max_adjacent_distance {
                    requirements.insert((kept_order[i], kept_order[j]));
                }
            }
        }

        self.add_lines_by_optimizer(
            lines,
            config,
            space_fill_type,
            false,
            wipe_dist,
            flow_ratio,
            None,
            fan_speed,
            false,
            requirements,
        );
    }

    // --- walls ------------------------------------------------------------

    fn mesh_settings(&self) -> MeshSettings {
        let idx = self
            .current_mesh
            .as_ref()
            .map(|mesh| mesh.settings_idx)
            .unwrap_or(0);
        self.settings.meshes.get(idx).cloned().unwrap_or_default()
    }

    ///Distance along the wall from the given junction to the first segment
    ///entering the bridge mask, or None when no bridge lies ahead.
    fn distance_to_bridge_start(
        &self,
        wall: &ExtrusionLine,
        current_index: usize,
        min_bridge_line_len: Coord,
    ) -> Option<Coord> {
        if self.bridge_wall_mask.is_empty() {
            return None;
        }
        let count = wall.len();
        let mut distance = 0;
        for step in 0..count {
            let here = wall.junction((current_index + step) % count).p;
            let next = wall.junction((current_index + step + 1) % count).p;
            let parts = self.bridge_wall_mask.cut_segment(here, next);
            let segment_length = (next - here).vsize();
            for (part_start, part_end) in parts {
                if (part_end - part_start).vsize() >= min_bridge_line_len {
                    return Some(distance + (part_start - here).vsize());
                }
            }
            distance += segment_length;
        }
        None
    }

    ///Add one wall segment, splitting it against the roofing, flooring and
    ///bridge masks so each piece gets the right configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn add_wall_line(
        &mut self,
        p0: Point3,
        p1: Point3,
        default_config: &GCodePathConfig,
        roofing_config: &GCodePathConfig,
        flooring_config: &GCodePathConfig,
        bridge_config: &GCodePathConfig,
        flow: f64,
        width_factor: f64,
        speed_factor: f64,
        distance_to_bridge_start: Option<Coord>,
    ) {
        let segment_length = (p1.xy() - p0.xy()).vsize();
        if segment_length == 0 {
            return;
        }

        // Bridging takes precedence, then roofing, then flooring.
        let mut pieces: Vec<(Point, Point, &GCodePathConfig)> = vec![];
        if !self.bridge_wall_mask.is_empty() {
            let min_len = self.mesh_settings().bridge_wall_min_length;
            let bridge_parts = self.bridge_wall_mask.cut_segment(p0.xy(), p1.xy());
            let mut cursor = p0.xy();
            for (part_start, part_end) in bridge_parts {
                if (part_end - part_start).vsize() < min_len {
                    continue;
                }
                if cursor != part_start {
                    pieces.push((cursor, part_start, default_config));
                }
                pieces.push((part_start, part_end, bridge_config));
                cursor = part_end;
            }
            if cursor != p1.xy() {
                pieces.push((cursor, p1.xy(), default_config));
            }
        } else {
            pieces.push((p0.xy(), p1.xy(), default_config));
        }

        for (piece_start, piece_end, base_config) in pieces {
            let mut config = base_config;
            if std::ptr::eq(config, default_config) {
                let mid = piece_start.lerp(piece_end, 0.5);
                if !self.roofing_mask.is_empty() && self.roofing_mask.inside(mid, true) {
                    config = roofing_config;
                } else if !self.flooring_mask.is_empty() && self.flooring_mask.inside(mid, true) {
                    config = flooring_config;
                }
            }
            // Slow into an upcoming bridge so the line is laid down gently.
            let mut piece_speed_factor = speed_factor;
            if let Some(bridge_distance) = distance_to_bridge_start {
                if !config.is_bridge_path()
                    && bridge_distance < self.mesh_settings().bridge_wall_min_length
                {
                    piece_speed_factor = speed_factor.min(
                        bridge_config.speed() / default_config.speed().max(1e-9),
                    );
                }
            }
            let t = segment_parameter(p0.xy(), p1.xy(), piece_end);
            let z = p0.z + ((p1.z - p0.z) as f64 * t) as Coord;
            self.add_extrusion_move(
                Point3::new(piece_end.x, piece_end.y, z),
                config,
                SpaceFillType::Polygons,
                flow,
                width_factor,
                false,
                piece_speed_factor,
                None,
            );
        }
    }

    ///Add a variable-width wall, optionally with a scarf seam and smoothed
    ///speed at its ends.
    #[allow(clippy::too_many_arguments)]
    pub fn add_wall(
        &mut self,
        wall: &ExtrusionLine,
        start_idx: usize,
        default_config: &GCodePathConfig,
        roofing_config: &GCodePathConfig,
        flooring_config: &GCodePathConfig,
        bridge_config: &GCodePathConfig,
        wall_0_wipe_dist: Coord,
        flow_ratio: f64,
        always_retract: bool,
        is_closed: bool,
        is_reversed: bool,
        scarf_seam: bool,
        smooth_speed: bool,
    ) {
        if wall.is_empty() {
            return;
        }
        let mesh = self.mesh_settings();
        let wall_length = wall.length();
        let nominal_width = default_config.line_width().max(1);

        let is_small_feature = mesh.small_feature_max_length > 0
            && is_closed
            && wall_length < mesh.small_feature_max_length;
        let small_feature_factor = mesh.small_feature_speed_factor;

        let scarf_length = if scarf_seam && is_closed {
            mesh.scarf_seam_length.min(wall_length)
        } else {
            0
        };
        let scarf_max_z_offset = -(self.layer_thickness / 2);
        let accelerate_length = if smooth_speed { mesh.wall_0_accelerate_length } else { 0 };
        let decelerate_length = if smooth_speed { mesh.wall_0_decelerate_length } else { 0 };

        let start_point = wall.junction(start_idx).p;
        let force_retract = always_retract || (mesh.retract_before_outer_wall && wall.inset_idx == 0);
        let travel = self.add_travel(start_point, force_retract);
        if travel.retract && wall.inset_idx == 0 {
            // Unretract right next to the wall so pressure is fresh at the
            // seam.
            travel.unretract_before_last_travel_move = true;
        }

        let count = wall.len();
        let steps = if is_closed { count } else { count - 1 };
        let passes = if scarf_length > 0 { 2 } else { 1 };

        for pass in 0..passes {
            let is_scarf_closure = pass == 1;
            let mut travelled: Coord = 0;
            let mut distance_to_bridge: Option<Coord> = None;

            'walk: for step in 0..steps {
                let (from_idx, to_idx) = if is_reversed {
                    (
                        (start_idx + count - step % count) % count,
                        (start_idx + count - (step + 1) % count) % count,
                    )
                } else {
                    ((start_idx + step) % count, (start_idx + step + 1) % count)
                };
                let j0 = wall.junction(from_idx);
                let j1 = wall.junction(to_idx);
                if !self.bridge_wall_mask.is_empty() {
                    distance_to_bridge =
                        self.distance_to_bridge_start(wall, from_idx, mesh.bridge_wall_min_length);
                }
                let segment = (j1.p - j0.p).vsize();
                if segment == 0 {
                    continue;
                }

                // Split the segment so scarf and speed ramps stay smooth.
                let split = mesh
                    .scarf_split_distance
                    .min(mesh.wall_0_speed_split_distance)
                    .max(mesh.max_resolution.max(1));
                let pieces = if (scarf_length > 0 && travelled < scarf_length)
                    || (accelerate_length > 0 && travelled < accelerate_length)
                    || (decelerate_length > 0 && travelled + segment > wall_length - decelerate_length)
                {
                    ((segment + split - 1) / split).max(1)
                } else {
                    1
                };

                for piece in 0..pieces {
                    let t0 = piece as f64 / pieces as f64;
                    let t1 = (piece + 1) as f64 / pieces as f64;
                    let piece_start = j0.p.lerp(j1.p, t0);
                    let piece_end = j0.p.lerp(j1.p, t1);
                    let at = travelled + (segment as f64 * (t0 + t1) / 2.0) as Coord;

                    let width0 = j0.w as f64 + (j1.w - j0.w) as f64 * t0;
                    let width1 = j0.w as f64 + (j1.w - j0.w) as f64 * t1;
                    let mut width_factor = ((width0 + width1) / 2.0) / nominal_width as f64;
                    let mut flow = flow_ratio;
                    let mut z_offset = 0;
                    let mut speed_factor = 1.0;

                    // Scarf ramp: z rises from the offset to zero and the
                    // width ramps up; the closure pass overprints the same
                    // stretch with the inverse flow.
                    if scarf_length > 0 && at < scarf_length {
                        let scarf_t = at as f64 / scarf_length as f64;
                        let ramp = mesh.scarf_seam_start_ratio
                            + (1.0 - mesh.scarf_seam_start_ratio) * scarf_t;
                        if is_scarf_closure {
                            flow *= 1.0 - ramp;
                        } else {
                            flow *= ramp;
                            z_offset = (scarf_max_z_offset as f64 * (1.0 - scarf_t)) as Coord;
                        }
                    } else if is_scarf_closure {
                        // The closure only covers the scarf itself.
                        break 'walk;
                    }

                    // Speed gradient at both ends of the wall.
                    if accelerate_length > 0 && at < accelerate_length {
                        let ramp = at as f64 / accelerate_length as f64;
                        speed_factor *=
                            mesh.wall_0_start_speed_ratio + (1.0 - mesh.wall_0_start_speed_ratio) * ramp;
                    }
                    if decelerate_length > 0 && at > wall_length - decelerate_length {
                        let ramp = (wall_length - at) as f64 / decelerate_length as f64;
                        speed_factor *=
                            mesh.wall_0_end_speed_ratio + (1.0 - mesh.wall_0_end_speed_ratio) * ramp;
                    }
                    if is_small_feature {
                        speed_factor *= small_feature_factor;
                        width_factor = width_factor.max(1e-3);
                    }

                    let p0 = Point3::new(piece_start.x, piece_start.y, z_offset);
                    let p1 = Point3::new(piece_end.x, piece_end.y, z_offset);
                    self.add_wall_line(
                        p0,
                        p1,
                        default_config,
                        roofing_config,
                        flooring_config,
                        bridge_config,
                        flow,
                        width_factor,
                        speed_factor,
                        distance_to_bridge.map(|d| (d - at).max(0)),
                    );
                }
                travelled += segment;
            }
        }

        if wall_0_wipe_dist > 0 && is_closed {
            let polygon = wall.to_polygon();
            let mut wipe_left = wall_0_wipe_dist;
            let mut prev = polygon.at(start_idx);
            for i in 1..=polygon.len() {
                let vertex = polygon.at(start_idx + i);
                let edge = (vertex - prev).vsize();
                if edge >= wipe_left {
                    let target = prev.lerp(vertex, wipe_left as f64 / edge as f64);
                    self.add_travel_simple(target);
                    break;
                }
                self.add_travel_simple(vertex);
                wipe_left -= edge;
                prev = vertex;
            }
            self.force_new_path_start();
        }
    }

    ///Add a set of wall toolpaths in optimized order under the inset order
    ///constraints from the mesh settings.
    #[allow(clippy::too_many_arguments)]
    pub fn add_walls(
        &mut self,
        walls: &[ExtrusionLine],
        default_config: &GCodePathConfig,
        roofing_config: &GCodePathConfig,
        flooring_config: &GCodePathConfig,
        bridge_config: &GCodePathConfig,
        z_seam_config: ZSeamConfig,
        wall_0_wipe_dist: Coord,
        flow_ratio: f64,
        always_retract: bool,
        scarf_seam: bool,
        smooth_speed: bool,
    ) {
        let mesh = self.mesh_settings();
        let order = if mesh.order_walls_per_region {
            inset_order::get_region_order(walls, mesh.outer_inset_first)
        } else {
            inset_order::get_inset_order(walls, mesh.outer_inset_first)
        };
        let order = crate::path_order::make_order_transitive(&order);

        let start = self.last_planned_position_or_starting_position();
        let mut optimizer = PathOrderOptimizer::new(start, z_seam_config)
            .with_order_requirements(order);
        for wall in walls {
            if wall.len() < 2 {
                log::debug!("dropping degenerate wall with {} junctions", wall.len());
                continue;
            }
            if wall.is_closed {
                optimizer.add_polygon(wall);
            } else {
                optimizer.add_polyline(wall);
            }
        }
        optimizer.optimize();
        let ordered: Vec<(usize, usize, bool, bool)> = optimizer
            .paths
            .iter()
            .map(|p| (p.insertion_index, p.start_vertex, p.backwards, p.is_closed))
            .collect();
        drop(optimizer);
        let kept: Vec<&ExtrusionLine> = walls.iter().filter(|wall| wall.len() >= 2).collect();
        for (insertion_index, start_vertex, backwards, is_closed) in ordered {
            let wall = kept[insertion_index];
            let use_scarf = scarf_seam && wall.inset_idx == 0;
            let use_smooth = smooth_speed && wall.inset_idx == 0;
            self.add_wall(
                wall,
                start_vertex,
                default_config,
                roofing_config,
                flooring_config,
                bridge_config,
                if wall.inset_idx == 0 { wall_0_wipe_dist } else { 0 },
                flow_ratio,
                always_retract,
                is_closed,
                backwards,
                use_scarf,
                use_smooth,
            );
        }
    }

    ///Emit a single spiralized wall slice: XY interpolates from the wall
    ///below to this wall, Z ramps across the layer.
    #[allow(clippy::too_many_arguments)]
    pub fn spiralize_wall_slice(
        &mut self,
        config: &GCodePathConfig,
        wall: &Polygon,
        last_wall: &Polygon,
        seam_vertex_idx: usize,
        last_seam_vertex_idx: Option<usize>,
        is_top_layer: bool,
        is_bottom_layer: bool,
    ) {
        if wall.is_empty() {
            return;
        }
        let total_length = wall.length().max(1);
        let count = wall.len();
        let smooth_from_last = last_seam_vertex_idx.is_some() && !last_wall.is_empty();
        let last_shape = Shape::from_polygon(last_wall.clone());

        let start = wall.at(seam_vertex_idx);
        self.add_travel(start, false);

        let mut travelled: Coord = 0;
        let mut prev = start;
        for i in 1..=count {
            let vertex = wall.at(seam_vertex_idx + i);
            travelled += (vertex - prev).vsize();
            let progress = travelled as f64 / total_length as f64;

            // Blend towards the wall below at the start of the slice so
            // consecutive spiral layers join without a visible step.
            let target = if smooth_from_last && progress < 1.0 {
                match last_shape.closest_point_on_boundary(vertex) {
                    Some(below) => below.lerp(vertex, progress),
                    None => vertex,
                }
            } else {
                vertex
            };

            let z_offset = if is_top_layer {
                0
            } else {
                (self.layer_thickness as f64 * progress) as Coord
            };
            let flow = if is_bottom_layer {
                progress
            } else if is_top_layer {
                1.0 - progress
            } else {
                1.0
            };
            self.add_extrusion_move(
                Point3::new(target.x, target.y, z_offset),
                config,
                SpaceFillType::Polygons,
                flow,
                1.0,
                !is_top_layer,
                1.0,
                None,
            );
            prev = vertex;
        }
    }

    // --- plan-wide passes -------------------------------------------------

    ///Run a registered external transformation on all paths.
    pub fn apply_modify_plugin(&mut self, plugin: Option<&dyn PlanModifier>) {
        let Some(plugin) = plugin else { return };
        let layer_nr = self.layer_nr;
        for plan in &mut self.extruder_plans {
            plugin.modify(plan.extruder_nr, layer_nr, &mut plan.paths);
        }
    }

    pub fn apply_back_pressure_compensation(&mut self) {
        for plan in &mut self.extruder_plans {
            let factor = self
                .settings
                .extruder(plan.extruder_nr)
                .back_pressure_compensation_factor;
            plan.apply_back_pressure_compensation(factor);
        }
    }

    ///Split extrusion paths so flow changes ramp over a minimum distance
    ///instead of jumping.
    pub fn apply_gradual_flow(&mut self) {
        for plan in &mut self.extruder_plans {
            let ext = self.settings.extruder(plan.extruder_nr);
            if !ext.gradual_flow_enabled || ext.max_flow_acceleration <= 0.0 {
                continue;
            }
            let step = ext.gradual_flow_discretisation_step.max(50);
            let max_flow_acceleration = ext.max_flow_acceleration;

            let mut current_flow = 0.0; // mm³/s
            let mut position: Option<Point3> = None;
            let old_paths = std::mem::take(&mut plan.paths);
            let mut new_paths: Vec<GCodePath> = Vec::with_capacity(old_paths.len());
            for mut path in old_paths {
                if path.is_travel_path() {
                    if let Some(&last) = path.points.last() {
                        position = Some(last);
                    }
                    new_paths.push(path);
                    continue;
                }
                let target_flow = path.extrusion_mm3_per_mm() * path.effective_speed();
                if target_flow <= current_flow || position.is_none() {
                    current_flow = target_flow;
                    if let Some(&last) = path.points.last() {
                        position = Some(last);
                    }
                    new_paths.push(path);
                    continue;
                }
                // Ramp from current_flow up to target_flow along the first
                // part of this path.
                let ramp_time = (target_flow - current_flow) / max_flow_acceleration;
                let ramp_distance = crate::geometry::from_mm(path.effective_speed() * ramp_time);
                let mut remaining = ramp_distance;
                let mut cursor = position.expect("position known");
                let points = std::mem::take(&mut path.points);
                let mut tail_points: Vec<Point3> = vec![];
                for point in points {
                    if remaining <= 0 {
                        tail_points.push(point);
                        continue;
                    }
                    let segment_length = (point.xy() - cursor.xy()).vsize();
                    let mut consumed = 0;
                    while consumed < segment_length && remaining > 0 {
                        let piece = step.min(segment_length - consumed).min(remaining);
                        let t = (consumed + piece) as f64 / segment_length as f64;
                        let target = Point3::new(
                            cursor.x + ((point.x - cursor.x) as f64 * t) as Coord,
                            cursor.y + ((point.y - cursor.y) as f64 * t) as Coord,
                            cursor.z + ((point.z - cursor.z) as f64 * t) as Coord,
                        );
                        let progress = 1.0 - remaining as f64 / ramp_distance.max(1) as f64;
                        let flow_here = current_flow + (target_flow - current_flow) * progress;
                        let mut ramp_path = path.clone();
                        ramp_path.points = vec![target];
                        ramp_path.speed_factor =
                            path.speed_factor * (flow_here / target_flow).clamp(0.05, 1.0);
                        new_paths.push(ramp_path);
                        consumed += piece;
                        remaining -= piece;
                    }
                    if consumed < segment_length {
                        tail_points.push(point);
                    }
                    cursor = point;
                }
                if !tail_points.is_empty() {
                    let mut tail = path.clone();
                    tail.points = tail_points;
                    new_paths.push(tail);
                }
                current_flow = target_flow;
                position = Some(cursor);
            }
            plan.paths = new_paths;
        }
    }

    ///Compute time estimates, enforce the minimum layer time and derive the
    ///fan speed for every extruder plan.
    pub fn process_fan_speed_and_minimum_layer_time(&mut self, starting_position: Point) {
        let mut position = starting_position;
        let mut times: Vec<f64> = vec![];
        for plan in &mut self.extruder_plans {
            let estimates = plan.compute_naive_time_estimates(position);
            times.push(estimates.total_time());
            if let Some(last) = plan.paths.iter().rev().find_map(|p| p.points.last().copied()) {
                position = last.xy();
            }
        }
        let maximum_cool_min_layer_time = self
            .extruder_plans
            .iter()
            .map(|plan| plan.fan_speed_layer_time_settings.cool_min_layer_time)
            .fold(0.0, f64::max);

        let total: f64 = times.iter().sum();
        for (idx, plan) in self.extruder_plans.iter_mut().enumerate() {
            let time_other_plans = total - times[idx];
            plan.force_minimal_layer_time(maximum_cool_min_layer_time, time_other_plans);
            plan.process_fan_speed_for_minimal_layer_time(time_other_plans);
            plan.process_fan_speed_for_first_layers();
            self.min_layer_time_used |= plan.min_layer_time_used;
        }
    }

    // --- coasting and emission -------------------------------------------

    ///Decide for every path whether and where coasting replaces the end of
    ///its extrusion.
    fn calculate_paths_coasting(
        &self,
        extruder_nr: usize,
        paths: &[GCodePath],
        start_position: Point3,
    ) -> Vec<PathCoasting> {
        let coasting = &self.settings.extruder(extruder_nr).coasting;
        let mut result = vec![
            PathCoasting {
                apply: ApplyCoasting::NoCoasting,
                start_index: 0,
                start_pos: Point3::default(),
            };
            paths.len()
        ];
        if !coasting.enabled || coasting.volume <= 0.0 {
            return result;
        }

        let mut position = start_position;
        for (idx, path) in paths.iter().enumerate() {
            let path_start = position;
            if let Some(&last) = path.points.last() {
                position = last;
            }
            if path.is_travel_path() || path.points.is_empty() {
                continue;
            }
            // Coasting only applies when the extrusion ends here: the next
            // path is a travel (or the plan ends).
            let followed_by_travel = paths
                .get(idx + 1)
                .map(|next| next.is_travel_path())
                .unwrap_or(true);
            if !followed_by_travel {
                continue;
            }

            let mm3_per_mm = path.extrusion_mm3_per_mm();
            if mm3_per_mm <= 0.0 {
                continue;
            }
            let path_volume = to_mm(path.length(path_start)) * mm3_per_mm;

            if path_volume <= coasting.volume {
                result[idx].apply = ApplyCoasting::CoastEntirePath;
                continue;
            }
            if path_volume < coasting.min_volume {
                continue;
            }

            // Walk backwards from the path end to find the point where the
            // remaining swept volume equals the coasting volume.
            let coast_distance = crate::geometry::from_mm(coasting.volume / mm3_per_mm);
            let mut remaining = coast_distance;
            let mut cursor = *path.points.last().expect("path has points");
            for point_idx in (0..path.points.len()).rev() {
                let previous = if point_idx == 0 {
                    path_start
                } else {
                    path.points[point_idx - 1]
                };
                let segment = (cursor.xy() - previous.xy()).vsize();
                if segment >= remaining {
                    let t = remaining as f64 / segment.max(1) as f64;
                    let xy = cursor.xy().lerp(previous.xy(), t);
                    result[idx].apply = ApplyCoasting::PartialCoasting;
                    result[idx].start_index = point_idx;
                    result[idx].start_pos = Point3::new(xy.x, xy.y, cursor.z);
                    break;
                }
                remaining -= segment;
                cursor = previous;
            }
        }
        result
    }

    ///Final emission: write every extruder plan of this layer to G-code.
    pub fn write_gcode(&mut self, gcode: &mut GCodeExport) {
        gcode.set_z(self.z);
        gcode.write_layer_comment(self.layer_nr);

        let plan_count = self.extruder_plans.len();
        if plan_count == 1 && self.extruder_plans[0].paths.is_empty() {
            // An empty layer still gets its comment so post-processors can
            // count layers.
            self.last_extruder_previous_layer = self.extruder_plans[0].extruder_nr;
            return;
        }

        for plan_idx in 0..plan_count {
            let extruder_nr = self.extruder_plans[plan_idx].extruder_nr;
            let extruder = self.settings.extruder(extruder_nr).clone();

            if gcode.extruder_nr() != extruder_nr {
                let prev_extruder = gcode.extruder_nr();
                let switch_retraction = self.settings.extruder(prev_extruder).switch_retraction.clone();
                let hop = if switch_retraction.hop_enabled {
                    switch_retraction.hop
                } else {
                    0
                };
                gcode.switch_extruder(extruder_nr, &switch_retraction, hop);
                gcode.write_prime_train(extruder.travel.speed);
                if let Some(standby) = self.extruder_plans[plan_idx].prev_extruder_standby_temp {
                    gcode.write_temperature_command(prev_extruder, standby, false, false);
                }
            }
            gcode.mark_extruder_used(extruder_nr);

            let fan_speed = self.extruder_plans[plan_idx].fan_speed();
            gcode.write_prepare_fans_for_extrusion(fan_speed);

            let coasting_decisions = self.calculate_paths_coasting(
                extruder_nr,
                &self.extruder_plans[plan_idx].paths,
                gcode.position(),
            );

            let path_count = self.extruder_plans[plan_idx].paths.len();
            let mut last_feature: Option<PrintFeatureType> = None;
            for path_idx in 0..path_count {
                // Inserts scheduled before this path.
                {
                    let plan = &mut self.extruder_plans[plan_idx];
                    plan.handle_inserts(path_idx, gcode, 0.0);
                }
                let path = self.extruder_plans[plan_idx].paths[path_idx].clone();

                if path.is_travel_path() {
                    self.write_travel_path(gcode, &path, plan_idx, path_idx, &extruder);
                    continue;
                }

                // Extrusion path.
                if path.config.feature() != last_feature.unwrap_or(PrintFeatureType::None) {
                    gcode.write_type_comment(path.config.feature());
                    last_feature = Some(path.config.feature());
                }
                if let Some(fan_override) = path.fan_speed() {
                    gcode.write_fan_command(fan_override, Some(extruder_nr));
                } else {
                    gcode.write_fan_command(fan_speed, Some(extruder_nr));
                }
                gcode.write_print_acceleration(path.config.acceleration());
                gcode.write_jerk(path.config.jerk());

                let speed = path.effective_speed();
                let coasting = &coasting_decisions[path_idx];
                let path_time = path.estimates.total_time();
                let segment_count = path.points.len().max(1);

                match coasting.apply {
                    ApplyCoasting::CoastEntirePath => {
                        let coast_speed = speed * extruder.coasting.speed_ratio;
                        for point in &path.points {
                            let target = self.absolute_point(&path, *point);
                            gcode.write_travel(target, coast_speed, None);
                        }
                    }
                    ApplyCoasting::PartialCoasting => {
                        for (point_idx, point) in path.points.iter().enumerate() {
                            if point_idx < coasting.start_index {
                                let target = self.absolute_point(&path, *point);
                                gcode.write_extrusion(
                                    target,
                                    speed,
                                    path.extrusion_mm3_per_mm(),
                                    path.config.feature(),
                                    false,
                                );
                            } else if point_idx == coasting.start_index {
                                let split = self.absolute_point(&path, coasting.start_pos);
                                gcode.write_extrusion(
                                    split,
                                    speed,
                                    path.extrusion_mm3_per_mm(),
                                    path.config.feature(),
                                    false,
                                );
                                let target = self.absolute_point(&path, *point);
                                gcode.write_travel(target, speed * extruder.coasting.speed_ratio, None);
                            } else {
                                let target = self.absolute_point(&path, *point);
                                gcode.write_travel(target, speed * extruder.coasting.speed_ratio, None);
                            }
                        }
                    }
                    ApplyCoasting::NoCoasting => {
                        for (point_idx, point) in path.points.iter().enumerate() {
                            let target = self.absolute_point(&path, *point);
                            gcode.write_extrusion(
                                target,
                                speed,
                                path.extrusion_mm3_per_mm(),
                                path.config.feature(),
                                false,
                            );
                            // Inserts that fall inside this path by time.
                            let elapsed = path_time * (point_idx + 1) as f64 / segment_count as f64;
                            let plan = &mut self.extruder_plans[plan_idx];
                            plan.handle_inserts(path_idx, gcode, elapsed);
                        }
                    }
                }
            }

            {
                let plan = &mut self.extruder_plans[plan_idx];
                plan.handle_all_remaining_inserts(gcode);
                if plan.extra_time > 0.0 {
                    // Cool-down dwell at the end of the plan.
                    gcode.write_delay(plan.extra_time);
                }
            }
        }

        self.last_extruder_previous_layer = gcode.extruder_nr();
        gcode.update_total_print_time();
        gcode.write_time_comment(gcode.sum_total_print_times());
    }

    fn absolute_point(&self, path: &GCodePath, point: Point3) -> Point3 {
        Point3::new(
            point.x,
            point.y,
            self.z + path.config.z_offset() + path.z_offset + point.z,
        )
    }

    ///Write one travel path: retraction (stationary or anti-ooze), z-hop and
    ///the travel segments themselves.
    fn write_travel_path(
        &self,
        gcode: &mut GCodeExport,
        path: &GCodePath,
        _plan_idx: usize,
        _path_idx: usize,
        extruder: &crate::settings::ExtruderSettings,
    ) {
        let speed = path.config.speed() * path.speed_factor;
        gcode.write_travel_acceleration(path.config.acceleration());
        gcode.write_jerk(path.config.jerk());

        if path.perform_prime {
            gcode.write_prime_train(speed);
            gcode.add_extra_prime_amount(extruder.retraction.prime_volume);
        }

        if path.retract && !gcode.is_retracted() {
            let anti_ooze = &extruder.anti_ooze;
            if anti_ooze.enabled && !extruder.firmware_retract && path.points.len() >= 1 {
                // Split the retraction over standing still, the z-hop and
                // the first stretch of the travel.
                let total = extruder.retraction.amount;
                let still_amount = total * anti_ooze.still_ratio;
                let hop_amount = if path.perform_z_hop {
                    total * anti_ooze.zhop_ratio
                } else {
                    0.0
                };
                let travel_amount = total - still_amount - hop_amount;

                gcode.write_retraction(&extruder.retraction, true, false, Some(still_amount));
                if path.perform_z_hop {
                    gcode.write_zhop_start(
                        extruder.retraction.hop,
                        0.0,
                        Some(still_amount + hop_amount),
                        anti_ooze.zhop_ratio,
                    );
                }
                // Spread the remaining retraction across the travel until
                // the anti-ooze speed has had time to pull it all back.
                let travel_distance_needed = crate::geometry::from_mm(
                    speed * (travel_amount / anti_ooze.speed.max(1e-6)),
                );
                let mut accumulated = 0;
                let mut last = gcode.position().xy();
                for point in &path.points {
                    let target_xy = point.xy();
                    let segment = (target_xy - last).vsize();
                    let before = accumulated;
                    accumulated += segment;
                    let z = gcode.current_layer_z() + gcode.is_z_hopped();
                    if before < travel_distance_needed {
                        let fraction = (accumulated.min(travel_distance_needed) as f64)
                            / travel_distance_needed.max(1) as f64;
                        let target_amount = still_amount + hop_amount + travel_amount * fraction;
                        gcode.write_travel(
                            Point3::new(target_xy.x, target_xy.y, z),
                            speed,
                            Some(target_amount),
                        );
                    } else {
                        gcode.write_travel(Point3::new(target_xy.x, target_xy.y, z), speed, None);
                    }
                    last = target_xy;
                }
                if path.perform_z_hop {
                    // Any prime still owed is paid while hopping back down.
                    gcode.set_z_hop_prime_leftover(0.0, anti_ooze.zhop_ratio);
                }
                return;
            }

            gcode.write_retraction(&extruder.retraction, false, false, None);
            if path.perform_z_hop {
                gcode.write_zhop_start(extruder.retraction.hop, 0.0, None, 0.0);
            }
        }

        let point_count = path.points.len();
        for (point_idx, point) in path.points.iter().enumerate() {
            if path.unretract_before_last_travel_move && point_idx + 1 == point_count {
                // Build pressure right before the wall starts.
                gcode.write_unretraction_and_prime();
            }
            let z = gcode.current_layer_z() + gcode.is_z_hopped() + path.z_offset + point.z;
            gcode.write_travel(Point3::new(point.x, point.y, z), speed, None);
        }
    }
}

///Parameter of `q` along the segment a..b, in [0, 1].
fn segment_parameter(a: Point, b: Point, q: Point) -> f64 {
    let ab = b - a;
    let len2 = ab.vsize2();
    if len2 == 0 {
        return 0.0;
    }
    (ab.dot(q - a) as f64 / len2 as f64).clamp(0.0, 1.0)
}
