//!Whole-plan scenarios: walls on a simple square, combing travels, path
//!coalescing and coasting.

use std::sync::Arc;

use gcode_planner::geometry::{from_mm, ExtrusionJunction, ExtrusionLine, Point, Point3, Polygon, Shape};
use gcode_planner::path_planning::SpaceFillType;
use gcode_planner::storage::{SliceDataStorage, SliceLayer, SliceLayerPart, SliceMeshStorage};
use gcode_planner::{GCodeExport, LayerPlan, Settings};

fn square_ring(inset_idx: usize, origin_mm: f64, side_mm: f64) -> ExtrusionLine {
    let mut line = ExtrusionLine::new(inset_idx, false, true);
    let o = from_mm(origin_mm);
    let s = from_mm(origin_mm + side_mm);
    line.junctions = vec![
        ExtrusionJunction::new(Point::new(o, o), 400, inset_idx),
        ExtrusionJunction::new(Point::new(s, o), 400, inset_idx),
        ExtrusionJunction::new(Point::new(s, s), 400, inset_idx),
        ExtrusionJunction::new(Point::new(o, s), 400, inset_idx),
    ];
    line
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.meshes[0].wall_0.speed = 60.0;
    settings.meshes[0].wall_x.speed = 60.0;
    settings.meshes[0].wall_0_wipe_dist = 0;
    settings.meshes[0].outer_inset_first = true;
    settings.extruders[0].fan_speed_layer_time.cool_min_layer_time = 0.0;
    settings
}

fn empty_plan(settings: &Arc<Settings>) -> LayerPlan {
    LayerPlan::new(
        Arc::new(SliceDataStorage::default()),
        settings.clone(),
        5,
        1_200,
        200,
        0,
    )
}

#[test]
fn square_with_two_walls_plans_two_wall_paths() {
    let settings = Arc::new(test_settings());
    let mut layer = empty_plan(&settings);

    let walls = vec![square_ring(0, 0.0, 10.0), square_ring(1, 0.2, 9.6)];
    let configs = layer.configs_storage.mesh_configs[0].clone();
    layer.add_walls(
        &walls,
        &configs.inset0_config,
        &configs.roofing_config,
        &configs.flooring_config,
        &configs.bridge_inset0_config,
        Default::default(),
        0,
        1.0,
        false,
        false,
        false,
    );
    layer.process_fan_speed_and_minimum_layer_time(Point::default());

    let plan = &layer.extruder_plans[0];
    let wall_paths: Vec<_> = plan.paths.iter().filter(|p| !p.is_travel_path()).collect();
    assert_eq!(wall_paths.len(), 2, "one coalesced path per wall");

    // Outer wall first, and perimeter lengths of 40 mm and 38.4 mm.
    let outer_length = wall_paths[0].length(Point3::from_xy(wall_paths[0].points[3].xy()));
    let inner_length = wall_paths[1].length(Point3::from_xy(wall_paths[1].points[3].xy()));
    let mut lengths = [outer_length, inner_length];
    lengths.sort();
    assert!((lengths[1] - from_mm(40.0)).abs() < 100, "outer {lengths:?}");
    assert!((lengths[0] - from_mm(38.4)).abs() < 100, "inner {lengths:?}");

    // Total extruded volume: (40 + 38.4) mm · 0.4 mm · 0.2 mm.
    let expected = (40.0 + 38.4) * 0.4 * 0.2;
    assert!(
        (plan.estimates.material - expected).abs() < expected * 0.01,
        "volume {} vs {expected}",
        plan.estimates.material
    );
}

#[test]
fn consecutive_moves_with_same_config_coalesce() {
    let settings = Arc::new(test_settings());
    let mut layer = empty_plan(&settings);
    let config = layer.configs_storage.mesh_configs[0].inset0_config.clone();

    layer.add_extrusion_move(
        Point3::new(from_mm(10.0), 0, 0),
        &config,
        SpaceFillType::Polygons,
        1.0,
        1.0,
        false,
        1.0,
        None,
    );
    layer.add_extrusion_move(
        Point3::new(from_mm(20.0), 0, 0),
        &config,
        SpaceFillType::Polygons,
        1.0,
        1.0,
        false,
        1.0,
        None,
    );
    assert_eq!(layer.extruder_plans[0].paths.len(), 1);
    assert_eq!(layer.extruder_plans[0].paths[0].points.len(), 2);

    layer.force_new_path_start();
    layer.add_extrusion_move(
        Point3::new(from_mm(30.0), 0, 0),
        &config,
        SpaceFillType::Polygons,
        1.0,
        1.0,
        false,
        1.0,
        None,
    );
    assert_eq!(layer.extruder_plans[0].paths.len(), 2);
}

fn storage_with_outline(outline: Shape) -> Arc<SliceDataStorage> {
    let mut storage = SliceDataStorage::default();
    storage.meshes.push(Arc::new(SliceMeshStorage {
        name: "part".to_string(),
        settings_idx: 0,
        extruder_nr: 0,
        layers: vec![
            SliceLayer {
                z: 200,
                thickness: 200,
                parts: vec![SliceLayerPart {
                    outline,
                    ..Default::default()
                }],
            };
            8
        ],
    }));
    storage.total_layers = 8;
    storage.extruder_is_used = vec![true];
    Arc::new(storage)
}

#[test]
fn combing_avoids_a_hole_without_retracting() {
    // A 30x20 mm plate with a vertical slot in the middle; the travel from
    // the left half to the right half must comb around the slot.
    let outer = Polygon::new(vec![
        Point::new(0, 0),
        Point::new(from_mm(30.0), 0),
        Point::new(from_mm(30.0), from_mm(20.0)),
        Point::new(0, from_mm(20.0)),
    ]);
    let mut hole = Polygon::new(vec![
        Point::new(from_mm(14.0), from_mm(4.0)),
        Point::new(from_mm(16.0), from_mm(4.0)),
        Point::new(from_mm(16.0), from_mm(16.0)),
        Point::new(from_mm(14.0), from_mm(16.0)),
    ]);
    hole.reverse();
    let storage = storage_with_outline(Shape::new(vec![outer, hole]));

    let settings = Arc::new(test_settings());
    let mut layer = LayerPlan::new(storage, settings, 5, 1_200, 200, 0);

    // Establish a position, then travel across the slot.
    layer.add_travel_simple(Point::new(from_mm(5.0), from_mm(10.0)));
    layer.add_travel(Point::new(from_mm(25.0), from_mm(10.0)), false);

    let paths = &layer.extruder_plans[0].paths;
    let travel = paths.last().expect("travel path planned");
    assert!(!travel.retract, "combed travel must not retract");
    assert!(
        travel.points.len() >= 3,
        "combed travel follows the boundary, got {} points",
        travel.points.len()
    );
}

#[test]
fn coasting_replaces_the_end_of_a_path_conserving_volume() {
    let mut settings = test_settings();
    settings.extruders[0].coasting.enabled = true;
    settings.extruders[0].coasting.volume = 0.5;
    settings.extruders[0].coasting.min_volume = 0.2;
    let settings = Arc::new(settings);

    let mut layer = empty_plan(&settings);
    let config = layer.configs_storage.mesh_configs[0].inset0_config.clone();
    layer.add_travel_simple(Point::new(0, 0));
    layer.add_extrusion_move(
        Point3::new(from_mm(50.0), 0, 0),
        &config,
        SpaceFillType::Polygons,
        1.0,
        1.0,
        false,
        1.0,
        None,
    );
    layer.process_fan_speed_and_minimum_layer_time(Point::default());

    let mut gcode = GCodeExport::new();
    gcode.pre_setup(&settings, 0);
    layer.write_gcode(&mut gcode);

    // 50 mm at 0.08 mm³/mm is 4 mm³; 0.5 mm³ is coasted.
    let extruded = gcode.get_total_filament_used(0);
    assert!(
        (extruded - 3.5).abs() < 0.004,
        "extruded {extruded} mm³ instead of 3.5"
    );
    let output = gcode.buffered_output();
    let lines: Vec<&str> = output.lines().collect();
    let last_extrusion = lines
        .iter()
        .rposition(|line| line.starts_with("G1") && line.contains(" E"))
        .expect("extrusion line exists");
    let has_coast_travel = lines
        .iter()
        .skip(last_extrusion + 1)
        .any(|line| line.starts_with("G0"));
    assert!(has_coast_travel, "coasting travel follows the extrusion:\n{output}");
}

#[test]
fn extrusion_only_happens_unretracted() {
    let settings = Arc::new(test_settings());
    let mut layer = empty_plan(&settings);
    let config = layer.configs_storage.mesh_configs[0].inset0_config.clone();

    layer.add_travel_simple(Point::new(0, 0));
    layer.add_extrusion_move(
        Point3::new(from_mm(10.0), 0, 0),
        &config,
        SpaceFillType::Polygons,
        1.0,
        1.0,
        false,
        1.0,
        None,
    );
    // A long travel that retracts, then another extrusion.
    let travel = layer.add_travel(Point::new(from_mm(100.0), from_mm(100.0)), true);
    assert!(travel.retract);
    layer.add_extrusion_move(
        Point3::new(from_mm(110.0), from_mm(100.0), 0),
        &config,
        SpaceFillType::Polygons,
        1.0,
        1.0,
        false,
        1.0,
        None,
    );
    layer.process_fan_speed_and_minimum_layer_time(Point::default());

    let mut gcode = GCodeExport::new();
    gcode.pre_setup(&settings, 0);
    layer.write_gcode(&mut gcode);
    assert!(!gcode.is_retracted(), "plan ends unretracted");

    // E must never decrease on a motion line: retraction only happens on
    // stationary lines, and every extrusion is preceded by an unretract.
    let mut last_e = f64::NEG_INFINITY;
    for line in gcode.buffered_output().lines() {
        if !line.starts_with("G1") || !line.contains(" X") {
            continue;
        }
        if let Some(e_part) = line.split(" E").nth(1) {
            let e: f64 = e_part
                .split_whitespace()
                .next()
                .unwrap()
                .parse()
                .expect("E value parses");
            assert!(e >= last_e, "E went backwards on a motion line: {line}");
            last_e = e;
        }
    }
}
