//!End-to-end: plan a few layers of a part through the look-ahead buffer and
//!check the shape of the emitted G-code.

use std::sync::Arc;

use gcode_planner::geometry::{from_mm, ExtrusionJunction, ExtrusionLine, Point, Shape};
use gcode_planner::storage::{SliceDataStorage, SliceLayer, SliceLayerPart, SliceMeshStorage};
use gcode_planner::{GCodeExport, LayerPlan, LayerPlanBuffer, Settings};

fn ring(inset_idx: usize, origin_mm: f64, side_mm: f64) -> ExtrusionLine {
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

fn build_storage(layer_count: usize) -> Arc<SliceDataStorage> {
    let outline = Shape::from_polygon(
        gcode_planner::geometry::Polygon::new(vec![
            Point::new(0, 0),
            Point::new(from_mm(10.0), 0),
            Point::new(from_mm(10.0), from_mm(10.0)),
            Point::new(0, from_mm(10.0)),
        ]),
    );
    let layer = SliceLayer {
        z: 200,
        thickness: 200,
        parts: vec![SliceLayerPart {
            outline,
            wall_toolpaths: vec![vec![ring(0, 0.2, 9.6)], vec![ring(1, 0.6, 8.8)]],
            ..Default::default()
        }],
    };
    let mut storage = SliceDataStorage::default();
    storage.meshes.push(Arc::new(SliceMeshStorage {
        name: "cube".to_string(),
        settings_idx: 0,
        extruder_nr: 0,
        layers: vec![layer; layer_count],
    }));
    storage.total_layers = layer_count;
    storage.extruder_is_used = vec![true];
    Arc::new(storage)
}

#[test]
fn layers_flow_through_the_buffer_into_gcode() {
    let layer_count = 8;
    let storage = build_storage(layer_count);
    let settings = Arc::new(Settings::default());

    let mut gcode = GCodeExport::new();
    gcode.pre_setup(&settings, 0);
    let mut buffer = LayerPlanBuffer::new(settings.clone());

    for layer_nr in 0..layer_count as i64 {
        let z = 200 + layer_nr * 200;
        let mut layer = LayerPlan::new(storage.clone(), settings.clone(), layer_nr, z, 200, 0);
        let mesh = storage.meshes[0].clone();
        layer.set_mesh(Some(mesh.clone()));

        let configs = layer.configs_storage.mesh_configs[0].clone();
        let walls: Vec<ExtrusionLine> = mesh.layers[layer_nr as usize].parts[0]
            .wall_toolpaths
            .iter()
            .flatten()
            .cloned()
            .collect();
        layer.add_walls(
            &walls,
            &configs.inset0_config,
            &configs.roofing_config,
            &configs.flooring_config,
            &configs.bridge_inset0_config,
            Default::default(),
            settings.meshes[0].wall_0_wipe_dist,
            1.0,
            false,
            false,
            false,
        );
        layer.apply_back_pressure_compensation();
        layer.process_fan_speed_and_minimum_layer_time(Point::default());
        buffer.handle(layer, &mut gcode);
    }
    buffer.flush(&mut gcode);
    gcode.finalize("M84");

    let output = gcode.buffered_output().to_string();

    // Every layer announces itself, exactly once, in ascending order.
    let mut last_found = None;
    for layer_nr in 0..layer_count {
        let marker = format!(";LAYER:{layer_nr}\n");
        let position = output.find(&marker);
        assert!(position.is_some(), "missing {marker:?}");
        if let (Some(prev), Some(here)) = (last_found, position) {
            assert!(here > prev, "layers out of order");
        }
        last_found = position;
    }

    // Feature comments and motion commands are present.
    assert!(output.contains(";TYPE:WALL-OUTER"), "{output}");
    assert!(output.contains(";TYPE:WALL-INNER"));
    assert!(output.contains("G1 F"));
    assert!(output.contains(";TIME_ELAPSED:"));
    assert!(output.ends_with('\n'));

    // The header can parse its own time back.
    let total = gcode.sum_total_print_times();
    assert!(total > 0.0);
    let header = gcode.get_file_header(
        &[true],
        Some(total),
        &[gcode.get_total_filament_used(0)],
        &[String::new()],
    );
    assert!(header.starts_with(";FLAVOR:Marlin"));
    let time_line = header
        .lines()
        .find(|line| line.starts_with(";TIME:"))
        .expect("header has a TIME line");
    let parsed: f64 = time_line.trim_start_matches(";TIME:").parse().unwrap();
    assert!((parsed - total).abs() <= 1.0);

    // Material accounting matches the geometry: two rings per layer.
    let per_layer = (4.0 * 9.6 + 4.0 * 8.8) * 0.4 * 0.2;
    let expected = per_layer * layer_count as f64;
    let used = gcode.get_total_filament_used(0);
    assert!(
        (used - expected).abs() < expected * 0.05,
        "used {used} mm³, expected about {expected}"
    );
}

#[test]
fn empty_layers_only_write_their_comment() {
    let storage = Arc::new(SliceDataStorage::default());
    let settings = Arc::new(Settings::default());
    let mut gcode = GCodeExport::new();
    gcode.pre_setup(&settings, 0);

    let mut layer = LayerPlan::new(storage, settings, 3, 800, 200, 0);
    layer.write_gcode(&mut gcode);
    let output = gcode.buffered_output();
    assert!(output.contains(";LAYER:3"));
    assert!(!output.contains("G1"), "{output}");
}
