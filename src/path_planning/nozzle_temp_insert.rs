use std::cmp::Ordering;

use crate::export::GCodeExport;

///A temperature command to be written in between paths; used for preheating
///and standby cooling scheduled by the layer-plan buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct NozzleTempInsert {
    ///The path before which to write this command.
    pub path_idx: usize,
    ///The extruder whose temperature is set.
    pub extruder: usize,
    pub temperature: f64,
    ///Whether to wait until the temperature is reached.
    pub wait: bool,
    ///Seconds after the start of the path at `path_idx` before which the
    ///command must be written.
    pub time_after_path_start: f64,
}

impl NozzleTempInsert {
    pub fn write(&self, gcode: &mut GCodeExport) {
        gcode.write_temperature_command(self.extruder, self.temperature, self.wait, false);
    }
}

impl Eq for NozzleTempInsert {}

impl PartialOrd for NozzleTempInsert {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NozzleTempInsert {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path_idx.cmp(&other.path_idx).then(
            self.time_after_path_start
                .partial_cmp(&other.time_after_path_start)
                .unwrap_or(Ordering::Equal),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_order_by_path_then_time() {
        let a = NozzleTempInsert {
            path_idx: 1,
            extruder: 0,
            temperature: 200.0,
            wait: false,
            time_after_path_start: 0.0,
        };
        let b = NozzleTempInsert {
            path_idx: 1,
            extruder: 0,
            temperature: 210.0,
            wait: false,
            time_after_path_start: 2.5,
        };
        let c = NozzleTempInsert {
            path_idx: 2,
            extruder: 0,
            temperature: 220.0,
            wait: false,
            time_after_path_start: 0.0,
        };
        let mut inserts = vec![c.clone(), b.clone(), a.clone()];
        inserts.sort();
        assert_eq!(inserts, vec![a, b, c]);
    }
}
