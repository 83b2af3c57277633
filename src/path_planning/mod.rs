//!The path data model: contiguous motion segments of uniform configuration
//!and the temperature commands scheduled between them.

mod estimates;
mod gcode_path;
mod nozzle_temp_insert;

pub use estimates::TimeMaterialEstimates;
pub use gcode_path::{GCodePath, SpaceFillType};
pub use nozzle_temp_insert::NozzleTempInsert;
