use thiserror::Error;

///Fatal errors raised while planning or exporting a print.
///
///Only invalid settings and I/O failures abort a slice. Degenerate geometry,
///combing failures and template problems are recovered locally and never
///surface through this type.
#[derive(Error, Debug)]
pub enum SlicerError {
    #[error("setting {setting} must be greater than zero, got {value}")]
    SettingLessThanOrEqualToZero { setting: String, value: f64 },

    #[error("setting {setting} must not be negative, got {value}")]
    SettingLessThanZero { setting: String, value: f64 },

    #[error("setting {setting} is out of range: {message}")]
    SettingOutOfRange { setting: String, message: String },

    #[error("no extruders configured")]
    NoExtruders,

    #[error("extruder {0} does not exist")]
    UnknownExtruder(usize),

    #[error("failed to parse settings: {0}")]
    SettingsParse(#[from] serde_json::Error),

    #[error("failed to write g-code: {0}")]
    GCodeWrite(#[from] std::io::Error),
}
