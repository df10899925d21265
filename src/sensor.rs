//! Single numeric reading from a system-exposed file (panel brightness).

use std::path::Path;

use tracing::debug;

/// Returned instead of an error when the reading is unavailable.
pub const SENSOR_UNAVAILABLE: i64 = -1;

/// Read the first line of `path` as an integer, or [`SENSOR_UNAVAILABLE`].
pub fn read_sensor(path: &Path) -> i64 {
    match std::fs::read_to_string(path) {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(value) => value,
            Err(_) => {
                debug!(path = %path.display(), raw = %raw.trim(), "sensor value unparsable");
                SENSOR_UNAVAILABLE
            }
        },
        Err(e) => {
            debug!(path = %path.display(), error = %e, "sensor read failed");
            SENSOR_UNAVAILABLE
        }
    }
}

/// Screen state implied by a brightness reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenState {
    On,
    Off,
}

impl ScreenState {
    /// `None` for the unavailable sentinel: a failed read is not a transition.
    pub fn from_brightness(value: i64) -> Option<Self> {
        match value {
            SENSOR_UNAVAILABLE => None,
            v if v > 0 => Some(ScreenState::On),
            _ => Some(ScreenState::Off),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_numeric_value() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("brightness");
        std::fs::write(&path, "255\n").unwrap();
        assert_eq!(read_sensor(&path), 255);
    }

    #[test]
    fn missing_file_yields_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_sensor(&tmp.path().join("absent")), SENSOR_UNAVAILABLE);
    }

    #[test]
    fn garbage_yields_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("brightness");
        std::fs::write(&path, "bright").unwrap();
        assert_eq!(read_sensor(&path), SENSOR_UNAVAILABLE);
        std::fs::write(&path, "").unwrap();
        assert_eq!(read_sensor(&path), SENSOR_UNAVAILABLE);
    }

    #[test]
    fn brightness_maps_to_screen_state() {
        assert_eq!(ScreenState::from_brightness(0), Some(ScreenState::Off));
        assert_eq!(ScreenState::from_brightness(1), Some(ScreenState::On));
        assert_eq!(ScreenState::from_brightness(4095), Some(ScreenState::On));
        assert_eq!(ScreenState::from_brightness(SENSOR_UNAVAILABLE), None);
    }
}
