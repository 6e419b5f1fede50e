use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor backend unavailable: {0}")]
    Unavailable(String),
    #[error("sensor read failed: {0}")]
    Read(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Degrees, as reported by the board's IMU fusion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

/// Raw snapshot from the add-on board. The two thermometers come off
/// different chips (pressure sensor and humidity sensor) and disagree.
#[derive(Debug, Clone)]
pub struct BoardReading {
    pub pressure: f64,
    pub temperature_from_pressure: f64,
    pub temperature_from_humidity: f64,
    pub humidity: f64,
    pub acceleration: Vector3,
    pub compass: Vector3,
    pub orientation: Option<Orientation>,
}

pub trait ReadingSource: Send {
    fn read(&mut self) -> Result<BoardReading, SensorError>;
}

/// Maps a raw reading onto the published field set. Temperature is the
/// arithmetic mean of the two thermometers.
pub fn environment_fields(reading: &BoardReading) -> BTreeMap<String, f64> {
    let mut fields = BTreeMap::new();
    fields.insert("pressure".to_string(), reading.pressure);
    fields.insert(
        "temperature".to_string(),
        (reading.temperature_from_pressure + reading.temperature_from_humidity) / 2.0,
    );
    fields.insert("humidity".to_string(), reading.humidity);
    fields.insert("acceleration_x".to_string(), reading.acceleration.x);
    fields.insert("acceleration_y".to_string(), reading.acceleration.y);
    fields.insert("acceleration_z".to_string(), reading.acceleration.z);
    fields.insert("compass_x".to_string(), reading.compass.x);
    fields.insert("compass_y".to_string(), reading.compass.y);
    fields.insert("compass_z".to_string(), reading.compass.z);
    if let Some(orientation) = reading.orientation {
        fields.insert("orientation_pitch".to_string(), orientation.pitch);
        fields.insert("orientation_roll".to_string(), orientation.roll);
        fields.insert("orientation_yaw".to_string(), orientation.yaw);
    }
    fields
}

/// Deterministic stand-in for hosts without the hardware board: slow
/// sinusoidal drift around plausible indoor values.
pub struct SimulatedBoard {
    tick: u64,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self { tick: 0 }
    }
}

impl ReadingSource for SimulatedBoard {
    fn read(&mut self) -> Result<BoardReading, SensorError> {
        self.tick += 1;
        let phase = self.tick as f64 / 60.0;
        Ok(BoardReading {
            pressure: 1013.25 + 2.0 * phase.sin(),
            temperature_from_pressure: 21.5 + 0.5 * phase.cos(),
            temperature_from_humidity: 22.5 + 0.5 * phase.sin(),
            humidity: 45.0 + 5.0 * (phase / 3.0).sin(),
            acceleration: Vector3 {
                x: 0.0,
                y: 0.0,
                z: 1.0,
            },
            compass: Vector3 {
                x: 12.0 * phase.cos(),
                y: 12.0 * phase.sin(),
                z: -4.0,
            },
            orientation: Some(Orientation {
                pitch: 0.0,
                roll: 0.0,
                yaw: phase.to_degrees() % 360.0,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_is_mean_of_both_thermometers() {
        let reading = BoardReading {
            pressure: 1013.2,
            temperature_from_pressure: 21.0,
            temperature_from_humidity: 23.0,
            humidity: 45.0,
            acceleration: Vector3 {
                x: 0.0,
                y: 0.0,
                z: 1.0,
            },
            compass: Vector3::default(),
            orientation: None,
        };
        let fields = environment_fields(&reading);
        assert_eq!(fields["temperature"], 22.0);
        assert_eq!(fields["pressure"], 1013.2);
        assert_eq!(fields["acceleration_z"], 1.0);
        assert!(!fields.contains_key("orientation_yaw"));
    }

    #[test]
    fn orientation_is_included_when_available() {
        let reading = BoardReading {
            pressure: 1000.0,
            temperature_from_pressure: 20.0,
            temperature_from_humidity: 20.0,
            humidity: 50.0,
            acceleration: Vector3::default(),
            compass: Vector3::default(),
            orientation: Some(Orientation {
                pitch: 1.0,
                roll: 2.0,
                yaw: 3.0,
            }),
        };
        let fields = environment_fields(&reading);
        assert_eq!(fields["orientation_pitch"], 1.0);
        assert_eq!(fields["orientation_roll"], 2.0);
        assert_eq!(fields["orientation_yaw"], 3.0);
    }

    #[test]
    fn simulated_board_yields_finite_readings() {
        let mut board = SimulatedBoard::new();
        for _ in 0..120 {
            let reading = board.read().unwrap();
            for value in environment_fields(&reading).values() {
                assert!(value.is_finite());
            }
        }
    }
}
