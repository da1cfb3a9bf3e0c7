use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::device::types::SensorEvent;

/// Last known values received from the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorReading {
    pub pressure_raw: i32,
    pub pressure_timestamp_ms: i64,
    /// `None` until the instrument reported its battery
    pub battery_volts: Option<f64>,
}

impl SensorReading {
    /// true once at least one pressure sample has been received
    pub fn has_pressure(&self) -> bool {
        self.pressure_timestamp_ms != 0
    }
}

pub trait SensorListener: Send + Sync {
    fn on_sensor_update(&self, reading: &SensorReading);
}

/// Shared sensor state. Written by the active read session, read by the broadcaster.
///
/// Listeners are notified after every pressure sample. Battery values are only stored; they
/// reach listeners with the next pressure sample.
pub struct SensorModel {
    epoch: Instant,
    reading: RwLock<SensorReading>,
    listeners: Mutex<Vec<Arc<dyn SensorListener>>>,
}

impl SensorModel {
    pub fn new() -> Self {
        SensorModel {
            epoch: Instant::now(),
            reading: RwLock::new(SensorReading::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SensorListener>) {
        self.listeners.lock().expect("Failed to lock SensorModel listeners").push(listener);
    }

    pub fn remove_listeners(&self) {
        self.listeners.lock().expect("Failed to lock SensorModel listeners").clear();
    }

    /// Monotonic milliseconds since this model was created; the starting point of a session's
    /// synthetic clock.
    pub fn monotonic_ms(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    pub fn reading(&self) -> SensorReading {
        *self.reading.read().expect("Failed to lock SensorModel reading")
    }

    pub fn apply(&self, event: &SensorEvent) {
        match *event {
            SensorEvent::Pressure { pressure, time_ms } => {
                let reading = {
                    let mut reading = self.reading.write().expect("Failed to lock SensorModel reading");
                    reading.pressure_raw = pressure;
                    reading.pressure_timestamp_ms = time_ms;
                    *reading
                };

                // copy, so that listeners may add/remove listeners while being notified
                let listeners = self.listeners.lock().expect("Failed to lock SensorModel listeners").clone();
                for listener in listeners {
                    listener.on_sensor_update(&reading);
                }
            },
            SensorEvent::Battery { volts } => {
                self.reading.write().expect("Failed to lock SensorModel reading").battery_volts = Some(volts);
            },
        }
    }
}

impl Default for SensorModel {
    fn default() -> Self {
        SensorModel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        readings: Mutex<Vec<SensorReading>>,
    }

    impl SensorListener for Recorder {
        fn on_sensor_update(&self, reading: &SensorReading) {
            self.readings.lock().unwrap().push(*reading);
        }
    }

    #[test]
    fn battery_is_stored_and_pressure_notifies() {
        let model = SensorModel::new();
        let recorder = Arc::new(Recorder::default());
        model.add_listener(recorder.clone());

        model.apply(&SensorEvent::Battery { volts: 4.1 });
        assert!(recorder.readings.lock().unwrap().is_empty());
        assert_eq!(model.reading().battery_volts, Some(4.1));

        model.apply(&SensorEvent::Pressure { pressure: 100000, time_ms: 40 });
        let readings = recorder.readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(
            readings[0],
            SensorReading { pressure_raw: 100000, pressure_timestamp_ms: 40, battery_volts: Some(4.1) }
        );
    }

    #[test]
    fn removed_listeners_are_not_notified() {
        let model = SensorModel::new();
        let recorder = Arc::new(Recorder::default());
        model.add_listener(recorder.clone());
        model.remove_listeners();

        model.apply(&SensorEvent::Pressure { pressure: 1, time_ms: 20 });
        assert!(recorder.readings.lock().unwrap().is_empty());
        assert!(model.reading().has_pressure());
    }

    #[test]
    fn battery_is_unknown_until_reported() {
        let model = SensorModel::new();
        model.apply(&SensorEvent::Pressure { pressure: 500, time_ms: 20 });
        assert_eq!(model.reading().battery_volts, None);

        model.apply(&SensorEvent::Battery { volts: 3.9 });
        assert_eq!(model.reading().battery_volts, Some(3.9));
    }
}
