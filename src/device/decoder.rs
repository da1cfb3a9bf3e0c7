use log::{debug, info};

use crate::device::constants::{PREFIX_BATTERY, PREFIX_PRESSURE, PROTOCOL_TICK};
use crate::device::types::SensorEvent;

/// Turns lines received from the instrument into sensor events.
///
/// The transport buffers lines, so the time a line arrives says nothing about when it was
/// measured. Instead a synthetic clock advances by one protocol tick per pressure sample, plus one
/// extra tick if a battery line was sent in between (the instrument skips a pressure sample to
/// send it).
#[derive(Debug)]
pub struct LineDecoder {
    current_time: i64,
    battery_seen: bool,
}

impl LineDecoder {
    pub fn new(start_time_ms: i64) -> Self {
        LineDecoder {
            current_time: start_time_ms,
            battery_seen: false,
        }
    }

    /// Start over with a fresh clock, used when a new session begins.
    pub fn reset(&mut self, start_time_ms: i64) {
        self.current_time = start_time_ms;
        self.battery_seen = false;
    }

    pub fn decode(&mut self, line: &str) -> Option<SensorEvent> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        let mut tokens = line.split(' ');
        let prefix = tokens.next()?;

        match prefix {
            PREFIX_PRESSURE => {
                // the clock advances even for garbled samples, the instrument did send one
                self.current_time += PROTOCOL_TICK;
                if self.battery_seen {
                    self.battery_seen = false;
                    self.current_time += PROTOCOL_TICK;
                }

                let pressure = parse_hex(tokens.next(), line)?;
                Some(SensorEvent::Pressure { pressure, time_ms: self.current_time })
            },
            PREFIX_BATTERY => {
                let millivolts = parse_hex(tokens.next(), line)?;
                self.battery_seen = true;
                Some(SensorEvent::Battery { volts: f64::from(millivolts) / 1000.0 })
            },
            _ => {
                info!("Ignored: {}", line);
                None
            },
        }
    }
}

fn parse_hex(token: Option<&str>, line: &str) -> Option<i32> {
    match i32::from_str_radix(token?, 16) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("Dropping malformed line {:?}: {}", line, err);
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressure_time(event: Option<SensorEvent>) -> i64 {
        match event {
            Some(SensorEvent::Pressure { time_ms, .. }) => time_ms,
            other => panic!("expected a pressure event, got {:?}", other),
        }
    }

    #[test]
    fn decodes_pressure() {
        let mut decoder = LineDecoder::new(0);
        assert_eq!(
            decoder.decode("PRS 1F4"),
            Some(SensorEvent::Pressure { pressure: 500, time_ms: 20 })
        );
    }

    #[test]
    fn decodes_battery_in_volts() {
        let mut decoder = LineDecoder::new(0);
        assert_eq!(decoder.decode("BAT 03E8"), Some(SensorEvent::Battery { volts: 1.0 }));
        assert_eq!(decoder.decode("BAT 1004"), Some(SensorEvent::Battery { volts: 4.1 }));
    }

    #[test]
    fn pressure_clock_advances_one_tick_per_sample() {
        let mut decoder = LineDecoder::new(1000);
        let times: Vec<i64> = (0..5).map(|_| pressure_time(decoder.decode("PRS 186A0"))).collect();
        assert_eq!(times, vec![1020, 1040, 1060, 1080, 1100]);
    }

    #[test]
    fn battery_line_adds_one_extra_tick() {
        let mut decoder = LineDecoder::new(0);
        assert_eq!(pressure_time(decoder.decode("PRS 186A0")), 20);
        decoder.decode("BAT 1004");
        assert_eq!(pressure_time(decoder.decode("PRS 186A0")), 60);
        assert_eq!(pressure_time(decoder.decode("PRS 186A0")), 80);
    }

    #[test]
    fn malformed_lines_produce_nothing() {
        let mut decoder = LineDecoder::new(0);
        for line in ["", "PRS", "PRS xyz", "BAT", "BAT 0x10", "PRS  1F4", " ", "PRS 1FFFFFFFF"] {
            assert_eq!(decoder.decode(line), None, "line {:?}", line);
        }
    }

    #[test]
    fn malformed_battery_does_not_add_a_tick() {
        let mut decoder = LineDecoder::new(0);
        decoder.decode("BAT zz");
        assert_eq!(pressure_time(decoder.decode("PRS 1")), 20);
    }

    #[test]
    fn unknown_prefixes_are_ignored() {
        let mut decoder = LineDecoder::new(0);
        assert_eq!(decoder.decode("TMP 12"), None);
        assert_eq!(decoder.decode("BFV 9"), None);
        assert_eq!(pressure_time(decoder.decode("PRS 1")), 20);
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let mut decoder = LineDecoder::new(0);
        assert_eq!(
            decoder.decode("PRS 1F4\r"),
            Some(SensorEvent::Pressure { pressure: 500, time_ms: 20 })
        );
    }

    #[test]
    fn reset_restarts_the_clock() {
        let mut decoder = LineDecoder::new(0);
        decoder.decode("PRS 1");
        decoder.decode("BAT 1");
        decoder.reset(500);
        assert_eq!(pressure_time(decoder.decode("PRS 1")), 520);
    }
}
