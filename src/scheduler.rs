//! Time scheduler
//!
//! Turns [`ScheduledMessage`]s into automation on an [`AudioParam`]. The
//! scheduler holds nothing but the transport clock, so any number of
//! parameters can be driven at once without coordination.

use crate::error::PatchError;
use crate::host::param::AudioParam;
use crate::host::TransportClock;
use crate::value::{Curve, Phase, ScheduledMessage, TimeMode, Value};

/// Stand-in for zero on exponential curves.
pub const EXPONENTIAL_FLOOR: f32 = 1e-4;

/// Share of the phase length used as the `targetAtTime` time constant when
/// the message does not give one.
pub const DEFAULT_TIME_CONSTANT_RATIO: f64 = 0.3;

#[derive(Clone, Debug, Default)]
pub struct TimeScheduler {
    clock: TransportClock,
}

impl TimeScheduler {
    pub fn new(clock: TransportClock) -> Self {
        Self { clock }
    }

    #[inline]
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Apply one scheduled message to `param`.
    ///
    /// `trigger` and `release` replace whatever was scheduled before them.
    pub fn apply(&self, param: &mut AudioParam, message: &ScheduledMessage) -> Result<(), PatchError> {
        let now = self.now();
        match *message {
            ScheduledMessage::Set {
                value,
                time,
                time_mode,
            } => {
                let at = match time_mode {
                    TimeMode::Absolute => time.unwrap_or(now),
                    TimeMode::Relative => now + time.unwrap_or(0.0),
                };
                param.set_value_at_time(value, at)
            }
            ScheduledMessage::Trigger {
                values,
                attack,
                decay,
            } => {
                param.cancel_scheduled_values(now);
                param.set_value_at_time(values.start, now)?;
                apply_phase(param, now, values.peak, &attack)?;
                apply_phase(param, now + duration(&attack), values.sustain, &decay)
            }
            ScheduledMessage::Release { end_value, release } => {
                param.cancel_and_hold_at_time(now);
                apply_phase(param, now, end_value, &release)
            }
        }
    }

    /// Write a message into `param`: scheduled messages are applied, numbers
    /// become an immediate value.
    pub fn apply_value(&self, param: &mut AudioParam, value: &Value) -> Result<(), PatchError> {
        if let Value::Scheduled(message) = value {
            return self.apply(param, message);
        }
        let Some(number) = value.as_f64() else {
            return Err(PatchError::InvalidParamValue {
                param: param.name(),
                value: f32::NAN,
                reason: "not a number or scheduled message",
            });
        };
        let now = self.now();
        if param.events().iter().any(|event| event.time() >= now) {
            param.set_value_at_time(number as f32, now)
        } else {
            // Only history left on the timeline
            param.set_value(number as f32);
            Ok(())
        }
    }
}

/// Phase length in seconds; negative and NaN times count as zero.
fn duration(phase: &Phase) -> f64 {
    if phase.time > 0.0 {
        phase.time
    } else {
        0.0
    }
}

/// Ramp from whatever the timeline holds at `start` to `target` over `phase`.
fn apply_phase(param: &mut AudioParam, start: f64, target: f32, phase: &Phase) -> Result<(), PatchError> {
    let time = duration(phase);
    if time == 0.0 {
        return param.set_value_at_time(target, start);
    }
    let end = start + time;
    match phase.curve {
        Curve::Linear => param.linear_ramp_to_value_at_time(target, end),
        Curve::Exponential => {
            let target = if target == 0.0 { EXPONENTIAL_FLOOR } else { target };
            param.exponential_ramp_to_value_at_time(target, end)
        }
        Curve::TargetAtTime => {
            let time_constant = phase
                .time_constant
                .unwrap_or(time * DEFAULT_TIME_CONSTANT_RATIO);
            param.set_target_at_time(target, start, time_constant)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::param::AutomationEvent;
    use crate::value::EnvelopeValues;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn at(seconds: f64) -> TimeScheduler {
        let clock = TransportClock::new();
        clock.set(seconds);
        TimeScheduler::new(clock)
    }

    #[test]
    fn relative_set_offsets_from_now() {
        let scheduler = at(2.0);
        let mut param = AudioParam::new("gain", 0.0);
        let msg = ScheduledMessage::Set {
            value: 1.0,
            time: Some(0.5),
            time_mode: TimeMode::Relative,
        };
        scheduler.apply(&mut param, &msg).unwrap();
        assert_eq!(param.events(), &[AutomationEvent::SetValue { time: 2.5, value: 1.0 }]);
    }

    #[test]
    fn absolute_set_without_time_means_now() {
        let scheduler = at(3.0);
        let mut param = AudioParam::new("gain", 0.0);
        let msg = ScheduledMessage::Set {
            value: 1.0,
            time: None,
            time_mode: TimeMode::Absolute,
        };
        scheduler.apply(&mut param, &msg).unwrap();
        assert_eq!(param.events()[0].time(), 3.0);
    }

    #[test]
    fn trigger_runs_attack_then_decay() {
        let scheduler = at(5.0);
        let mut param = AudioParam::new("offset", 0.0);
        let msg = ScheduledMessage::Trigger {
            values: EnvelopeValues {
                start: 0.0,
                peak: 1.0,
                sustain: 0.5,
            },
            attack: Phase::linear(0.1),
            decay: Phase::linear(0.2),
        };
        scheduler.apply(&mut param, &msg).unwrap();
        assert_eq!(param.value_at(5.0), 0.0);
        assert!(close(param.value_at(5.05), 0.5));
        assert!(close(param.value_at(5.1), 1.0));
        assert!(close(param.value_at(5.2), 0.75));
        assert!(close(param.value_at(5.3), 0.5));
        assert!(close(param.value_at(9.0), 0.5));
    }

    #[test]
    fn release_holds_in_flight_value_then_ramps() {
        let scheduler = at(1.0);
        let mut param = AudioParam::new("offset", 0.0);
        param.set_value_at_time(0.0, 0.0).unwrap();
        param.linear_ramp_to_value_at_time(1.0, 2.0).unwrap();
        let msg = ScheduledMessage::Release {
            end_value: 0.0,
            release: Phase::linear(1.0),
        };
        scheduler.apply(&mut param, &msg).unwrap();
        assert!(param.events().iter().all(|e| e.time() >= 1.0));
        assert!(close(param.value_at(1.0), 0.5));
        assert!(close(param.value_at(1.5), 0.25));
        assert!(close(param.value_at(2.0), 0.0));
    }

    #[test]
    fn exponential_zero_target_is_floored() {
        let scheduler = at(0.0);
        let mut param = AudioParam::new("offset", 1.0);
        let msg = ScheduledMessage::Release {
            end_value: 0.0,
            release: Phase::linear(1.0).with_curve(Curve::Exponential),
        };
        scheduler.apply(&mut param, &msg).unwrap();
        let last = param.events().last().copied();
        assert_eq!(
            last,
            Some(AutomationEvent::ExponentialRamp {
                time: 1.0,
                value: EXPONENTIAL_FLOOR
            })
        );
    }

    #[test]
    fn target_at_time_defaults_time_constant() {
        let scheduler = at(0.0);
        let mut param = AudioParam::new("offset", 1.0);
        let msg = ScheduledMessage::Release {
            end_value: 0.0,
            release: Phase::linear(2.0).with_curve(Curve::TargetAtTime),
        };
        scheduler.apply(&mut param, &msg).unwrap();
        assert!(param.events().contains(&AutomationEvent::SetTarget {
            time: 0.0,
            target: 0.0,
            time_constant: 0.6,
        }));
    }

    #[test]
    fn zero_length_phase_jumps() {
        let scheduler = at(0.0);
        let mut param = AudioParam::new("offset", 0.0);
        let msg = ScheduledMessage::Trigger {
            values: EnvelopeValues::default(),
            attack: Phase::linear(0.0),
            decay: Phase::linear(0.0),
        };
        scheduler.apply(&mut param, &msg).unwrap();
        assert_eq!(param.value_at(0.0), 1.0);
    }

    #[test]
    fn negative_phase_times_never_reach_into_the_past() {
        let scheduler = at(3.0);
        let mut param = AudioParam::new("gain", 0.0);
        let msg = ScheduledMessage::Trigger {
            values: EnvelopeValues {
                start: 0.0,
                peak: 1.0,
                sustain: 0.5,
            },
            attack: Phase::linear(-2.0),
            decay: Phase::linear(0.5),
        };
        scheduler.apply(&mut param, &msg).unwrap();
        assert!(param.events().iter().all(|event| event.time() >= 3.0));
        assert_eq!(param.value_at(3.0), 1.0);
        assert!(close(param.value_at(3.25), 0.75));
        assert!(close(param.value_at(3.5), 0.5));

        let release = ScheduledMessage::Release {
            end_value: 0.0,
            release: Phase::linear(f64::NAN),
        };
        scheduler.apply(&mut param, &release).unwrap();
        assert_eq!(param.value_at(3.0), 0.0);
    }

    #[test]
    fn plain_numbers_write_immediately() {
        let scheduler = at(4.0);
        let mut param = AudioParam::new("gain", 0.0);
        scheduler.apply_value(&mut param, &Value::Float(0.3)).unwrap();
        assert!(close(param.value_at(4.0), 0.3));
        assert!(param.events().is_empty());
        assert!(scheduler.apply_value(&mut param, &Value::Bang).is_err());
    }
}
