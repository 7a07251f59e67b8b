//! Automatable parameters.
//!
//! An [`AudioParam`] is an intrinsic value plus a time-ordered list of
//! automation events. The value at any transport time is derived from the
//! events alone, so the render thread can evaluate it per sample without any
//! bookkeeping of its own.

use crate::error::PatchError;

/// One entry on a parameter's automation timeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AutomationEvent {
    /// Jump to `value` at `time`
    SetValue { time: f64, value: f32 },
    /// Ramp linearly from the previous event, reaching `value` at `time`
    LinearRamp { time: f64, value: f32 },
    /// Ramp exponentially from the previous event, reaching `value` at `time`
    ExponentialRamp { time: f64, value: f32 },
    /// Approach `target` from `time` onwards with the given time constant
    SetTarget {
        time: f64,
        target: f32,
        time_constant: f64,
    },
}

impl AutomationEvent {
    /// The time the event is keyed on (end time for ramps).
    pub fn time(&self) -> f64 {
        match *self {
            AutomationEvent::SetValue { time, .. }
            | AutomationEvent::LinearRamp { time, .. }
            | AutomationEvent::ExponentialRamp { time, .. }
            | AutomationEvent::SetTarget { time, .. } => time,
        }
    }
}

/// A continuous, automatable node parameter.
#[derive(Clone, Debug)]
pub struct AudioParam {
    name: &'static str,
    value: f32,
    min: f32,
    max: f32,
    events: Vec<AutomationEvent>,
    /// Sum of parameter wires, refreshed once per quantum
    modulation: f32,
}

impl AudioParam {
    /// Create an unbounded parameter with the given intrinsic value.
    pub fn new(name: &'static str, value: f32) -> Self {
        Self {
            name,
            value,
            min: f32::MIN,
            max: f32::MAX,
            events: Vec::new(),
            modulation: 0.0,
        }
    }

    /// Clamp the computed value to `[min, max]`.
    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The scheduled events, in time order.
    pub fn events(&self) -> &[AutomationEvent] {
        &self.events
    }

    /// Replace the intrinsic value and drop all automation.
    pub fn set_value(&mut self, value: f32) {
        self.value = value;
        self.events.clear();
    }

    pub fn set_value_at_time(&mut self, value: f32, time: f64) -> Result<(), PatchError> {
        self.check_finite(value)?;
        self.insert(AutomationEvent::SetValue { time, value });
        Ok(())
    }

    pub fn linear_ramp_to_value_at_time(&mut self, value: f32, time: f64) -> Result<(), PatchError> {
        self.check_finite(value)?;
        self.insert(AutomationEvent::LinearRamp { time, value });
        Ok(())
    }

    /// Exponential curves cannot pass through zero, so a zero target is an error.
    pub fn exponential_ramp_to_value_at_time(
        &mut self,
        value: f32,
        time: f64,
    ) -> Result<(), PatchError> {
        self.check_finite(value)?;
        if value == 0.0 {
            return Err(PatchError::InvalidParamValue {
                param: self.name,
                value,
                reason: "exponential ramps cannot reach zero",
            });
        }
        self.insert(AutomationEvent::ExponentialRamp { time, value });
        Ok(())
    }

    pub fn set_target_at_time(
        &mut self,
        target: f32,
        time: f64,
        time_constant: f64,
    ) -> Result<(), PatchError> {
        self.check_finite(target)?;
        if !(time_constant >= 0.0) {
            return Err(PatchError::InvalidParamValue {
                param: self.name,
                value: time_constant as f32,
                reason: "time constant must be non-negative",
            });
        }
        self.insert(AutomationEvent::SetTarget {
            time,
            target,
            time_constant,
        });
        Ok(())
    }

    /// Drop every event keyed at or after `time`.
    ///
    /// Whatever the remaining history evaluates to at `time` becomes the new
    /// intrinsic value, so afterwards the timeline only holds events
    /// scheduled from here on.
    pub fn cancel_scheduled_values(&mut self, time: f64) {
        self.events.retain(|event| event.time() < time);
        self.value = self.intrinsic_at(time);
        self.events.clear();
    }

    /// Drop every event and hold whatever value the timeline reaches at
    /// `time`, including the point an in-flight ramp has got to.
    pub fn cancel_and_hold_at_time(&mut self, time: f64) {
        let held = self.intrinsic_at(time);
        self.value = held;
        self.events.clear();
        self.events.push(AutomationEvent::SetValue { time, value: held });
    }

    pub(crate) fn set_modulation(&mut self, modulation: f32) {
        self.modulation = modulation;
    }

    /// Computed value at transport time `t`, including modulation.
    pub fn value_at(&self, t: f64) -> f32 {
        (self.intrinsic_at(t) + self.modulation).clamp(self.min, self.max)
    }

    /// Fill `out` with per-sample values starting at `start`.
    pub fn fill_block(&self, start: f64, sample_rate: u32, out: &mut [f32]) {
        if self.events.is_empty() {
            let v = self.value_at(start);
            out.iter_mut().for_each(|s| *s = v);
            return;
        }
        let dt = 1.0 / sample_rate as f64;
        for (i, s) in out.iter_mut().enumerate() {
            *s = self.value_at(start + i as f64 * dt);
        }
    }

    fn intrinsic_at(&self, t: f64) -> f32 {
        let mut anchor_time = 0.0;
        let mut anchor_value = self.value;
        let mut approach: Option<(f32, f64)> = None;

        for event in &self.events {
            match *event {
                AutomationEvent::SetValue { time, value } => {
                    if time > t {
                        break;
                    }
                    anchor_time = time;
                    anchor_value = value;
                    approach = None;
                }
                AutomationEvent::SetTarget {
                    time,
                    target,
                    time_constant,
                } => {
                    if time > t {
                        break;
                    }
                    anchor_value = follow(anchor_time, anchor_value, approach, time);
                    anchor_time = time;
                    if time_constant > 0.0 {
                        approach = Some((target, time_constant));
                    } else {
                        anchor_value = target;
                        approach = None;
                    }
                }
                AutomationEvent::LinearRamp { time, value } => {
                    if time > t {
                        return lerp(anchor_time, anchor_value, time, value, t);
                    }
                    anchor_time = time;
                    anchor_value = value;
                    approach = None;
                }
                AutomationEvent::ExponentialRamp { time, value } => {
                    if time > t {
                        return exp_interp(anchor_time, anchor_value, time, value, t);
                    }
                    anchor_time = time;
                    anchor_value = value;
                    approach = None;
                }
            }
        }

        follow(anchor_time, anchor_value, approach, t)
    }

    fn insert(&mut self, event: AutomationEvent) {
        let at = self.events.partition_point(|e| e.time() <= event.time());
        self.events.insert(at, event);
    }

    fn check_finite(&self, value: f32) -> Result<(), PatchError> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(PatchError::InvalidParamValue {
                param: self.name,
                value,
                reason: "value must be finite",
            })
        }
    }
}

fn follow(anchor_time: f64, anchor_value: f32, approach: Option<(f32, f64)>, t: f64) -> f32 {
    match approach {
        Some((target, tc)) => {
            let k = (-(t - anchor_time) / tc).exp() as f32;
            target + (anchor_value - target) * k
        }
        None => anchor_value,
    }
}

fn lerp(t0: f64, v0: f32, t1: f64, v1: f32, t: f64) -> f32 {
    if t1 <= t0 {
        return v1;
    }
    let frac = ((t - t0) / (t1 - t0)) as f32;
    v0 + (v1 - v0) * frac
}

fn exp_interp(t0: f64, v0: f32, t1: f64, v1: f32, t: f64) -> f32 {
    if t1 <= t0 {
        return v1;
    }
    // No exponential path between values of opposite sign or from zero
    if v0 * v1 <= 0.0 {
        return v0;
    }
    let frac = (t - t0) / (t1 - t0);
    v0 * (v1 / v0).powf(frac as f32)
}
