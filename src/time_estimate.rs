//!Acceleration-aware print time estimation.
//!
//!Moves are collected as blocks with trapezoid speed profiles under firmware
//!constraints: per-axis feedrate limits, per-axis acceleration limits and
//!per-axis jerk (instantaneous speed change at a junction). A forward pass
//!propagates reachable entry speeds, a reverse pass clamps them so every
//!block can still decelerate into its successor, and a final pass converts
//!the profiles into per-feature durations.

use crate::path_config::PrintFeatureType;
use crate::settings::Settings;

pub const NUM_AXIS: usize = 4;
pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;
pub const E_AXIS: usize = 3;

const MINIMUM_PLANNER_SPEED: f64 = 0.05; // mm/s

///A position of the head in (X, Y, Z, E) space, millimeters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position(pub [f64; NUM_AXIS]);

impl Position {
    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Position([x, y, z, e])
    }
}

#[derive(Clone, Debug)]
struct Block {
    recalculate_flag: bool,
    accelerate_until: f64,
    decelerate_after: f64,
    initial_feedrate: f64,
    final_feedrate: f64,
    entry_speed: f64,
    max_entry_speed: f64,
    nominal_length_flag: bool,
    nominal_feedrate: f64,
    distance: f64,
    acceleration: f64,
    delta: [f64; NUM_AXIS],
    abs_delta: [f64; NUM_AXIS],
    feature: PrintFeatureType,
}

///Collects moves and turns them into per-feature durations.
#[derive(Clone, Debug)]
pub struct TimeEstimateCalculator {
    max_feedrate: [f64; NUM_AXIS],
    minimum_feedrate: f64,
    acceleration: f64,
    max_acceleration: [f64; NUM_AXIS],
    max_xy_jerk: f64,
    max_z_jerk: f64,
    max_e_jerk: f64,
    extra_time: f64,
    previous_feedrate: [f64; NUM_AXIS],
    previous_nominal_feedrate: f64,
    current_position: Position,
    blocks: Vec<Block>,
}

impl Default for TimeEstimateCalculator {
    fn default() -> Self {
        TimeEstimateCalculator {
            max_feedrate: [600.0, 600.0, 40.0, 25.0],
            minimum_feedrate: 0.01,
            acceleration: 3_000.0,
            max_acceleration: [9_000.0, 9_000.0, 100.0, 10_000.0],
            max_xy_jerk: 20.0,
            max_z_jerk: 0.4,
            max_e_jerk: 5.0,
            extra_time: 0.0,
            previous_feedrate: [0.0; NUM_AXIS],
            previous_nominal_feedrate: 0.0,
            current_position: Position::default(),
            blocks: vec![],
        }
    }
}

///Speed that can still be reached over `distance` when changing speed with
///`acceleration` towards `target_velocity`.
fn max_allowable_speed(acceleration: f64, target_velocity: f64, distance: f64) -> f64 {
    (target_velocity * target_velocity - 2.0 * acceleration * distance).max(0.0).sqrt()
}

///Distance needed to go from `initial_rate` to `target_rate`.
fn estimate_acceleration_distance(initial_rate: f64, target_rate: f64, acceleration: f64) -> f64 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (target_rate * target_rate - initial_rate * initial_rate) / (2.0 * acceleration)
}

///Point on the move where acceleration must flip to deceleration when there
///is no room for a cruise phase.
fn intersection_distance(initial_rate: f64, final_rate: f64, acceleration: f64, distance: f64) -> f64 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (2.0 * acceleration * distance - initial_rate * initial_rate + final_rate * final_rate)
        / (4.0 * acceleration)
}

///Time to change from `start_rate` to `end_rate` over `distance`.
fn acceleration_time_from_distance(start_rate: f64, distance: f64, acceleration: f64) -> f64 {
    let discriminant = (start_rate * start_rate + 2.0 * acceleration * distance).max(0.0);
    let end_rate = discriminant.sqrt();
    if acceleration == 0.0 {
        if start_rate > 0.0 {
            return distance / start_rate;
        }
        return 0.0;
    }
    (end_rate - start_rate) / acceleration
}

impl TimeEstimateCalculator {
    ///Take the firmware kinematics from the settings bundle.
    pub fn set_firmware_defaults(&mut self, settings: &Settings) {
        self.max_feedrate = settings.max_feedrate;
        self.max_acceleration = settings.max_acceleration;
        self.acceleration = settings.default_acceleration;
        self.max_xy_jerk = settings.max_xy_jerk;
        self.max_z_jerk = settings.max_z_jerk;
        self.max_e_jerk = settings.max_e_jerk;
        self.minimum_feedrate = settings.minimum_feedrate;
    }

    pub fn set_position(&mut self, position: Position) {
        self.current_position = position;
    }

    ///Plan a stationary E-only move (retract or prime) of `e_delta` mm.
    pub fn plan_e_only(&mut self, e_delta: f64, feedrate: f64) {
        let mut target = self.current_position;
        target.0[E_AXIS] += e_delta;
        self.plan(target, feedrate, PrintFeatureType::StationaryRetractUnretract);
    }

    ///Mirror a G92 E0: the E axis position restarts at zero.
    pub fn reset_e(&mut self) {
        self.current_position.0[E_AXIS] = 0.0;
    }

    pub fn set_acceleration(&mut self, acceleration: f64) {
        self.acceleration = acceleration;
    }

    pub fn set_max_xy_jerk(&mut self, jerk: f64) {
        self.max_xy_jerk = jerk;
    }

    pub fn add_time(&mut self, time: f64) {
        self.extra_time += time.max(0.0);
    }

    pub fn reset(&mut self) {
        self.extra_time = 0.0;
        self.blocks.clear();
        self.previous_feedrate = [0.0; NUM_AXIS];
        self.previous_nominal_feedrate = 0.0;
    }

    ///Append a block for the move from the current position to `new_position`
    ///at the given nominal feedrate.
    pub fn plan(&mut self, new_position: Position, feedrate: f64, feature: PrintFeatureType) {
        let mut delta = [0.0; NUM_AXIS];
        let mut abs_delta = [0.0; NUM_AXIS];
        let mut max_travel: f64 = 0.0;
        for axis in 0..NUM_AXIS {
            delta[axis] = new_position.0[axis] - self.current_position.0[axis];
            abs_delta[axis] = delta[axis].abs();
            max_travel = max_travel.max(abs_delta[axis]);
        }
        self.current_position = new_position;
        if max_travel <= 0.0 {
            return;
        }

        let feedrate = feedrate.max(self.minimum_feedrate);
        let xyz_distance = (delta[X_AXIS] * delta[X_AXIS]
            + delta[Y_AXIS] * delta[Y_AXIS]
            + delta[Z_AXIS] * delta[Z_AXIS])
            .sqrt();
        let distance = if xyz_distance > 0.0 {
            xyz_distance
        } else {
            abs_delta[E_AXIS]
        };

        let mut current_feedrate = [0.0; NUM_AXIS];
        let mut speed_factor: f64 = 1.0;
        for axis in 0..NUM_AXIS {
            current_feedrate[axis] = delta[axis] * (feedrate / distance);
            if current_feedrate[axis].abs() > self.max_feedrate[axis] {
                speed_factor = speed_factor.min(self.max_feedrate[axis] / current_feedrate[axis].abs());
            }
        }
        if speed_factor < 1.0 {
            for axis_feedrate in &mut current_feedrate {
                *axis_feedrate *= speed_factor;
            }
        }
        let nominal_feedrate = feedrate * speed_factor;

        let mut acceleration = self.acceleration;
        for axis in 0..NUM_AXIS {
            let axis_share = abs_delta[axis] / distance;
            if axis_share > 0.0 && acceleration * axis_share > self.max_acceleration[axis] {
                acceleration = self.max_acceleration[axis] / axis_share;
            }
        }

        // Junction speed limited by the jerk against the previous block.
        let mut vmax_junction = self.max_xy_jerk / 2.0;
        if current_feedrate[Z_AXIS].abs() > self.max_z_jerk / 2.0 {
            vmax_junction = vmax_junction.min(self.max_z_jerk / 2.0);
        }
        if current_feedrate[E_AXIS].abs() > self.max_e_jerk / 2.0 {
            vmax_junction = vmax_junction.min(self.max_e_jerk / 2.0);
        }
        vmax_junction = vmax_junction.min(nominal_feedrate);

        if !self.blocks.is_empty() && self.previous_nominal_feedrate > 0.0001 {
            let xy_jerk = ((current_feedrate[X_AXIS] - self.previous_feedrate[X_AXIS]).powi(2)
                + (current_feedrate[Y_AXIS] - self.previous_feedrate[Y_AXIS]).powi(2))
            .sqrt();
            vmax_junction = nominal_feedrate;
            let mut vmax_junction_factor: f64 = 1.0;
            if xy_jerk > self.max_xy_jerk {
                vmax_junction_factor = self.max_xy_jerk / xy_jerk;
            }
            let z_jerk = (current_feedrate[Z_AXIS] - self.previous_feedrate[Z_AXIS]).abs();
            if z_jerk > self.max_z_jerk {
                vmax_junction_factor = vmax_junction_factor.min(self.max_z_jerk / z_jerk);
            }
            let e_jerk = (current_feedrate[E_AXIS] - self.previous_feedrate[E_AXIS]).abs();
            if e_jerk > self.max_e_jerk {
                vmax_junction_factor = vmax_junction_factor.min(self.max_e_jerk / e_jerk);
            }
            vmax_junction = (vmax_junction * vmax_junction_factor).min(self.previous_nominal_feedrate);
        }

        let v_allowable = max_allowable_speed(-acceleration, MINIMUM_PLANNER_SPEED, distance);
        let entry_speed = vmax_junction.min(v_allowable);

        self.blocks.push(Block {
            recalculate_flag: true,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
            initial_feedrate: 0.0,
            final_feedrate: 0.0,
            entry_speed,
            max_entry_speed: vmax_junction,
            nominal_length_flag: nominal_feedrate <= v_allowable,
            nominal_feedrate,
            distance,
            acceleration,
            delta,
            abs_delta,
            feature,
        });

        self.previous_feedrate = current_feedrate;
        self.previous_nominal_feedrate = nominal_feedrate;
    }

    ///Run the planner passes and return the total duration per feature.
    ///The static extra time is reported under `PrintFeatureType::None`.
    pub fn calculate(&mut self) -> Vec<f64> {
        self.reverse_pass();
        self.forward_pass();
        self.recalculate_trapezoids();

        let mut totals = vec![0.0; PrintFeatureType::COUNT];
        totals[PrintFeatureType::None.index()] = self.extra_time;
        for block in &self.blocks {
            let plateau_distance = block.decelerate_after - block.accelerate_until;
            totals[block.feature.index()] += acceleration_time_from_distance(
                block.initial_feedrate,
                block.accelerate_until,
                block.acceleration,
            );
            if block.nominal_feedrate > 0.0 {
                totals[block.feature.index()] += plateau_distance / block.nominal_feedrate;
            }
            totals[block.feature.index()] += acceleration_time_from_distance(
                block.final_feedrate,
                block.distance - block.decelerate_after,
                block.acceleration,
            );
        }
        totals
    }

    fn reverse_pass(&mut self) {
        let len = self.blocks.len();
        for i in (0..len).rev() {
            let next_entry_speed = if i + 1 < len {
                self.blocks[i + 1].entry_speed
            } else {
                MINIMUM_PLANNER_SPEED
            };
            let block = &mut self.blocks[i];
            if block.entry_speed != block.max_entry_speed {
                // Entry speed is only raised up to what deceleration into the
                // next block still permits.
                if !block.nominal_length_flag && block.max_entry_speed > next_entry_speed {
                    block.entry_speed = block.max_entry_speed.min(max_allowable_speed(
                        -block.acceleration,
                        next_entry_speed,
                        block.distance,
                    ));
                } else {
                    block.entry_speed = block.max_entry_speed;
                }
                block.recalculate_flag = true;
            }
        }
    }

    fn forward_pass(&mut self) {
        for i in 1..self.blocks.len() {
            let (previous, current) = {
                let (head, tail) = self.blocks.split_at_mut(i);
                (&head[i - 1], &mut tail[0])
            };
            // A short previous block may not reach the planned entry speed.
            if !previous.nominal_length_flag && previous.entry_speed < current.entry_speed {
                let achievable = max_allowable_speed(
                    -previous.acceleration,
                    previous.entry_speed,
                    previous.distance,
                );
                let entry_speed = current.entry_speed.min(achievable);
                if entry_speed != current.entry_speed {
                    current.entry_speed = entry_speed;
                    current.recalculate_flag = true;
                }
            }
        }
    }

    fn recalculate_trapezoids(&mut self) {
        let len = self.blocks.len();
        for i in 0..len {
            let exit_speed = if i + 1 < len {
                self.blocks[i + 1].entry_speed
            } else {
                MINIMUM_PLANNER_SPEED
            };
            if self.blocks[i].recalculate_flag {
                let nominal = self.blocks[i].nominal_feedrate;
                let entry_factor = if nominal > 0.0 {
                    self.blocks[i].entry_speed / nominal
                } else {
                    1.0
                };
                let exit_factor = if nominal > 0.0 { exit_speed / nominal } else { 1.0 };
                calculate_trapezoid_for_block(&mut self.blocks[i], entry_factor, exit_factor);
                self.blocks[i].recalculate_flag = false;
            }
        }
    }
}

fn calculate_trapezoid_for_block(block: &mut Block, entry_factor: f64, exit_factor: f64) {
    let initial_feedrate = (block.nominal_feedrate * entry_factor).max(MINIMUM_PLANNER_SPEED);
    let final_feedrate = (block.nominal_feedrate * exit_factor).max(MINIMUM_PLANNER_SPEED);

    let acceleration = block.acceleration;
    let mut accelerate_distance =
        estimate_acceleration_distance(initial_feedrate, block.nominal_feedrate, acceleration).max(0.0);
    let decelerate_distance =
        estimate_acceleration_distance(block.nominal_feedrate, final_feedrate, -acceleration).max(0.0);
    let mut plateau_distance = block.distance - accelerate_distance - decelerate_distance;

    // No room to cruise: accelerate to a peak, then immediately decelerate.
    if plateau_distance < 0.0 {
        accelerate_distance =
            intersection_distance(initial_feedrate, final_feedrate, acceleration, block.distance)
                .clamp(0.0, block.distance);
        plateau_distance = 0.0;
    }

    block.accelerate_until = accelerate_distance;
    block.decelerate_after = accelerate_distance + plateau_distance;
    block.initial_feedrate = initial_feedrate;
    block.final_feedrate = final_feedrate;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(times: &[f64]) -> f64 {
        times.iter().sum()
    }

    #[test]
    fn single_long_move_is_close_to_distance_over_speed() {
        let mut calculator = TimeEstimateCalculator::default();
        calculator.set_position(Position::default());
        calculator.plan(
            Position::new(600.0, 0.0, 0.0, 0.0),
            60.0,
            PrintFeatureType::Infill,
        );
        let times = calculator.calculate();
        let time = total(&times);
        // 10 s cruise plus a little acceleration overhead.
        assert!(time > 10.0 && time < 10.5, "time was {time}");
    }

    #[test]
    fn short_moves_are_acceleration_limited() {
        let mut calculator = TimeEstimateCalculator::default();
        calculator.set_position(Position::default());
        let mut pos = 0.0;
        for _ in 0..10 {
            pos += 0.5;
            calculator.plan(
                Position::new(pos, 0.0, 0.0, 0.0),
                300.0,
                PrintFeatureType::Infill,
            );
        }
        let times = calculator.calculate();
        let time = total(&times);
        // 5 mm at a nominal 300 mm/s would be 17 ms; acceleration dominates.
        assert!(time > 5.0 / 300.0, "time was {time}");
    }

    #[test]
    fn time_is_accounted_to_the_feature() {
        let mut calculator = TimeEstimateCalculator::default();
        calculator.set_position(Position::default());
        calculator.plan(
            Position::new(100.0, 0.0, 0.0, 0.0),
            50.0,
            PrintFeatureType::OuterWall,
        );
        calculator.plan(
            Position::new(100.0, 100.0, 0.0, 0.0),
            50.0,
            PrintFeatureType::MoveRetracted,
        );
        let times = calculator.calculate();
        assert!(times[PrintFeatureType::OuterWall.index()] > 0.0);
        assert!(times[PrintFeatureType::MoveRetracted.index()] > 0.0);
        assert_eq!(times[PrintFeatureType::Skin.index()], 0.0);
    }

    #[test]
    fn added_time_shows_up_in_none_bucket() {
        let mut calculator = TimeEstimateCalculator::default();
        calculator.add_time(11.5);
        let times = calculator.calculate();
        assert_eq!(times[PrintFeatureType::None.index()], 11.5);
    }

    #[test]
    fn z_moves_respect_the_z_feedrate_limit() {
        let mut calculator = TimeEstimateCalculator::default();
        calculator.set_position(Position::default());
        calculator.plan(
            Position::new(0.0, 0.0, 40.0, 0.0),
            300.0,
            PrintFeatureType::MoveRetracted,
        );
        let times = calculator.calculate();
        // The Z axis is limited to 40 mm/s, so 40 mm takes at least a second.
        assert!(total(&times) >= 1.0);
    }
}
