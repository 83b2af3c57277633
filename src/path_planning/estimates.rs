use std::ops::{Add, AddAssign, Sub, SubAssign};

///Naive time and material totals of a path or plan, before the
///acceleration-aware estimator refines them at export time.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeMaterialEstimates {
    ///Seconds spent extruding.
    pub extrude_time: f64,
    ///Seconds of travel while the filament is not retracted.
    pub unretracted_travel_time: f64,
    ///Seconds of travel while retracted.
    pub retracted_travel_time: f64,
    ///Material used, mm³.
    pub material: f64,
    ///Extrusion time if every path ran at the slowest path speed of its plan.
    pub extrude_time_at_slowest_path_speed: f64,
    ///Extrusion time if every path ran at the configured minimum speed.
    pub extrude_time_at_minimum_speed: f64,
}

impl TimeMaterialEstimates {
    pub fn reset(&mut self) {
        *self = TimeMaterialEstimates::default();
    }

    pub fn total_time(&self) -> f64 {
        self.extrude_time + self.unretracted_travel_time + self.retracted_travel_time
    }

    pub fn total_unretracted_time(&self) -> f64 {
        self.extrude_time + self.unretracted_travel_time
    }

    pub fn travel_time(&self) -> f64 {
        self.retracted_travel_time + self.unretracted_travel_time
    }
}

impl AddAssign for TimeMaterialEstimates {
    fn add_assign(&mut self, other: Self) {
        self.extrude_time += other.extrude_time;
        self.unretracted_travel_time += other.unretracted_travel_time;
        self.retracted_travel_time += other.retracted_travel_time;
        self.material += other.material;
        self.extrude_time_at_slowest_path_speed += other.extrude_time_at_slowest_path_speed;
        self.extrude_time_at_minimum_speed += other.extrude_time_at_minimum_speed;
    }
}

impl SubAssign for TimeMaterialEstimates {
    fn sub_assign(&mut self, other: Self) {
        self.extrude_time -= other.extrude_time;
        self.unretracted_travel_time -= other.unretracted_travel_time;
        self.retracted_travel_time -= other.retracted_travel_time;
        self.material -= other.material;
        self.extrude_time_at_slowest_path_speed -= other.extrude_time_at_slowest_path_speed;
        self.extrude_time_at_minimum_speed -= other.extrude_time_at_minimum_speed;
    }
}

impl Add for TimeMaterialEstimates {
    type Output = Self;
    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl Sub for TimeMaterialEstimates {
    type Output = Self;
    fn sub(mut self, other: Self) -> Self {
        self -= other;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_the_right_buckets() {
        let estimates = TimeMaterialEstimates {
            extrude_time: 5.0,
            unretracted_travel_time: 2.0,
            retracted_travel_time: 1.0,
            material: 10.0,
            ..Default::default()
        };
        assert_eq!(estimates.total_time(), 8.0);
        assert_eq!(estimates.total_unretracted_time(), 7.0);
        assert_eq!(estimates.travel_time(), 3.0);
    }
}
