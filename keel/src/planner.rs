/// Trait representing the downstream motion planner and stepper generator
///
/// Coordinates are actuator coordinates in mm (degrees for rotary SCARA joints), the extruder in
/// mm. The planner owns velocity planning and endstop handling: with endstops enabled, a move
/// that trips one stops early and [`Planner::position_steps`] reports where it stopped.
pub trait Planner {
    /// True if another line can be buffered without waiting
    fn has_space(&self) -> bool;

    /// Queue a straight actuator space move, `feedrate` in mm/s
    fn buffer_line(&mut self, target: [f64; 3], e: f64, feedrate: f64);

    /// Declare the current actuator position without moving
    fn set_position(&mut self, actuator: [f64; 3], e: f64);

    /// True once every buffered move has finished executing
    fn is_idle(&self) -> bool;

    /// Step counter of an actuator
    fn position_steps(&self, axis: usize) -> i64;

    fn enable_endstops(&mut self, enabled: bool);

    /// Acknowledge endstop hits that were expected, e.g. while homing or probing
    fn endstops_hit_on_purpose(&mut self);

    /// Bring a retractable probe into position
    fn deploy_probe(&mut self) {}

    fn stow_probe(&mut self) {}

    /// Immediately stop all motion and discard buffered moves
    fn quick_stop(&mut self) {}
}
