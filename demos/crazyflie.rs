use nalgebra::Vector3;
use se3_control::dynamics::simulate_multirotor;
use se3_control::{ControlGains, FlatOutput, Se3Controller, VehicleParameters, VehicleState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Fly a Crazyflie through a square of waypoints and print the track.
fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let params = VehicleParameters::crazyflie();
    let gains = ControlGains::default();
    let g = gains.g;

    let controller = match Se3Controller::new(params, gains) {
        Ok(controller) => controller,
        Err(e) => {
            error!("failed to build controller: {e}");
            return;
        }
    };

    let waypoints = [
        Vector3::new(0.0, 0.0, 1.0),
        Vector3::new(1.0, 0.0, 1.0),
        Vector3::new(1.0, 1.0, 1.0),
        Vector3::new(0.0, 1.0, 1.0),
        Vector3::new(0.0, 0.0, 1.0),
    ];

    let dt = 1. / 200.; // 200 Hz control loop
    let segment = 3.0; // seconds per waypoint
    let mut state = VehicleState::hover_at(Vector3::zeros());
    let mut current_time = 0.0;

    for (i, waypoint) in waypoints.iter().enumerate() {
        info!(waypoint = i, x = waypoint.x, y = waypoint.y, z = waypoint.z, "heading to waypoint");
        let target = FlatOutput::hold(*waypoint, 0.0);
        let segment_end = current_time + segment;

        while current_time < segment_end {
            let cmd = controller.update(current_time, &state, &target);
            if !cmd.warnings.is_empty() {
                info!(t = current_time, warnings = ?cmd.warnings, "command warnings");
            }

            match simulate_multirotor(
                &state,
                controller.params(),
                controller.allocator(),
                &cmd.cmd_motor_speeds,
                g,
                (current_time, current_time + dt),
                1e-9,
            ) {
                Ok(new_state) => {
                    state = new_state;
                    println!("{} {} {} {}", current_time, state.x.x, state.x.y, state.x.z);
                }
                Err(e) => {
                    error!("simulation failed: {e}");
                    return;
                }
            }

            current_time += dt;
        }

        info!(error = (state.x - waypoint).norm(), "segment finished");
    }
}
