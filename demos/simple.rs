use nalgebra::{Vector3, Vector4};
use se3_control::{
    Allocator, ControlGains, FlatOutput, Se3Controller, VehicleParameters, VehicleState,
};

const HEXAROTOR: &str = r#"
mass = 1.2
Ixx = 0.025
Iyy = 0.025
Izz = 0.045
num_rotors = 6
rotor_speed_min = 0.0
rotor_speed_max = 1100.0
k_eta = 8.5e-6
k_m = 1.7e-7
tau_m = 0.02
rotor_directions = ["cw", "ccw", "cw", "ccw", "cw", "ccw"]

[rotor_pos]
r1 = [0.25, 0.0, 0.0]
r2 = [0.125, 0.2165, 0.0]
r3 = [-0.125, 0.2165, 0.0]
r4 = [-0.25, 0.0, 0.0]
r5 = [-0.125, -0.2165, 0.0]
r6 = [0.125, -0.2165, 0.0]
"#;

// Load a hexarotor from TOML, print its allocation and a hover command.
fn main() {
    let params = match VehicleParameters::from_toml_str(HEXAROTOR) {
        Ok(params) => params,
        Err(e) => {
            println!("Invalid parameters: {}", e);
            return;
        }
    };

    let allocator = match Allocator::new(&params) {
        Ok(allocator) => allocator,
        Err(e) => {
            println!("Allocation failed: {}", e);
            return;
        }
    };

    println!(
        "Forward allocation (rotor forces -> [T, Mx, My, Mz]):{}",
        allocator.forward_matrix()
    );
    println!("Inverse allocation:{}", allocator.inverse_matrix());

    let weight = params.mass * 9.81;
    let forces = allocator.inverse(&Vector4::new(weight, 0.0, 0.0, 0.0));
    println!("Hover rotor forces (N): {:.4}", forces.transpose());

    let controller = match Se3Controller::new(params, ControlGains::default()) {
        Ok(controller) => controller,
        Err(e) => {
            println!("Controller construction failed: {}", e);
            return;
        }
    };

    let state = VehicleState::hover_at(Vector3::new(0.0, 0.0, 1.0));
    let target = FlatOutput::hold(Vector3::new(0.5, 0.0, 1.0), 0.0);
    let cmd = controller.update(0.0, &state, &target);

    println!("Thrust: {:.3} N", cmd.cmd_thrust);
    println!(
        "Moment: ({:.4}, {:.4}, {:.4}) N·m",
        cmd.cmd_moment.x, cmd.cmd_moment.y, cmd.cmd_moment.z
    );
    println!("Desired attitude [x, y, z, w]: {:?}", cmd.cmd_q_xyzw());
    println!("Rotor speeds (rad/s): {:.1}", cmd.cmd_motor_speeds.transpose());
    for warning in &cmd.warnings {
        println!("Warning: {:?}", warning);
    }
}
