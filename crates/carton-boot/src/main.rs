use std::process::ExitCode;

use carton_boot::launch::{self, LaunchConfig};
use carton_boot::workdir::ENV_WORKDIR;

fn main() -> ExitCode {
    let executable = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            eprintln!("carton-boot: fatal: cannot determine executable path: {err}");
            return ExitCode::from(launch::EXIT_BOOTSTRAP_FAILURE);
        }
    };

    let config = LaunchConfig {
        executable,
        args: std::env::args().skip(1).collect(),
        inherited_workdir: std::env::var_os(ENV_WORKDIR).map(Into::into),
    };

    ExitCode::from(launch::run(config))
}
