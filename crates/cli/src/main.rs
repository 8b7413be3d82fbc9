use std::process::ExitCode;

fn main() -> ExitCode {
    keystone_cli::run()
}
