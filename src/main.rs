use std::process::ExitCode;

fn main() -> ExitCode {
    match wise_magpie::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
