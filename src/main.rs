use std::process::ExitCode;

fn main() -> ExitCode {
    slidesync::cli::run()
}
