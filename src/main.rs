use std::process::ExitCode;

fn main() -> ExitCode {
    match grism_zfit::app::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}
