use std::{env, process::exit};

use tracing::debug;

use caxa_stub::{
    image, launch, staging,
    settings::{self, Settings},
    CaxaResult,
};


fn main() {
    settings::init_logging();
    match run() {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("caxa: {err}");
            exit(1)
        }
    }
}

fn run() -> CaxaResult<i32> {
    let settings = Settings::from_env();

    // the self image is released before the child starts
    let (config, app_dir) = {
        let data = image::read_self()?;
        let image = image::split(&data)?;
        let app_dir = staging::prepare(&settings, &image.config, image.payload)?;
        (image.config, app_dir)
    };

    let outcome = launch::run(&config.command, &app_dir, env::args_os().skip(1))?;
    debug!(?outcome, "child finished");
    Ok(outcome.exit_code())
}
