use std::process::ExitCode;
use std::sync::Arc;

use tek_s3::env::Settings;

#[actix_web::main]
async fn main() -> ExitCode {
    println!("tek-s3 {}", env!("CARGO_PKG_VERSION"));
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Failed to load settings: {err}");
            return ExitCode::FAILURE;
        }
    };
    tek_s3::setup_logger(&settings.log_level);
    match tek_s3::run(settings, Arc::new(tek_s3::cm::Unavailable)).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code.clamp(1, 255) as u8),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
