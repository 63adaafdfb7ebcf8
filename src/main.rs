use boostprobe::cli::CONFIGURATION;
use boostprobe::driver::Driver;
use log::{error, trace};
use simple_logger::SimpleLogger;
use std::process;

fn main() {
    if let Err(e) = SimpleLogger::new()
        .with_level(CONFIGURATION.log_level)
        .env()
        .init()
    {
        eprintln!("Failed to initialise logging: {e}");
    }
    trace!("Configuration: {:#?}", *CONFIGURATION);

    if let Err(e) = Driver::new().run() {
        error!("{e:#}");
        process::exit(1);
    }
}
