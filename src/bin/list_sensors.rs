use boostprobe::hwmon::{self, SYS_HWMON_PATH};
use clap::Parser;
use log::info;
use simple_logger::SimpleLogger;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "List hwmon sensor chips", long_about=None)]
struct CLI {
    #[arg(long, short = 'r', default_value = SYS_HWMON_PATH)]
    root: PathBuf,
    #[arg(long, short = 'd', help = "Only show chips with this driver")]
    driver: Option<String>,
}

fn main() {
    if let Err(e) = SimpleLogger::new().env().init() {
        eprintln!("Failed to initialise logging: {e}");
    }
    let args = CLI::parse();

    let devices = hwmon::device_list(&args.root);
    info!("{} sensor chips under {}", devices.len(), args.root.display());

    for device in devices
        .iter()
        .filter(|d| args.driver.as_deref().map_or(true, |driver| d.driver == driver))
    {
        println!("{}\t{}\t{}", device.name, device.driver, device.path.display());
    }
}
