use ::clap::Parser;
use lazy_static::lazy_static;
use log::LevelFilter;

lazy_static! {
  /*
    Global configuration variable.

    Built from the command line on first access and never changed after.
    Only the binaries and the driver read it: library components take
    explicit parameters so they can run against fixtures.

    lazy_static wraps the value in a unique type implementing Deref, so
    deref (*CONFIGURATION) when debug/trace printing.
  */

  pub static ref CONFIGURATION: Configuration = Configuration::new();
}

#[derive(Debug)]
pub struct Configuration {
    pub iterations: u32,
    pub busy_ms: u64,
    pub tween_us: u64,
    pub calibration_ms: u64,
    pub sensor_driver: String,
    pub sensor_index: usize,
    pub max_cores: Option<usize>,
    pub csv: Option<String>,
    pub log_level: LevelFilter,
}

impl Configuration {
    fn new() -> Self {
        Self::from(CLI::parse())
    }
}

impl From<CLI> for Configuration {
    fn from(args: CLI) -> Self {
        Configuration {
            iterations: args.iterations,
            busy_ms: args.busy_ms,
            tween_us: args.tween_us,
            calibration_ms: args.calibration_ms,
            sensor_driver: args.sensor_driver,
            sensor_index: args.sensor_index,
            max_cores: args.max_cores,
            csv: args.csv,
            log_level: args.log_level,
        }
    }
}

/*
  >>> ATTENTION <<<

    When updating this structure, you probably want to update
    the Configuration structure (and its From impl) too.
*/

#[derive(Parser)]
#[command(author, version, about, long_about=None)]
struct CLI {
    #[arg(
        long,
        short = 'n',
        default_value_t = 10,
        help = "Measurement iterations per burst"
    )]
    iterations: u32,
    #[arg(
        long,
        default_value_t = 20,
        help = "Milliseconds to spin per iteration, also the warm-up length"
    )]
    busy_ms: u64,
    #[arg(long, default_value_t = 0, help = "Microseconds to sleep before each iteration")]
    tween_us: u64,
    #[arg(
        long,
        default_value_t = 2000,
        help = "Milliseconds over which the cycle counter is calibrated"
    )]
    calibration_ms: u64,
    #[arg(
        long,
        short = 'd',
        default_value = "k10temp",
        help = "hwmon driver that exposes Vcore"
    )]
    sensor_driver: String,
    #[arg(
        long,
        default_value_t = 0,
        help = "Which chip to use when several share the driver"
    )]
    sensor_index: usize,
    #[arg(long, short = 'c', help = "Sweep at most this many cores")]
    max_cores: Option<usize>,
    #[arg(long, help = "Append sweep rows to this CSV file")]
    csv: Option<String>,
    #[arg(
        long,
        short = 'l',
        default_value = "info",
        value_parser = parse_level,
        help = "Log level: off, error, warn, info, debug or trace"
    )]
    log_level: LevelFilter,
}

fn parse_level(level: &str) -> Result<LevelFilter, String> {
    level
        .parse()
        .map_err(|_| format!("unknown log level {level:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Configuration {
        let argv = std::iter::once("boostprobe").chain(args.iter().copied());
        Configuration::from(CLI::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_defaults_match_fixed_protocol() {
        let config = parse(&[]);
        assert_eq!(config.iterations, 10);
        assert_eq!(config.busy_ms, 20);
        assert_eq!(config.tween_us, 0);
        assert_eq!(config.calibration_ms, 2000);
        assert_eq!(config.sensor_driver, "k10temp");
        assert_eq!(config.sensor_index, 0);
        assert_eq!(config.max_cores, None);
        assert_eq!(config.csv, None);
        assert_eq!(config.log_level, LevelFilter::Info);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&["-n", "4", "--busy-ms", "50", "-d", "zenpower", "-c", "2", "-l", "trace"]);
        assert_eq!(config.iterations, 4);
        assert_eq!(config.busy_ms, 50);
        assert_eq!(config.sensor_driver, "zenpower");
        assert_eq!(config.max_cores, Some(2));
        assert_eq!(config.log_level, LevelFilter::Trace);
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let argv = ["boostprobe", "--log-level", "loud"];
        assert!(CLI::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        CLI::command().debug_assert();
    }
}
