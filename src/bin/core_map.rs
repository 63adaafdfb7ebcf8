use boostprobe::topology::Topology;
use log::error;
use simple_logger::SimpleLogger;
use std::process;

fn main() {
    if let Err(e) = SimpleLogger::new().env().init() {
        eprintln!("Failed to initialise logging: {e}");
    }

    let topology = match Topology::discover() {
        Ok(topology) => topology,
        Err(e) => {
            error!("{e:#}");
            process::exit(1);
        }
    };

    println!(
        "*** {} cores ({} CPUs) detected.",
        topology.cores().len(),
        topology.cpus().len()
    );
    for core in topology.cores() {
        let siblings: Vec<String> = core.siblings.iter().map(ToString::to_string).collect();
        println!("core {}\tCPU {}\t[{}]", core.id, core.cpu_id, siblings.join(","));
    }
}
