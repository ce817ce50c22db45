#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

use clap::{App, Arg};
use meshcast::kernel::Kernel;
use meshcast::NodeConfig;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

static CONFIG_PATH_ARG: &str = "PATH";
static NEIGHBOUR_ARG: &str = "NEIGHBOUR";

fn mk_app() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::with_name(CONFIG_PATH_ARG)
                .required(true)
                .index(1)
                .help("Node configuration file path (YAML or JSON)."),
        )
        .arg(
            Arg::with_name(NEIGHBOUR_ARG)
                .long("connect")
                .short("c")
                .takes_value(true)
                .multiple(true)
                .help("Additional neighbour to connect to at startup, as host:port."),
        )
}

fn main() {
    pretty_env_logger::init();

    let opts = mk_app().get_matches();
    let config_path = opts.value_of(CONFIG_PATH_ARG).unwrap();
    let config_str = fs::read_to_string(config_path).expect("could not read configuration file");
    let config = NodeConfig::from_str(&config_str).expect("configuration error");

    let kernel = Kernel::bind(&config).expect("could not bind node kernel");
    let bound = kernel.start().expect("could not start node kernel");
    info!("node {} listening on {}", kernel.self_id, bound);

    for addr in config.neighbours.iter().copied().chain(
        opts.values_of(NEIGHBOUR_ARG)
            .into_iter()
            .flatten()
            .map(|s| SocketAddr::from_str(s).expect("invalid --connect address")),
    ) {
        match kernel.connect(addr) {
            Ok(id) => info!("connected to {} at {}", id, addr),
            Err(e) => warn!("could not connect to {}: {}", addr, e),
        }
    }

    // The kernel runs entirely on background threads; keep the process
    // alive until it's killed.
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
