use std::process;

use afl_proxy::{
    args::{Args, ProxyArgs},
    forkserver::ForkserverChannel,
    logger::FileLogger,
    proxy::Proxy,
    shmem::CoverageMaps,
    worker::WorkerChannel,
    Error,
};
use clap::Parser;

fn run(args: &Args) -> Result<u32, Error> {
    let maps = CoverageMaps::from_env()?;
    log::debug!("Attached the coverage map (perf map: {})", maps.uses_perf_map());

    let worker = WorkerChannel::open(args.to_worker(), args.from_worker())?;
    let forkserver = ForkserverChannel::inherited();

    Proxy::new(maps, worker, forkserver).run()
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // The fuzzer treats any non-zero code as a dead target; keep
            // usage errors on the same code as every other fatal error.
            let _ = e.print();
            process::exit(1);
        }
    };

    if let Err(e) = FileLogger::init(&args) {
        eprintln!("{e}");
        process::exit(1);
    }

    match run(&args) {
        // The clean-teardown exit code is the last status word, so a
        // one-shot caller can observe the final worker outcome.
        #[allow(clippy::cast_possible_wrap)]
        Ok(status) => process::exit(status as i32),
        Err(e) => {
            log::error!("{e}");
            process::exit(1);
        }
    }
}
