use core::error::Error;

use clap::Parser;
use rbench::{
    cfg::Config,
    cmd::Cmd,
    engine::{self, Engine},
    report::Report,
};
use tokio::runtime::Builder;

#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

pub fn main() {
    let cmd = Cmd::parse();
    if let Err(err) = rbench::logging::init(cmd.verbose as usize) {
        eprintln!("ERROR: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(cmd) {
        eprintln!("ERROR: {err}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), Box<dyn Error>> {
    let cfg: Config = cmd.try_into()?;
    let format = cfg.format;

    // Init I/O runtime.
    let run = Builder::new_multi_thread()
        .worker_threads(cfg.threads.get())
        .enable_io()
        .enable_time()
        .thread_name("rbench:w")
        .build()?
        .block_on(async {
            let engine = Engine::new(cfg)?;

            engine.run().await
        });

    let run = match run {
        Ok(run) => run,
        Err(err @ engine::Error::Dial { .. }) => {
            log::error!("{err}");
            log::error!("Try increasing the timeout using flag `-t`, or use `--ignore-err` to bypass.");
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let report = Report::new(&run);
    print!("{}", report.render(format)?);

    Ok(())
}
