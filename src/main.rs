use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use env_logger::{Builder, Target};
use log::{debug, error, info, LevelFilter};

use transeq_pipelines::cli::{parse, validate};
use transeq_pipelines::config::defs::{PipelineError, RunConfig};
use transeq_pipelines::pipelines::main_handler::MainHandler;
use transeq_pipelines::utils::exporters::exporter_specs;
use transeq_pipelines::utils::filters::filter_specs;
use transeq_pipelines::utils::logging::TeeWriter;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    if args.filter_specs || args.exporter_specs {
        if args.filter_specs {
            println!("{}", filter_specs());
        }
        if args.exporter_specs {
            println!("{}", exporter_specs());
        }
        return Ok(());
    }

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let log_file = env::temp_dir().join(format!("transeq-pipelines.{}.log", std::process::id()));
    let target = match TeeWriter::create(&log_file) {
        Ok(tee) => Target::Pipe(Box::new(tee)),
        Err(e) => {
            eprintln!("Could not open log file {}: {}; logging to stderr only", log_file.display(), e);
            Target::Stderr
        }
    };

    Builder::new()
        .filter_level(log_level)
        .target(target)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n TranSEQ\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);
    debug!("Run log is written to {}", log_file.display());

    if let Err(e) = run(dir, log_file.exists().then_some(log_file), args).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}

async fn run(cwd: PathBuf, log_file: Option<PathBuf>, args: transeq_pipelines::Arguments) -> Result<(), PipelineError> {
    validate(&args)?;
    let config = RunConfig { cwd, log_file, args };
    MainHandler::new(config).execute().await
}
