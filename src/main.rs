use std::fs;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;

use ibl_pipes::widefield::{FfprobeVideo, SyncSources};
use ibl_pipes::{
    AcquisitionDescription, Cache, Converter, Error, Fetcher, LocalBucket, Params, Widefield,
    make_pipeline,
};

#[derive(Parser, Debug)]
#[command(name = "ibl-pipes", about = "Session pipelines and dataset tools", long_about = None)]
struct Args {
    /// JSON parameters file
    #[arg(long, global = true, env = "ONE_PARAMS")]
    params: Option<Utf8PathBuf>,

    /// Root of the local dataset cache
    #[arg(long, global = true, env = "ONE_CACHE_DIR")]
    cache_dir: Option<Utf8PathBuf>,

    /// HTTP data server mirroring the cache
    #[arg(long, global = true, env = "ONE_HTTP_DATA_SERVER")]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the task graph of a session as Mermaid, or its execution order
    Graph {
        /// Canned experiment description, e.g. choice_world_recording
        #[arg(long, conflicts_with = "description")]
        experiment: Option<String>,
        /// JSON acquisition description
        #[arg(long)]
        description: Option<Utf8PathBuf>,
        /// Session folder the tasks run on
        #[arg(long, default_value = ".")]
        session: Utf8PathBuf,
        /// Print tasks in execution order instead of the graph
        #[arg(long)]
        order: bool,
    },
    /// Experiment ids of local session paths
    Eid { paths: Vec<Utf8PathBuf> },
    /// Local session paths of experiment ids
    Path { eids: Vec<String> },
    /// Remote URLs of local dataset files
    Url { paths: Vec<Utf8PathBuf> },
    /// Download datasets missing from the cache out of a mounted bucket
    Fetch {
        /// Directory holding the bucket contents
        #[arg(long)]
        bucket: Utf8PathBuf,
    },
    /// Time widefield frames on the FPGA clock
    WidefieldSync {
        session: Utf8PathBuf,
        /// Collection holding the FPGA sync files
        #[arg(long, default_value = ibl_pipes::widefield::SYNC_COLLECTION)]
        collection: String,
        /// Write timestamps.npy and led.npy to the raw folder
        #[arg(long)]
        save: bool,
        #[arg(long, default_value = "ffprobe")]
        ffprobe: Utf8PathBuf,
    },
}

impl Args {
    fn params(&self) -> Result<Params, Error> {
        let mut params = match &self.params {
            Some(path) => Params::load(path)?,
            None => Params::default().with_env(),
        };
        if let Some(dir) = &self.cache_dir {
            params.cache_dir = dir.clone();
        }
        if let Some(server) = &self.server {
            params.http_data_server = server.clone();
        }
        Ok(params)
    }
}

fn converter(params: &Params) -> Result<Converter, Error> {
    let cache = Cache::load(&params.cache_dir)?;
    Ok(Converter::new(cache, params.clone()))
}

fn print_missing(input: &str) {
    println!("{} {}", input, style("-").dim());
}

fn main() -> anyhow::Result<()> {
    ibl_pipes::init_logging();

    let args = Args::parse();
    let params = args.params()?;

    match args.command {
        Command::Graph {
            experiment,
            description,
            session,
            order,
        } => {
            let description = match (experiment, description) {
                (_, Some(path)) => AcquisitionDescription::from_json(&fs::read_to_string(&path)?)
                    .with_context(|| format!("parsing {path}"))?,
                (Some(name), None) => AcquisitionDescription::for_experiment(&name),
                (None, None) => anyhow::bail!("either --experiment or --description is required"),
            };
            let pipeline = make_pipeline(&description, &session)?;

            if order {
                let levels = pipeline.levels()?;
                for task in pipeline.execution_order()? {
                    let level = levels.get(task.name.as_str()).copied().unwrap_or_default();
                    println!(
                        "{:>3}  {}  {}",
                        level,
                        style(&task.name).green(),
                        style(task.kind).dim()
                    );
                }
            } else {
                println!("{pipeline}");
            }
        }
        Command::Eid { paths } => {
            let one = converter(&params)?;
            for (path, eid) in paths.iter().zip(one.eid_from_path_batch(&paths)) {
                match eid? {
                    Some(eid) => println!("{} {}", path, style(eid).cyan()),
                    None => print_missing(path.as_str()),
                }
            }
        }
        Command::Path { eids } => {
            let one = converter(&params)?;
            for (eid, path) in eids.iter().zip(one.path_from_eid_batch(&eids)) {
                match path? {
                    Some(path) => println!("{} {}", eid, style(path).cyan()),
                    None => print_missing(eid),
                }
            }
        }
        Command::Url { paths } => {
            let one = converter(&params)?;
            for (path, url) in paths.iter().zip(one.url_from_path_batch(&paths)) {
                match url? {
                    Some(url) => println!("{} {}", path, style(url).cyan()),
                    None => print_missing(path.as_str()),
                }
            }
        }
        Command::Fetch { bucket } => {
            let missing = converter(&params)?.cache().missing_datasets();
            let bucket = LocalBucket::new(bucket);

            let report = Fetcher::new(&bucket, &params).download_datasets(&missing)?;
            println!(
                "{} downloaded, {} already present, {} not found, {} ambiguous",
                style(report.downloaded.len()).green(),
                report.skipped_existing.len(),
                style(report.missing.len()).yellow(),
                style(report.ambiguous.len()).yellow(),
            );
        }
        Command::WidefieldSync {
            session,
            collection,
            save,
            ffprobe,
        } => {
            let widefield = Widefield::new(session);
            let sources = SyncSources {
                collection,
                bpod_channel: params.bpod_channel,
            };

            let times = widefield.sync_timestamps(&sources, &FfprobeVideo::new(ffprobe))?;
            println!(
                "{} frames, drift {:.2} ppm",
                style(times.times.len()).green(),
                times.drift_ppm
            );
            if save {
                for path in widefield.save_timestamps(&times)? {
                    println!("wrote {}", style(path).cyan());
                }
            }
        }
    }

    Ok(())
}
