use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use env_logger::Builder;
use gumdrop::Options;
use log::{debug, error, info, warn, LevelFilter};
use tokio::signal::unix::{signal, SignalKind};
use lrec::config::Config;
use lrec::control::{Controller, Recorder};
use lrec::meta::Metadata;
use lrec::s3::Bucket;
use lrec::shutdown::{self, Trigger};
use lrec::target::{self, Stager};
use lrec::upload::Uploader;

#[derive(Options)]
pub struct Args {
    #[options(help = "print help")]
    help: bool,
    #[options(no_short, meta = "PATH", help = "recorder binary")]
    recorder: Option<PathBuf>,
    #[options(no_short, meta = "DIR", help = "recorder support directory")]
    undo_dir: Option<PathBuf>,
    #[options(no_short, meta = "DIR", help = "directory recordings are written to")]
    recordings: Option<PathBuf>,
    #[options(no_short, meta = "DIR", help = "root the target image is staged under")]
    stage_root: Option<PathBuf>,
    #[options(no_short, meta = "SECS", help = "instruction poll interval")]
    poll: Option<u64>,
    #[options(no_short, meta = "SECS", help = "upload scan interval")]
    scan: Option<u64>,
    #[options(count, help = "more logging")]
    verbose: u32,
}

#[tokio::main]
async fn main() {
    let args = Args::parse_args_default_or_exit();

    let mut builder = Builder::from_default_env();
    builder.filter(None, match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    builder.init();

    if let Err(e) = run(args).await {
        error!("{:?}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!("starting live recorder sidecar");

    let cfg = Config::from_env()?;
    debug!("{:?}", cfg);

    let recorder = Recorder {
        binary: args.recorder.unwrap_or_else(|| "/undo/live-record".into()),
        dir:    args.recordings.unwrap_or_else(|| "/recordings".into()),
    };
    let support = args.undo_dir.unwrap_or_else(|| "/undo/undolr".into());

    recorder.check(&support)?;
    match recorder.recover() {
        Ok(0)  => {},
        Ok(n)  => info!("recovered {} unfinished recordings", n),
        Err(e) => warn!("unfinished recordings not recovered: {:?}", e),
    }

    let meta   = Arc::new(Metadata::in_cluster(&cfg.namespace, &cfg.pod)?);
    let bucket = Bucket::new(&cfg)?;

    let target = target::find(&cfg.process)?;
    info!("found {} with pid {}", cfg.process, target.pid);

    let stager = Stager::new(args.stage_root.unwrap_or_else(|| "/".into()));
    stager.executable(&target)?;
    match stager.libraries(&target) {
        Ok(n)  => info!("staged {} shared libraries", n),
        Err(e) => warn!("shared libraries not staged: {:?}", e),
    }

    let (trigger, shutdown) = shutdown::channel();
    let signals = signals(trigger)?;
    lrec::spawn("signal handler", signals);

    let poll = Duration::from_secs(args.poll.unwrap_or(5));
    let scan = Duration::from_secs(args.scan.unwrap_or(10));

    let dir        = recorder.dir.clone();
    let uploader   = Uploader::new(meta.clone(), bucket, dir, cfg.prefix.clone());
    let controller = Controller::new(meta, recorder, target.pid);

    let (uploaded, controlled) = tokio::join!(
        uploader.run(scan, shutdown.clone()),
        controller.run(poll, shutdown),
    );
    uploaded?;
    controlled?;

    info!("sidecar shut down");

    Ok(())
}

fn signals(trigger: Trigger) -> Result<impl std::future::Future<Output = Result<()>>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int  = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = int.recv()  => info!("received SIGINT"),
        }
        trigger.fire();
        Ok(())
    })
}
