use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use libc::pid_t;
use log::{debug, error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::time::interval;
use crate::data::{Instruction, Recording, Status, LIVE_RECORD};
use crate::error::Error;
use crate::meta::Metadata;
use crate::shutdown::Shutdown;

/// How to launch the external recorder.
#[derive(Clone, Debug)]
pub struct Recorder {
    pub binary: PathBuf,
    pub dir:    PathBuf,
}

#[derive(Debug)]
struct Session {
    id:        u64,
    pid:       u32,
    recording: Recording,
}

impl Recorder {
    /// Checks the recorder binary and its support directory exist and
    /// creates the recordings directory.
    pub fn check(&self, support: &Path) -> Result<(), Error> {
        for path in [self.binary.as_path(), support] {
            if let Err(source) = fs::metadata(path) {
                let path = path.to_path_buf();
                return Err(Error::Environment { path, source });
            }
        }

        fs::create_dir_all(&self.dir).map_err(|source| Error::Environment {
            path:   self.dir.clone(),
            source: source,
        })
    }

    /// Publishes output left behind by recorders of an earlier run. No
    /// session exists yet, so every `*.undo.partial` file is orphaned.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0;

        for entry in fs::read_dir(&self.dir).with_context(|| format!("listing {:?}", self.dir))? {
            let rec = match Recording::from_partial(&entry?.path()) {
                Some(rec) => rec,
                None      => continue,
            };

            match fs::rename(&rec.partial, &rec.path) {
                Ok(()) => {
                    info!("recovered unfinished recording {:?}", rec.path);
                    recovered += 1;
                }
                Err(e) => warn!("failed to recover {:?}: {}", rec.partial, e),
            }
        }

        Ok(recovered)
    }
}

type Cell = Arc<Mutex<Option<Session>>>;

/// Drives the recorder from the live-record annotation. At most one
/// session exists at a time; it is owned by `session` and removed by the
/// exit watcher once the recorder has been reaped.
pub struct Controller {
    meta:     Arc<Metadata>,
    recorder: Recorder,
    target:   pid_t,
    session:  Cell,
    next:     AtomicU64,
}

impl Controller {
    pub fn new(meta: Arc<Metadata>, recorder: Recorder, target: pid_t) -> Self {
        Self {
            meta:     meta,
            recorder: recorder,
            target:   target,
            session:  Arc::new(Mutex::new(None)),
            next:     AtomicU64::new(0),
        }
    }

    pub async fn run(&self, period: Duration, mut shutdown: Shutdown) -> Result<()> {
        let mut interval = interval(period);

        info!("waiting for {} instructions", LIVE_RECORD);

        loop {
            tokio::select! {
                _ = interval.tick()  => {},
                _ = shutdown.wait() => break,
            }

            if let Err(e) = self.poll().await {
                warn!("instruction poll failed: {:?}", e);
            }
        }

        self.shutdown().await;

        Ok(())
    }

    /// Reads one instruction, acts on it and clears it.
    pub async fn poll(&self) -> Result<()> {
        let value = self.meta.annotation(LIVE_RECORD).await.context("reading instruction")?;

        let instruction = match value.as_deref().and_then(Instruction::parse) {
            Some(instruction) => instruction,
            None              => return Ok(()),
        };

        debug!("instruction {:?}", instruction);

        self.apply(instruction).await;

        self.meta.clear(LIVE_RECORD).await.context("clearing instruction")
    }

    pub async fn apply(&self, instruction: Instruction) {
        match instruction {
            Instruction::Start => {
                if self.recording().is_some() {
                    info!("recording already in progress, ignoring start");
                    return;
                }

                match self.start().await {
                    Ok(rec) => info!("recording pid {} to {:?}", self.target, rec.partial),
                    Err(e)  => error!("failed to start recording: {:?}", e),
                }
            }
            Instruction::Stop => {
                if !self.stop() {
                    info!("no recording in progress, nothing to stop");
                }
            }
            Instruction::Unknown(value) => {
                warn!("unknown {} value {:?}", LIVE_RECORD, value);
            }
        }
    }

    /// Recorder pid of the active session.
    pub fn recording(&self) -> Option<u32> {
        self.session.lock().as_ref().map(|s| s.pid)
    }

    async fn start(&self) -> Result<Recording> {
        let recording = Recording::new(&self.recorder.dir, Utc::now());

        fs::create_dir_all(&self.recorder.dir).context("creating recordings directory")?;

        if let Err(e) = self.meta.set_status(Status::Busy).await {
            warn!("failed to set busy status: {:?}", e);
        }

        let launched = {
            let mut session = self.session.lock();
            if session.is_some() {
                return Ok(recording);
            }
            self.launch(&recording).and_then(|child| {
                let pid = recorder_pid(&child)?;
                let id  = self.next.fetch_add(1, Ordering::Relaxed);
                *session = Some(Session {
                    id:        id,
                    pid:       pid,
                    recording: recording.clone(),
                });
                Ok((id, child))
            })
        };

        match launched {
            Ok((id, child)) => {
                tokio::spawn(watch(self.session.clone(), id, child, recording.clone()));
                Ok(recording)
            }
            Err(e) => {
                self.meta.report(Status::Idle).await;
                Err(e)
            }
        }
    }

    fn launch(&self, recording: &Recording) -> Result<Child> {
        let mut cmd = Command::new(&self.recorder.binary);
        cmd.arg("-p")
            .arg(self.target.to_string())
            .arg("--recording-file")
            .arg(&recording.partial)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        cmd.spawn().with_context(|| format!("launching {:?}", self.recorder.binary))
    }

    /// Asks the active recorder to finish. Returns false when idle.
    fn stop(&self) -> bool {
        let session = self.session.lock();
        let session = match session.as_ref() {
            Some(session) => session,
            None          => return false,
        };

        info!("stopping recorder pid {} writing {:?} (SIGINT)", session.pid, session.recording.partial);

        if let Err(e) = kill(Pid::from_raw(session.pid as i32), Signal::SIGINT) {
            error!("failed to interrupt recorder pid {}: {}", session.pid, e);
        }

        true
    }

    pub async fn shutdown(&self) {
        info!("controller shutting down");
        self.stop();
        self.meta.report(Status::Idle).await;
    }
}

/// Signalling pid 0 would reach this process's whole group, so a child
/// without a pid never becomes a session.
fn recorder_pid(child: &Child) -> Result<u32> {
    match child.id() {
        Some(pid) if pid > 0 => Ok(pid),
        _                    => Err(anyhow!("recorder exited before its pid was read")),
    }
}

/// Reaps the recorder, publishes its output and releases the session.
async fn watch(cell: Cell, id: u64, mut child: Child, recording: Recording) {
    match child.wait().await {
        Ok(status) if status.success() => info!("recorder exited cleanly"),
        Ok(status) => warn!("recorder exited with {}", status),
        Err(e)     => error!("waiting for recorder: {}", e),
    }

    match fs::rename(&recording.partial, &recording.path) {
        Ok(())                                    => info!("recording ready: {:?}", recording.path),
        Err(e) if e.kind() == ErrorKind::NotFound => warn!("recorder left no output at {:?}", recording.partial),
        Err(e)                                    => error!("publishing {:?}: {}", recording.path, e),
    }

    let mut session = cell.lock();
    if session.as_ref().map_or(false, |s| s.id == id) {
        *session = None;
    }
}
