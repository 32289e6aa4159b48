use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};

pub const LIVE_RECORD: &str = "undo.io/live-record";
pub const STATUS:      &str = "undo.io/status";

const SUFFIX:  &str = ".undo";
const PARTIAL: &str = ".partial";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Busy,
    Idle,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Instruction {
    Start,
    Stop,
    Unknown(String),
}

impl Instruction {
    /// Empty values carry no instruction.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            ""      => None,
            "start" => Some(Self::Start),
            "stop"  => Some(Self::Stop),
            other   => Some(Self::Unknown(other.to_owned())),
        }
    }
}

/// Output naming for one recording. The recorder writes `partial`; the
/// file is renamed to `path` once the recorder has exited.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Recording {
    pub path:    PathBuf,
    pub partial: PathBuf,
}

impl Recording {
    pub fn new(dir: &Path, now: DateTime<Utc>) -> Self {
        let name    = format!("recording-{}{}", now.format("%Y%m%d-%H%M%S"), SUFFIX);
        let path    = dir.join(&name);
        let partial = dir.join(format!("{}{}", name, PARTIAL));
        Self { path, partial }
    }

    /// Recording whose unfinished output is `partial`, if it is named like
    /// one.
    pub fn from_partial(partial: &Path) -> Option<Self> {
        let name = partial.file_name()?.to_str()?;
        let done = name.strip_suffix(PARTIAL)?;
        match done.len() > SUFFIX.len() && done.ends_with(SUFFIX) {
            true  => Some(Self { path: partial.with_file_name(done), partial: partial.to_path_buf() }),
            false => None,
        }
    }

    pub fn is_complete(path: &Path) -> bool {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.len() > SUFFIX.len() && name.ends_with(SUFFIX),
            None       => false,
        }
    }
}
