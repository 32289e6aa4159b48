use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use anyhow::{Context, Result};
use libc::pid_t;
use log::{debug, info, warn};
use procfs::process::{all_processes, MMapPath, Process};
use crate::error::Error;

const LIBRARY_DIRS: &[&str] = &[
    "/lib/",
    "/lib64/",
    "/usr/lib/",
    "/usr/lib64/",
    "/usr/local/lib/",
];

#[derive(Clone, Debug)]
pub struct Target {
    pub pid: pid_t,
    pub exe: PathBuf,
}

/// Finds the first live process, other than this one, whose executable
/// base name equals `name`.
pub fn find(name: &str) -> Result<Target> {
    let myself = std::process::id() as pid_t;

    for proc in all_processes()?.flatten() {
        let pid = proc.pid();
        if pid == myself {
            continue;
        }

        let exe = match proc.exe() {
            Ok(exe) => exe,
            Err(_)  => continue,
        };

        if exe.file_name().map_or(false, |n| n == name) {
            return Ok(Target { pid, exe });
        }
    }

    dump_candidates();

    Err(Error::NotFound(name.to_owned()).into())
}

fn dump_candidates() {
    let procs = match all_processes() {
        Ok(procs) => procs,
        Err(e)    => {
            warn!("listing processes: {}", e);
            return;
        }
    };

    for proc in procs.flatten() {
        if let Ok(exe) = proc.exe() {
            let cmdline = proc.cmdline().unwrap_or_default().join(" ");
            info!("candidate pid {} -> {:?} ({})", proc.pid(), exe, cmdline);
        }
    }
}

/// Copies a target's executable image into this service's filesystem,
/// mirroring the absolute paths it has inside the target's mount view.
pub struct Stager {
    root: PathBuf,
}

impl Stager {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn executable(&self, target: &Target) -> Result<PathBuf> {
        let src = proc_dir(target.pid).join("exe");
        let dst = self.dest(&target.exe);
        copy(&src, &dst).map_err(|source| Error::Staging {
            path:   target.exe.clone(),
            source: source,
        })?;
        info!("staged executable {:?}", dst);
        Ok(dst)
    }

    /// Stages every shared library mapped by the target. Failures are
    /// logged per library; the number of libraries copied is returned.
    pub fn libraries(&self, target: &Target) -> Result<usize> {
        let maps = Process::new(target.pid)?.maps().with_context(|| {
            format!("reading mappings of pid {}", target.pid)
        })?;

        let libs = maps.iter().filter_map(|map| {
            library(&map.pathname)
        }).collect::<BTreeSet<_>>();

        info!("found {} shared libraries", libs.len());

        let root = proc_dir(target.pid).join("root");
        Ok(self.copy_all(&root, libs))
    }

    pub fn copy_all<I: IntoIterator<Item = PathBuf>>(&self, src_root: &Path, libs: I) -> usize {
        let mut copied = 0;

        for lib in libs {
            let src = src_root.join(relative(&lib));
            let dst = self.dest(&lib);
            match copy(&src, &dst) {
                Ok(()) => {
                    debug!("staged library {:?}", lib);
                    copied += 1;
                }
                Err(e) => warn!("failed to stage library {:?}: {}", lib, e),
            }
        }

        copied
    }

    fn dest(&self, path: &Path) -> PathBuf {
        self.root.join(relative(path))
    }
}

/// Backing path of a mapping that looks like a shared library.
pub fn library(path: &MMapPath) -> Option<PathBuf> {
    let path = match path {
        MMapPath::Path(path) => path,
        _                    => return None,
    };

    let name = path.to_str()?;
    if name.is_empty() || name.starts_with('[') || name.ends_with(" (deleted)") {
        return None;
    }

    let shared = name.contains(".so") || LIBRARY_DIRS.iter().any(|dir| {
        name.starts_with(dir)
    });

    match shared {
        true  => Some(path.clone()),
        false => None,
    }
}

fn proc_dir(pid: pid_t) -> PathBuf {
    Path::new("/proc").join(pid.to_string())
}

fn relative(path: &Path) -> PathBuf {
    path.components().filter(|c| {
        matches!(c, Component::Normal(_))
    }).collect()
}

/// Copies `src` next to `dst` and renames it into place. The rename swaps
/// the directory entry, so a file already at `dst` (possibly mapped by a
/// running process) keeps its contents.
fn copy(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(dir) = dst.parent() {
        fs::create_dir_all(dir)?;
    }

    let name = dst.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "no file name")
    })?;
    let tmp = dst.with_file_name(format!(".{}.lrec-{}", name.to_string_lossy(), std::process::id()));

    let staged = fs::copy(src, &tmp).and_then(|_| {
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755))
    }).and_then(|_| {
        fs::rename(&tmp, dst)
    });

    if staged.is_err() {
        let _ = fs::remove_file(&tmp);
    }

    staged
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::fs::MetadataExt;
    use std::process::{Child, Command};
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::tempdir;
    use super::*;

    #[test]
    fn library_heuristic() {
        let path = |s: &str| MMapPath::Path(PathBuf::from(s));

        assert!(library(&path("/usr/lib/x86_64-linux-gnu/libc.so.6")).is_some());
        assert!(library(&path("/opt/app/libfoo.so")).is_some());
        assert!(library(&path("/lib64/ld-linux-x86-64.so.2")).is_some());
        assert!(library(&path("/usr/local/lib/plugin")).is_some());
        assert!(library(&path("/usr/bin/app")).is_none());
        assert!(library(&path("/opt/app/libgone.so (deleted)")).is_none());
        assert!(library(&MMapPath::Heap).is_none());
        assert!(library(&MMapPath::Stack).is_none());
        assert!(library(&MMapPath::Anonymous).is_none());
        assert!(library(&MMapPath::Vdso).is_none());
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative(Path::new("/usr/lib/libc.so")), Path::new("usr/lib/libc.so"));
        assert_eq!(relative(Path::new("/../etc/passwd")), Path::new("etc/passwd"));
    }

    #[test]
    fn copy_all_skips_unreadable() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();

        for lib in &["lib/liba.so", "usr/lib/libb.so.1"] {
            let path = src.path().join(lib);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, lib.as_bytes()).unwrap();
        }

        let libs = vec![
            PathBuf::from("/lib/liba.so"),
            PathBuf::from("/lib/libmissing.so"),
            PathBuf::from("/usr/lib/libb.so.1"),
        ];

        let stager = Stager::new(dst.path());
        assert_eq!(stager.copy_all(src.path(), libs), 2);

        let b = fs::read(dst.path().join("usr/lib/libb.so.1")).unwrap();
        assert_eq!(b, b"usr/lib/libb.so.1");
        assert!(dst.path().join("lib/liba.so").exists());
        assert!(!dst.path().join("lib/libmissing.so").exists());
    }

    #[test]
    fn restaging_replaces_rather_than_rewrites() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();

        fs::create_dir_all(src.path().join("lib")).unwrap();
        fs::write(src.path().join("lib/libc.so.6"), b"new").unwrap();

        let staged = dst.path().join("lib/libc.so.6");
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, b"old").unwrap();

        let inode  = fs::metadata(&staged).unwrap().ino();
        let mut in_use = fs::File::open(&staged).unwrap();

        let stager = Stager::new(dst.path());
        assert_eq!(stager.copy_all(src.path(), vec![PathBuf::from("/lib/libc.so.6")]), 1);

        assert_ne!(fs::metadata(&staged).unwrap().ino(), inode);
        assert_eq!(fs::read(&staged).unwrap(), b"new");

        let mut old = Vec::new();
        in_use.read_to_end(&mut old).unwrap();
        assert_eq!(old, b"old");

        let names = fs::read_dir(dst.path().join("lib")).unwrap().count();
        assert_eq!(names, 1);
    }

    struct Reaped(Child);

    impl Drop for Reaped {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn start_renamed_sleep(dir: &Path, name: &str) -> Reaped {
        let exe = dir.join(name);
        fs::copy("/bin/sleep", &exe).unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        let child = Command::new(&exe).arg("30").spawn().unwrap();
        sleep(Duration::from_millis(200));
        Reaped(child)
    }

    #[test]
    fn find_and_stage_live_process() {
        let dir   = tempdir().unwrap();
        let name  = format!("lrec-target-{}", std::process::id());
        let child = start_renamed_sleep(dir.path(), &name);

        let target = find(&name).unwrap();
        assert_eq!(target.pid, child.0.id() as pid_t);
        assert_eq!(target.exe.file_name().unwrap(), name.as_str());

        let root   = tempdir().unwrap();
        let stager = Stager::new(root.path());
        let staged = stager.executable(&target).unwrap();
        assert_eq!(staged, root.path().join(relative(&target.exe)));
        assert_eq!(fs::read(&staged).unwrap(), fs::read(&target.exe).unwrap());
    }

    #[test]
    fn never_finds_itself() {
        let exe  = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_str().unwrap();
        let err  = find(name).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
    }

    #[test]
    fn missing_process() {
        let err = find("lrec-no-such-process").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(n)) if n == "lrec-no-such-process"));
    }
}
