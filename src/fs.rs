use std::{
    fs::{self, File, create_dir, rename},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use log::debug;
use rustix::fs::{Mode, chmod};
use sha2::{Digest, Sha256};

pub fn mkdir_p<P: AsRef<Path>>(path: P, mode: Mode) -> Result<()> {
    for dir in descending_dirs(path.as_ref()) {
        match create_dir(&dir) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => (),
            Err(e) => return Err(anyhow!("unable to create directory {:?}: {}", dir, e)),
            Ok(_) => {
                debug!("Created directory {:?}", &dir);
                chmod(&dir, mode)
                    .map_err(|e| anyhow!("unable to change mode of {:?}: {}", dir, e))?;
            }
        }
    }
    Ok(())
}

// Given a path, return it and its parents in descending order.
// For example, "/a/b/c" returns ["/a", "/a/b", "/a/b/c"].
fn descending_dirs(path: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = path
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty() && p.parent().is_some())
        .map(Path::to_path_buf)
        .collect();
    dirs.reverse();
    dirs
}

fn parent_dir(p: &Path) -> Result<&Path> {
    match p.parent() {
        Some(d) if d.as_os_str().is_empty() => Ok(Path::new(".")),
        Some(d) => Ok(d),
        None => Err(anyhow!("invalid path {:?}", p)),
    }
}

pub fn candidate_path<P: AsRef<Path>>(target: P) -> Result<PathBuf> {
    let p = target.as_ref();
    let file_name = p
        .file_name()
        .ok_or_else(|| anyhow!("invalid path {:?}", p))?;
    Ok(parent_dir(p)?.join(format!(".{}.new", file_name.to_string_lossy())))
}

pub fn write_candidate<P: AsRef<Path>>(target: P, contents: &[u8]) -> Result<PathBuf> {
    let candidate = candidate_path(&target)?;
    let mut f = File::create(&candidate)
        .with_context(|| format!("unable to create {:?}", candidate))?;
    f.write_all(contents)
        .with_context(|| format!("unable to write {:?}", candidate))?;
    f.sync_all()
        .with_context(|| format!("unable to sync {:?}", candidate))?;
    Ok(candidate)
}

fn digest_file(path: &Path) -> Result<[u8; 32]> {
    let mut f = File::open(path).with_context(|| format!("unable to open {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("unable to read {:?}", path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn discard(candidate: &Path) -> Result<bool> {
    fs::remove_file(candidate).with_context(|| format!("unable to remove {:?}", candidate))?;
    Ok(false)
}

fn replace(candidate: &Path, target: &Path) -> Result<bool> {
    rename(candidate, target)
        .with_context(|| format!("unable to rename {:?} to {:?}", candidate, target))?;
    let dir_name = parent_dir(target)?;
    let dir = File::open(dir_name).with_context(|| format!("unable to open {:?}", dir_name))?;
    dir.sync_all()
        .with_context(|| format!("unable to sync directory {:?}", dir_name))?;
    Ok(true)
}

// An empty candidate never creates a missing target. The candidate is
// consumed either way.
pub fn install_if_changed<P: AsRef<Path>, Q: AsRef<Path>>(candidate: P, target: Q) -> Result<bool> {
    let (candidate, target) = (candidate.as_ref(), target.as_ref());
    match fs::symlink_metadata(target) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let len = fs::metadata(candidate)
                .with_context(|| format!("unable to stat {:?}", candidate))?
                .len();
            if len == 0 {
                debug!("Not installing empty {:?}", target);
                return discard(candidate);
            }
            debug!("Installing new {:?}", target);
            replace(candidate, target)
        }
        Err(e) => Err(anyhow!("unable to stat {:?}: {}", target, e)),
        Ok(_) => {
            if digest_file(candidate)? == digest_file(target)? {
                debug!("No change to {:?}", target);
                return discard(candidate);
            }
            debug!("Replacing changed {:?}", target);
            replace(candidate, target)
        }
    }
}

pub fn install_contents<P: AsRef<Path>>(target: P, contents: &str) -> Result<bool> {
    let candidate = write_candidate(&target, contents.as_bytes())?;
    install_if_changed(candidate, target)
}

pub fn remove_if_exists<P: AsRef<Path>>(path: P) -> Result<bool> {
    let p = path.as_ref();
    match fs::remove_file(p) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(anyhow!("unable to remove {:?}: {}", p, e)),
    }
}
