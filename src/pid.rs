use crate::error::LockError;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use sysinfo::{Pid, System};
use tracing::{info, warn};

/// Single-instance guard backed by a file holding the owner's pid.
///
/// Released on drop, but only if the file still names this process.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
}

impl PidLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        Self::acquire_with(path.into(), std::process::id(), is_process_alive)
    }

    fn acquire_with<F>(path: PathBuf, own_pid: u32, is_alive: F) -> Result<Self, LockError>
    where
        F: Fn(u32) -> bool,
    {
        let io_err = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };
        match fs::read_to_string(&path) {
            Ok(contents) => {
                match contents.trim().parse::<u32>() {
                    Ok(pid) if is_alive(pid) => return Err(LockError::AlreadyRunning { pid }),
                    Ok(pid) => warn!(event = "stale_pid_file", pid, path = %path.display()),
                    Err(_) => warn!(event = "unreadable_pid_file", path = %path.display()),
                }
                remove_if_unchanged(&path, &contents).map_err(io_err)?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(err)),
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        // create_new makes the final claim atomic: of two racing starters,
        // only one creates the file.
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .ok()
                    .and_then(|c| c.trim().parse::<u32>().ok());
                return match holder {
                    Some(pid) => Err(LockError::AlreadyRunning { pid }),
                    None => Err(io_err(err)),
                };
            }
            Err(err) => return Err(io_err(err)),
        };
        file.write_all(own_pid.to_string().as_bytes()).map_err(io_err)?;
        info!(event = "pid_lock_acquired", pid = own_pid, path = %path.display());
        Ok(Self { path, pid: own_pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let owned = fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| c.trim().parse::<u32>().ok())
            == Some(self.pid);
        if owned {
            match fs::remove_file(&self.path) {
                Ok(()) => info!(event = "pid_lock_released", path = %self.path.display()),
                Err(err) => warn!(event = "pid_lock_release_failed", error = %err),
            }
        }
    }
}

/// Deletes a stale lock file unless another process rewrote it meanwhile.
fn remove_if_unchanged(path: &Path, seen: &str) -> io::Result<()> {
    match fs::read_to_string(path) {
        Ok(current) if current == seen => match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        },
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn is_process_alive(pid: u32) -> bool {
    let system = System::new_all();
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");
        {
            let lock = PidLock::acquire(&path).unwrap();
            assert_eq!(fs::read_to_string(lock.path()).unwrap(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_blocks_and_file_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");
        // Our own pid is certainly alive.
        let contents = format!("{}\n", std::process::id());
        fs::write(&path, &contents).unwrap();

        let err = PidLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { pid } if pid == std::process::id()));
        assert_eq!(fs::read_to_string(&path).unwrap(), contents);
    }

    #[test]
    fn stale_or_garbage_pid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");

        fs::write(&path, "4000000").unwrap();
        let lock = PidLock::acquire_with(path.clone(), 77, |_| false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "77");
        drop(lock);
        assert!(!path.exists());

        fs::write(&path, "not a pid").unwrap();
        let _lock = PidLock::acquire_with(path.clone(), 78, |_| true).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "78");
    }

    #[test]
    fn instance_that_claims_the_file_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");
        fs::write(&path, "4000000").unwrap();

        // Another starter replaces the stale pid between our check and our write.
        let racer = path.clone();
        let err = PidLock::acquire_with(path.clone(), 77, move |_| {
            fs::write(&racer, "55").unwrap();
            false
        })
        .unwrap_err();

        assert!(matches!(err, LockError::AlreadyRunning { pid: 55 }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "55");
    }

    #[test]
    fn drop_leaves_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.pid");
        let lock = PidLock::acquire_with(path.clone(), 10, |_| false).unwrap();
        fs::write(&path, "11").unwrap();
        drop(lock);
        assert_eq!(fs::read_to_string(&path).unwrap(), "11");
    }
}
