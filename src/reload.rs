use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Result, anyhow};
use log::{debug, error, info};
use rustix::fs::Mode;
use rustix::io::Errno;
use rustix::process::{Pid, test_kill_process};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::backoff::{Clock, Deadline};
use crate::config::{Config, RetryPolicy};
use crate::constants::RELOAD_COMMAND;
use crate::error::NetcfgError;
use crate::fs::{mkdir_p, remove_if_exists};
use crate::interface::validate_name;

pub trait Reloader: Send + Sync {
    fn reload(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct Networkctl;

impl Reloader for Networkctl {
    fn reload(&self) -> Result<()> {
        let output = Command::new(RELOAD_COMMAND)
            .arg("reload")
            .output()
            .map_err(|e| anyhow!("unable to run {}: {}", RELOAD_COMMAND, e))?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(anyhow!(
                "{} reload failed with exit code {}: {}",
                RELOAD_COMMAND,
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            None => Err(anyhow!("{} terminated by signal", RELOAD_COMMAND)),
        }
    }
}

// The last registrant out removes the lock directory and runs the reload the
// batch flagged.
pub struct ReloadCoordinator {
    lock_dir: PathBuf,
    reload_flag: PathBuf,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    reloader: Arc<dyn Reloader>,
}

impl ReloadCoordinator {
    pub fn new(config: &Config, clock: Arc<dyn Clock>, reloader: Arc<dyn Reloader>) -> Self {
        Self {
            lock_dir: config.lock_dir.clone(),
            reload_flag: config.reload_flag.clone(),
            policy: config.registration,
            clock,
            reloader,
        }
    }

    pub fn register(&self, interface_id: &str) -> Result<ReloadGuard> {
        validate_name(interface_id)?;
        let file = self.lock_dir.join(interface_id);
        let mut deadline = Deadline::new(self.clock.as_ref(), &self.policy);
        loop {
            match self.try_register(&file) {
                Ok(()) => break,
                Err(e) => {
                    if deadline.expired() {
                        error!("Giving up registration in {:?}: {}", self.lock_dir, e);
                        return Err(NetcfgError::RegistrationFailed {
                            path: self.lock_dir.clone(),
                        }
                        .into());
                    }
                    debug!("Retrying registration in {:?}: {}", self.lock_dir, e);
                    deadline.wait();
                }
            }
        }
        debug!("Registered {:?}", file);
        let registration = Registration {
            file,
            lock_dir: self.lock_dir.clone(),
            reload_flag: self.reload_flag.clone(),
            reloader: self.reloader.clone(),
        };
        Ok(ReloadGuard {
            registration: Arc::new(Mutex::new(Some(registration))),
        })
    }

    // A peer may remove the directory between creating it and creating the
    // file in it, in which case the next try recreates it.
    fn try_register(&self, file: &Path) -> Result<()> {
        mkdir_p(&self.lock_dir, Mode::from(0o755))?;
        match OpenOptions::new().write(true).create_new(true).open(file) {
            Ok(mut f) => {
                writeln!(f, "{}", process::id())
                    .map_err(|e| anyhow!("unable to write {:?}: {}", file, e))?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if registrant_alive(file) {
                    return Err(anyhow!("{:?} is held by a running process", file));
                }
                debug!("Removing stale registration {:?}", file);
                remove_if_exists(file)?;
                Err(anyhow!("replaced stale registration {:?}", file))
            }
            Err(e) => Err(anyhow!("unable to create {:?}: {}", file, e)),
        }
    }

    pub fn mark_reload_needed(&self) -> Result<()> {
        if let Some(dir) = self.reload_flag.parent() {
            mkdir_p(dir, Mode::from(0o755))?;
        }
        File::create(&self.reload_flag)
            .map_err(|e| anyhow!("unable to create {:?}: {}", self.reload_flag, e))?;
        Ok(())
    }

    pub fn reload_needed(&self) -> bool {
        self.reload_flag.exists()
    }
}

// Whether the process named in a registration file still runs. Our own pid
// means a leftover from this process, which can be reused.
fn registrant_alive(file: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(file) else {
        return false;
    };
    let Some(pid) = contents
        .trim()
        .parse::<i32>()
        .ok()
        .and_then(Pid::from_raw)
    else {
        return false;
    };
    if pid.as_raw_nonzero().get() as u32 == process::id() {
        return false;
    }
    match test_kill_process(pid) {
        Ok(()) => true,
        Err(Errno::SRCH) => false,
        Err(_) => true,
    }
}

struct Registration {
    file: PathBuf,
    lock_dir: PathBuf,
    reload_flag: PathBuf,
    reloader: Arc<dyn Reloader>,
}

impl Registration {
    // Returns whether this process reloaded networkd.
    fn finish(self) -> Result<bool> {
        remove_if_exists(&self.file)?;
        if let Err(e) = fs::remove_dir(&self.lock_dir) {
            debug!("Deferring reload, {:?} not removed: {}", self.lock_dir, e);
            return Ok(false);
        }
        if !remove_if_exists(&self.reload_flag)? {
            debug!("Last registrant, no reload needed");
            return Ok(false);
        }
        info!("Reloading networkd");
        self.reloader.reload()?;
        Ok(true)
    }
}

fn release_shared(registration: &Mutex<Option<Registration>>) -> Result<bool> {
    // Held across finish() so that a signal arriving during a normal exit
    // waits for it rather than racing it.
    let mut slot = registration.lock().unwrap_or_else(|e| e.into_inner());
    match slot.take() {
        Some(r) => r.finish(),
        None => Ok(false),
    }
}

pub struct ReloadGuard {
    registration: Arc<Mutex<Option<Registration>>>,
}

impl ReloadGuard {
    /// Returns whether this process ran the reload.
    pub fn release(self) -> Result<bool> {
        release_shared(&self.registration)
    }

    pub fn exit_on_signals(&self) -> Result<()> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])
            .map_err(|e| anyhow!("unable to register signal handlers: {}", e))?;
        let registration = self.registration.clone();
        thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("Received signal {}, leaving reload batch", signal);
                if let Err(e) = release_shared(&registration) {
                    error!("Unable to release registration: {}", e);
                }
                process::exit(128 + signal);
            }
        });
        Ok(())
    }
}

impl Drop for ReloadGuard {
    fn drop(&mut self) {
        if let Err(e) = release_shared(&self.registration) {
            error!("Unable to release registration: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crossbeam::sync::WaitGroup;
    use pretty_assertions::assert_eq;
    use rand::seq::SliceRandom;

    use super::*;
    use crate::backoff::SystemClock;
    use crate::backoff::testing::FakeClock;

    #[derive(Default)]
    struct CountingReloader {
        reloads: AtomicUsize,
    }

    impl Reloader for CountingReloader {
        fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            lock_dir: dir.join("lock"),
            reload_flag: dir.join("reload-networkd"),
            registration: RetryPolicy {
                max_duration_ms: 50,
                cap_ms: 5,
            },
            ..Config::default()
        }
    }

    fn coordinator(config: &Config, reloader: Arc<CountingReloader>) -> ReloadCoordinator {
        ReloadCoordinator::new(config, Arc::new(FakeClock::new()), reloader)
    }

    #[test]
    fn test_single_process_reloads_when_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let reloader = Arc::new(CountingReloader::default());
        let coordinator = coordinator(&config, reloader.clone());

        let guard = coordinator.register("eth1").unwrap();
        assert_eq!(
            fs::read_to_string(config.lock_dir.join("eth1")).unwrap(),
            format!("{}\n", process::id())
        );
        coordinator.mark_reload_needed().unwrap();
        assert!(coordinator.reload_needed());
        assert!(guard.release().unwrap());

        assert_eq!(reloader.reloads.load(Ordering::SeqCst), 1);
        assert!(!config.lock_dir.exists());
        assert!(!coordinator.reload_needed());
    }

    #[test]
    fn test_no_reload_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let reloader = Arc::new(CountingReloader::default());
        let coordinator = coordinator(&config, reloader.clone());

        let guard = coordinator.register("eth1").unwrap();
        drop(guard);

        assert_eq!(reloader.reloads.load(Ordering::SeqCst), 0);
        assert!(!config.lock_dir.exists());
    }

    #[test]
    fn test_peer_defers_reload_to_last() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let reloader = Arc::new(CountingReloader::default());
        let coordinator = coordinator(&config, reloader.clone());

        let first = coordinator.register("eth1").unwrap();
        let second = coordinator.register("eth2").unwrap();
        coordinator.mark_reload_needed().unwrap();

        assert!(!first.release().unwrap());
        assert_eq!(reloader.reloads.load(Ordering::SeqCst), 0);
        assert!(coordinator.reload_needed());
        assert!(second.release().unwrap());
        assert_eq!(reloader.reloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_registration_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.lock_dir).unwrap();
        // Above any possible pid_max.
        fs::write(config.lock_dir.join("eth1"), format!("{}\n", i32::MAX)).unwrap();
        let coordinator = coordinator(&config, Arc::new(CountingReloader::default()));

        let guard = coordinator.register("eth1").unwrap();
        assert_eq!(
            fs::read_to_string(config.lock_dir.join("eth1")).unwrap(),
            format!("{}\n", process::id())
        );
        guard.release().unwrap();
    }

    #[test]
    fn test_live_registration_blocks_until_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.lock_dir).unwrap();
        fs::write(config.lock_dir.join("eth1"), "1\n").unwrap();
        let coordinator = coordinator(&config, Arc::new(CountingReloader::default()));

        let err = coordinator.register("eth1").err().unwrap();
        assert!(matches!(
            err.downcast_ref::<NetcfgError>(),
            Some(NetcfgError::RegistrationFailed { .. })
        ));
    }

    #[test]
    fn test_registration_fails_when_directory_cannot_exist() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::write(&config.lock_dir, "not a directory").unwrap();
        let coordinator = coordinator(&config, Arc::new(CountingReloader::default()));

        assert!(coordinator.register("eth1").is_err());
        assert!(coordinator.register("").is_err());
    }

    #[test]
    fn test_exactly_one_reload_per_batch() {
        for round in 0..10 {
            let dir = tempfile::tempdir().unwrap();
            let config = test_config(dir.path());
            let reloader = Arc::new(CountingReloader::default());
            let count = 8;
            let flagger = round % count;
            let mut delays: Vec<u64> = (0..count as u64).map(|i| i * 3).collect();
            delays.shuffle(&mut rand::rng());

            let registered = WaitGroup::new();
            let handles: Vec<_> = delays
                .into_iter()
                .enumerate()
                .map(|(i, delay)| {
                    let config = config.clone();
                    let reloader = reloader.clone();
                    let registered = registered.clone();
                    thread::spawn(move || {
                        let coordinator =
                            ReloadCoordinator::new(&config, Arc::new(SystemClock), reloader);
                        let guard = coordinator.register(&format!("eth{}", i)).unwrap();
                        registered.wait();
                        if i == flagger {
                            coordinator.mark_reload_needed().unwrap();
                        }
                        thread::sleep(Duration::from_millis(delay));
                        guard.release().unwrap()
                    })
                })
                .collect();
            registered.wait();
            let reloaded: usize = handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum();

            assert_eq!(reloaded, 1);
            assert_eq!(reloader.reloads.load(Ordering::SeqCst), 1);
            assert!(!config.lock_dir.exists());
            assert!(!config.reload_flag.exists());
        }
    }
}
