// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Process supervision.
//!
//! [`Manager::start`] spawns the cyclic worker as an isolated OS process by
//! re-executing the current binary with `ETHERCAT_MOTION_WORKER=1` set; the
//! application must call [`worker_check`] first thing in `main` so the child
//! turns into the worker instead of the application.  The master handle is a
//! process-wide singleton and only ever lives in the worker.
//!
//! Queue wiring: commands go through a bounded crossbeam channel (overflow is
//! an error to the producer) drained by a writer thread onto the worker's
//! stdin; status frames come back on the worker's stdout and land in a
//! latest-wins cache plus a bounded drop-oldest channel.

use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};

use crate::command::Command;
use crate::config::NetworkConfig;
use crate::engine::CyclicEngine;
use crate::handle::DriveHandle;
use crate::master::sim::SimMaster;
use crate::status::NetworkStatus;
use crate::transport::{
    offer_latest, set_nonblocking, FrameReader, FrameWriter, PipeCommands, PipeStatus,
};
use crate::{Error, Result};

/// Environment variable marking the re-executed child as the worker.
pub const WORKER_ENV: &str = "ETHERCAT_MOTION_WORKER";

const COMMAND_QUEUE_CAPACITY: usize = 1024;
const STATUS_QUEUE_CAPACITY: usize = 64;

/// Supervisor for the isolated cyclic worker process.
pub struct Manager {
    cfg: NetworkConfig,
    child: Option<Child>,
    cmd_tx: Sender<Command>,
    status_rx: Receiver<NetworkStatus>,
    latest: Arc<Mutex<Option<NetworkStatus>>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    /// Set when `stop` had to SIGKILL the worker.
    force_killed: bool,
}

impl Manager {
    /// Spawn the worker, ship it the configuration and wire the queues.
    pub fn start(cfg: NetworkConfig) -> Result<Self> {
        cfg.validate()?;
        let exe = std::env::current_exe()?;
        let mut child = ProcessCommand::new(exe)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take().ok_or(Error::NullHandle("worker stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(Error::NullHandle("worker stdout"))?;

        let mut writer = FrameWriter::new(stdin);
        writer.write_frame(&cfg)?;

        let (cmd_tx, cmd_rx) = bounded::<Command>(COMMAND_QUEUE_CAPACITY);
        let writer_handle = thread::Builder::new()
            .name("ec-cmd-writer".into())
            .spawn(move || {
                for cmd in cmd_rx {
                    if let Err(e) = writer.write_frame(&cmd) {
                        warn!("command pipe closed: {}", e);
                        break;
                    }
                }
            })?;

        let (status_tx, status_rx) = bounded::<NetworkStatus>(STATUS_QUEUE_CAPACITY);
        let status_rx_for_drops = status_rx.clone();
        let latest = Arc::new(Mutex::new(None));
        let latest_writer = Arc::clone(&latest);
        let reader_handle = thread::Builder::new()
            .name("ec-status-reader".into())
            .spawn(move || {
                let mut reader = FrameReader::new(stdout);
                loop {
                    match reader.read_frame::<NetworkStatus>() {
                        Ok(status) => {
                            *latest_writer.lock().unwrap() = Some(status.clone());
                            offer_latest(&status_tx, &status_rx_for_drops, status);
                        }
                        Err(e) => {
                            info!("status stream ended: {}", e);
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            cfg,
            child: Some(child),
            cmd_tx,
            status_rx,
            latest,
            writer: Some(writer_handle),
            reader: Some(reader_handle),
            force_killed: false,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.cfg
    }

    /// Enqueue a command; never blocks.  A full queue is backpressure the
    /// caller must see.
    pub fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.try_send(cmd).map_err(|_| Error::QueueFull)
    }

    /// Non-blocking facade for one drive.
    pub fn drive(&self, pos: u16) -> Result<DriveHandle> {
        let dcfg = self
            .cfg
            .drive(pos)
            .ok_or_else(|| Error::InvalidConfig(format!("no drive at position {}", pos)))?;
        Ok(DriveHandle::new(
            pos,
            dcfg.units,
            self.cmd_tx.clone(),
            Arc::clone(&self.latest),
        ))
    }

    /// Most recent snapshot, if any has arrived yet.
    pub fn latest_status(&self) -> Option<NetworkStatus> {
        self.latest.lock().unwrap().clone()
    }

    /// Drain the status queue and return the newest entry.
    pub fn poll_status(&self) -> Option<NetworkStatus> {
        let mut newest = None;
        while let Ok(s) = self.status_rx.try_recv() {
            newest = Some(s);
        }
        newest
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// `stop` had to fall back to SIGKILL; no orderly teardown happened.
    pub fn was_force_killed(&self) -> bool {
        self.force_killed
    }

    /// Request shutdown (SIGTERM), join within the configured window, then
    /// force-terminate without cleanup.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else { return Ok(()) };
        let pid = child.id() as i32;
        info!("stopping EtherCAT worker (pid {})", pid);
        signal_pid(pid, nix::sys::signal::Signal::SIGTERM);

        let deadline = Instant::now() + Duration::from_millis(self.cfg.stop_join_ms);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("worker exited: {}", status);
                    break;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!("worker did not exit in time; sending SIGKILL");
                        signal_pid(pid, nix::sys::signal::Signal::SIGKILL);
                        let _ = child.wait();
                        self.force_killed = true;
                        break;
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    error!("waiting for worker failed: {}", e);
                    break;
                }
            }
        }
        // The writer thread parks on the channel until the manager drops its
        // sender; the reader thread ends on pipe EOF.  Neither is joined.
        self.writer.take();
        self.reader.take();
        Ok(())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.child.is_some() {
            let _ = self.stop();
        }
    }
}

fn signal_pid(pid: i32, sig: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid), sig) {
        warn!("kill({}, {:?}) failed: {}", pid, sig, e);
    }
}

/// Best-effort release of a busy EtherCAT device node by signalling whoever
/// holds it (TERM, then KILL).  Mirrors the deployment scripts; advisory
/// only, the caller does a single bounded retry afterwards.
pub fn release_device_holders(device_path: &std::path::Path) {
    for sig in ["-TERM", "-KILL"] {
        let result = ProcessCommand::new("fuser")
            .arg("-k")
            .arg(sig)
            .arg(device_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(_) => {}
            Err(e) => {
                warn!("fuser {} {} failed: {}", sig, device_path.display(), e);
                return;
            }
        }
    }
}

/// Turn this process into the cyclic worker when spawned as one.
///
/// Call this first thing in `main`; it returns immediately in the
/// application process and never returns in the worker.
pub fn worker_check() {
    if std::env::var_os(WORKER_ENV).is_none() {
        return;
    }
    let code = match run_worker() {
        Ok(()) => 0,
        Err(e) => {
            error!("EtherCAT worker failed: {}", e);
            eprintln!("EtherCAT worker failed: {}", e);
            1
        }
    };
    std::process::exit(code);
}

/// The worker body: read the config frame, install the signal flag and run
/// the cyclic engine until SIGTERM/SIGINT or command-pipe EOF.
fn run_worker() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    // The config arrives as the first frame; stdin is still blocking here.
    let mut reader = FrameReader::new(std::io::stdin());
    let cfg: NetworkConfig = reader.read_frame()?;
    info!(
        "EtherCAT worker up: master {}, {} drives, cycle {} ms",
        cfg.master_index,
        cfg.drives.len(),
        cfg.cycle_time_ms
    );

    // From now on command frames are drained non-blocking from the loop.
    set_nonblocking(0)?;
    set_nonblocking(1)?;

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| Error::InvalidConfig(format!("signal handler: {}", e)))?;

    let commands = Box::new(PipeCommands::new(reader));
    let status = Box::new(PipeStatus::new(std::io::stdout()));

    if cfg.simulate {
        let mut master = SimMaster::new();
        for d in &cfg.drives {
            master.set_operational(d.position, true);
        }
        let mut engine = CyclicEngine::setup(cfg, master, commands, status)?;
        engine.run(stop)
    } else {
        run_igh_worker(cfg, commands, status, stop)
    }
}

#[cfg(feature = "igh")]
fn run_igh_worker(
    cfg: NetworkConfig,
    commands: Box<PipeCommands<std::io::Stdin>>,
    status: Box<PipeStatus<std::io::Stdout>>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let master = crate::master::igh::Master::open(cfg.master_index)?;
    let mut engine = CyclicEngine::setup(cfg, master, commands, status)?;
    engine.run(stop)
}

#[cfg(not(feature = "igh"))]
fn run_igh_worker(
    _cfg: NetworkConfig,
    _commands: Box<PipeCommands<std::io::Stdin>>,
    _status: Box<PipeStatus<std::io::Stdout>>,
    _stop: Arc<AtomicBool>,
) -> Result<()> {
    Err(Error::LibraryUnavailable(
        "built without the `igh` feature; enable it or set NetworkConfig::simulate".into(),
    ))
}
