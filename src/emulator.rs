//! One emulator instance: the hardware emulator process, its companion
//! JavaScript runtime, and the ports and temporary files they use.
//!
//! ## Lifecycle
//!
//! ```text
//! Created -> PortsAllocated -> ImagePrepared -> ProcessesSpawned
//!         -> BootWaiting -> Running -> Terminating -> Terminated
//! ```
//!
//! [`Emulator::provision`] walks the first half. Any failure leaves the
//! instance wherever it stopped; the caller must call
//! [`Emulator::terminate`], which releases whatever was acquired and always
//! ends in `Terminated`. All mutable state sits behind one async mutex, so
//! provision, liveness polls and teardown of the same instance never overlap.

use std::ffi::OsString;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::{TempDir, TempPath};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::allocator::{AllocError, PortAllocator, PortLease};
use crate::config::{BootTiming, EmulatorSettings};
use crate::platform::Platform;

/// Console output that means the firmware finished booting.
const READY_MARKERS: [&[u8]; 3] = [b"<SDK Home>", b"<Launcher>", b"Ready for communication"];

/// Number of console bytes kept between reads while looking for a marker.
const CONSOLE_TAIL: usize = 64;

const MICRO_FLASH: &str = "qemu_micro_flash.bin";
const SPI_FLASH: &str = "qemu_spi_flash.bin";
const SPI_FLASH_BZ2: &str = "qemu_spi_flash.bin.bz2";

/// Immutable launch parameters of one instance.
#[derive(Clone)]
pub struct EmulatorConfig {
    /// Client token. Its first 8 characters become the VNC password.
    pub token: String,
    pub platform: Platform,
    pub version: String,
    /// Client offset from UTC in minutes (east positive).
    pub tz_offset: Option<i32>,
    pub oauth: Option<String>,
}

impl std::fmt::Debug for EmulatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorConfig")
            .field("platform", &self.platform)
            .field("version", &self.version)
            .field("tz_offset", &self.tz_offset)
            .field("oauth", &self.oauth.is_some())
            .finish_non_exhaustive()
    }
}

impl EmulatorConfig {
    /// The secret written to the emulator monitor as the display password.
    pub fn boot_secret(&self) -> String {
        self.token.chars().take(8).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    PortsAllocated,
    ImagePrepared,
    ProcessesSpawned,
    BootWaiting,
    Running,
    Terminating,
    Terminated,
}

/// Externally relevant connection points of a provisioned instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    /// Device-protocol WebSocket port served by the companion runtime.
    pub ws_port: u16,
    pub vnc_display: u16,
    /// Display-protocol WebSocket port served by the emulator.
    pub vnc_ws_port: u16,
}

impl From<&PortLease> for Endpoints {
    fn from(lease: &PortLease) -> Self {
        Self {
            ws_port: lease.ws,
            vnc_display: lease.vnc_display,
            vnc_ws_port: lease.vnc_ws,
        }
    }
}

/// Which wait of the boot handshake ran out of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    ConsoleConnect,
    ReadyMarker,
}

impl std::fmt::Display for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootStage::ConsoleConnect => f.write_str("the console port"),
            BootStage::ReadyMarker => f.write_str("the firmware ready message"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("instance is {0:?}, only a fresh instance can be provisioned")]
    InvalidState(LifecycleState),
    #[error("port allocation failed: {0}")]
    Ports(#[from] AllocError),
    #[error("failed to prepare flash image from {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create temporary storage: {0}")]
    TempStorage(#[source] io::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to write boot secret to the emulator monitor: {0}")]
    Monitor(#[source] io::Error),
    #[error("emulator launch timed out waiting for {0}")]
    LaunchTimeout(BootStage),
    #[error("emulator console closed before the firmware was ready")]
    ConsoleClosed,
    #[error("failed to read emulator console: {0}")]
    Console(#[source] io::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LaunchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LaunchError::LaunchTimeout(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("{process} (pid {pid}) did not exit after SIGTERM and SIGKILL")]
    ProcessDidNotExit { process: &'static str, pid: u32 },
}

struct Inner {
    state: LifecycleState,
    lease: Option<PortLease>,
    qemu: Option<Child>,
    /// Held open so the monitor does not see EOF while the emulator runs.
    qemu_stdin: Option<ChildStdin>,
    pkjs: Option<Child>,
    flash_image: Option<TempPath>,
    persist_dir: Option<TempDir>,
    /// Tasks copying child stdout/stderr into the log.
    drains: Vec<JoinHandle<()>>,
}

impl Inner {
    fn fresh() -> Self {
        Self {
            state: LifecycleState::Created,
            lease: None,
            qemu: None,
            qemu_stdin: None,
            pkjs: None,
            flash_image: None,
            persist_dir: None,
            drains: Vec::new(),
        }
    }
}

pub struct Emulator {
    id: Uuid,
    config: EmulatorConfig,
    settings: Arc<EmulatorSettings>,
    allocator: PortAllocator,
    last_ping: parking_lot::Mutex<Instant>,
    endpoints: parking_lot::Mutex<Option<Endpoints>>,
    inner: tokio::sync::Mutex<Inner>,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("endpoints", &*self.endpoints.lock())
            .finish_non_exhaustive()
    }
}

impl Emulator {
    /// A fresh, unprovisioned instance with a new id.
    pub fn new(
        config: EmulatorConfig,
        settings: Arc<EmulatorSettings>,
        allocator: PortAllocator,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            settings,
            allocator,
            last_ping: parking_lot::Mutex::new(Instant::now()),
            endpoints: parking_lot::Mutex::new(None),
            inner: tokio::sync::Mutex::new(Inner::fresh()),
        }
    }

    /// Wrap an emulator and runtime that were started outside
    /// [`Emulator::provision`]. The instance starts out `Running` and owns
    /// `lease`, which must have come from `allocator`.
    ///
    /// For test harnesses that stand in their own processes; the server only
    /// builds instances through [`Emulator::new`] and `provision`.
    #[doc(hidden)]
    pub fn adopt(
        config: EmulatorConfig,
        settings: Arc<EmulatorSettings>,
        allocator: PortAllocator,
        lease: PortLease,
        emulator: Child,
        runtime: Child,
    ) -> Self {
        let mut this = Self::new(config, settings, allocator);
        *this.endpoints.get_mut() = Some(Endpoints::from(&lease));
        let inner = this.inner.get_mut();
        inner.lease = Some(lease);
        inner.qemu = Some(emulator);
        inner.pkjs = Some(runtime);
        inner.state = LifecycleState::Running;
        this
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Connection points, once ports are allocated and until teardown.
    pub fn endpoints(&self) -> Option<Endpoints> {
        *self.endpoints.lock()
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    /// Record that a client has seen this instance alive.
    pub fn mark_alive(&self) {
        *self.last_ping.lock() = Instant::now();
    }

    /// Time since creation or the last successful ping.
    pub fn idle_for(&self) -> Duration {
        self.last_ping.lock().elapsed()
    }

    /// Allocate resources, start the emulator, wait for the firmware to boot,
    /// then start the companion runtime.
    ///
    /// Does not clean up after itself on failure; call [`Emulator::terminate`].
    pub async fn provision(&self) -> Result<Endpoints, LaunchError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Created {
            return Err(LaunchError::InvalidState(inner.state));
        }
        let timing = &self.settings.timing;

        let lease = self.allocator.allocate_lease()?;
        let endpoints = Endpoints::from(&lease);
        inner.lease = Some(lease);
        *self.endpoints.lock() = Some(endpoints);
        inner.state = LifecycleState::PortsAllocated;
        tracing::debug!(emulator = %self.id, ?lease, "ports allocated");

        let image_dir = self.settings.image_dir(self.config.platform.as_str());
        let flash = prepare_flash_image(image_dir.clone()).await?;
        let flash_path = flash.to_path_buf();
        inner.flash_image = Some(flash);
        inner.state = LifecycleState::ImagePrepared;

        let args = qemu_args(self.config.platform, &image_dir, &flash_path, &lease);
        let mut qemu = Command::new(&self.settings.qemu_bin)
            .args(&args)
            .current_dir(&self.settings.qemu_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn { program: "emulator", source })?;
        tracing::info!(
            emulator = %self.id,
            pid = qemu.id(),
            platform = %self.config.platform,
            version = %self.config.version,
            "emulator spawned"
        );
        let stdin = qemu.stdin.take();
        self.drain_child_output(&mut inner, &mut qemu, "emulator");
        inner.qemu = Some(qemu);
        inner.state = LifecycleState::ProcessesSpawned;

        if let Some(mut stdin) = stdin {
            let command = format!("change vnc password\n{}\n", self.config.boot_secret());
            stdin
                .write_all(command.as_bytes())
                .await
                .map_err(LaunchError::Monitor)?;
            stdin.flush().await.map_err(LaunchError::Monitor)?;
            inner.qemu_stdin = Some(stdin);
        }

        inner.state = LifecycleState::BootWaiting;
        let mut console = connect_console(lease.console, timing).await?;
        wait_for_ready(&mut console, timing).await?;
        drop(console);
        tracing::info!(emulator = %self.id, "firmware ready");
        if !timing.settle().is_zero() {
            tokio::time::sleep(timing.settle()).await;
        }

        let persist_dir = tempfile::Builder::new()
            .prefix("pkjs-persist-")
            .tempdir()
            .map_err(LaunchError::TempStorage)?;
        let args = pkjs_args(
            &self.config,
            &lease,
            persist_dir.path(),
            self.settings.block_private_addresses,
        );
        inner.persist_dir = Some(persist_dir);
        let mut command = Command::new(&self.settings.pkjs_bin);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(offset) = self.config.tz_offset {
            command.env("TZ", posix_timezone(offset));
        }
        let mut pkjs = command
            .spawn()
            .map_err(|source| LaunchError::Spawn { program: "runtime", source })?;
        tracing::info!(
            emulator = %self.id,
            pid = pkjs.id(),
            token_len = self.config.token.len(),
            oauth = self.config.oauth.is_some(),
            "runtime spawned"
        );
        self.drain_child_output(&mut inner, &mut pkjs, "runtime");
        inner.pkjs = Some(pkjs);
        inner.state = LifecycleState::Running;
        Ok(endpoints)
    }

    /// True iff both processes exist and neither has exited.
    pub async fn is_alive(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let Inner { qemu, pkjs, .. } = &mut *inner;
        match (qemu.as_mut(), pkjs.as_mut()) {
            (Some(qemu), Some(pkjs)) => still_running(qemu) && still_running(pkjs),
            _ => false,
        }
    }

    /// Stop both processes, delete temporary files and release ports.
    ///
    /// Idempotent: a second call on a terminated instance is a no-op. If a
    /// process survives SIGKILL, the instance is still marked terminated but
    /// its ports stay claimed, since the process may still be bound to them.
    pub async fn terminate(&self) -> Result<(), TeardownError> {
        let mut inner = self.inner.lock().await;
        if inner.state == LifecycleState::Terminated {
            return Ok(());
        }
        inner.state = LifecycleState::Terminating;
        let timing = &self.settings.timing;
        let mut failure = None;

        inner.qemu_stdin = None;
        if let Some(child) = inner.qemu.take() {
            if let Err(e) = stop_process(self.id, child, "emulator", timing).await {
                failure = Some(e);
            }
        }
        if let Some(image) = inner.flash_image.take() {
            if let Err(e) = image.close() {
                tracing::debug!(emulator = %self.id, ?e, "failed to delete flash image");
            }
        }
        if let Some(child) = inner.pkjs.take() {
            if let Err(e) = stop_process(self.id, child, "runtime", timing).await {
                failure.get_or_insert(e);
            }
        }
        if let Some(dir) = inner.persist_dir.take() {
            if let Err(e) = dir.close() {
                tracing::debug!(emulator = %self.id, ?e, "failed to remove persist dir");
            }
        }
        for task in inner.drains.drain(..) {
            task.abort();
        }
        if let Some(lease) = inner.lease.take() {
            if failure.is_none() {
                self.allocator.release_lease(&lease);
            } else {
                tracing::error!(emulator = %self.id, ?lease, "abandoning ports of unkillable instance");
            }
        }
        *self.endpoints.lock() = None;
        inner.state = LifecycleState::Terminated;

        match failure {
            Some(e) => {
                tracing::error!(emulator = %self.id, error = %e, "teardown failed");
                Err(e)
            }
            None => {
                tracing::info!(emulator = %self.id, "emulator terminated");
                Ok(())
            }
        }
    }

    fn drain_child_output(&self, inner: &mut Inner, child: &mut Child, process: &'static str) {
        if let Some(stdout) = child.stdout.take() {
            inner.drains.push(drain_output(self.id, process, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            inner.drains.push(drain_output(self.id, process, "stderr", stderr));
        }
    }
}

/// Emulator command line for `platform`.
pub fn qemu_args(
    platform: Platform,
    image_dir: &Path,
    flash_image: &Path,
    lease: &PortLease,
) -> Vec<OsString> {
    let machine = platform.machine();
    let mut args: Vec<OsString> = vec![
        "-rtc".into(),
        "base=localtime".into(),
        "-pflash".into(),
        image_dir.join(MICRO_FLASH).into_os_string(),
        "-serial".into(),
        "null".into(),
        "-serial".into(),
        format!("tcp:127.0.0.1:{},server,nowait", lease.bus).into(),
        "-serial".into(),
        format!("tcp:127.0.0.1:{},server", lease.console).into(),
        "-monitor".into(),
        "stdio".into(),
        "-vnc".into(),
        format!(":{},password,websocket={}", lease.vnc_display, lease.vnc_ws).into(),
    ];
    args.extend([
        "-machine".into(),
        machine.machine.into(),
        "-cpu".into(),
        machine.cpu.into(),
        machine.flash.flag().into(),
        flash_image.as_os_str().to_owned(),
    ]);
    args
}

/// Companion runtime command line.
pub fn pkjs_args(
    config: &EmulatorConfig,
    lease: &PortLease,
    persist_dir: &Path,
    block_private_addresses: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--qemu".into(),
        format!("127.0.0.1:{}", lease.bus).into(),
        "--port".into(),
        lease.ws.to_string().into(),
        "--token".into(),
        config.token.clone().into(),
        "--persist".into(),
        persist_dir.as_os_str().to_owned(),
    ];
    if let Some(oauth) = &config.oauth {
        args.push("--oauth".into());
        args.push(oauth.clone().into());
    }
    if block_private_addresses {
        args.push("--block-private-addresses".into());
    }
    args
}

/// POSIX `TZ` value for a client `offset_minutes` east of UTC.
///
/// POSIX counts offsets west of UTC as positive, so the sign is inverted.
pub fn posix_timezone(offset_minutes: i32) -> String {
    let sign = if offset_minutes > 0 { '-' } else { '+' };
    let magnitude = offset_minutes.unsigned_abs();
    format!("PBL{}{:02}:{:02}", sign, magnitude / 60, magnitude % 60)
}

fn contains_ready_marker(received: &[u8]) -> bool {
    READY_MARKERS
        .iter()
        .any(|marker| received.windows(marker.len()).any(|w| w == *marker))
}

async fn prepare_flash_image(image_dir: PathBuf) -> Result<TempPath, LaunchError> {
    tokio::task::spawn_blocking(move || write_flash_image(&image_dir)).await?
}

/// Copy the platform's SPI flash image into a fresh temporary file,
/// decompressing the bzip2 variant when present.
fn write_flash_image(image_dir: &Path) -> Result<TempPath, LaunchError> {
    let compressed = image_dir.join(SPI_FLASH_BZ2);
    let raw = image_dir.join(SPI_FLASH);
    let mut file = tempfile::Builder::new()
        .prefix("qemu-spi-")
        .suffix(".bin")
        .tempfile()
        .map_err(LaunchError::TempStorage)?;

    let (source, result) = if compressed.exists() {
        let result = std::fs::File::open(&compressed).and_then(|f| {
            let mut decoder = bzip2::read::MultiBzDecoder::new(io::BufReader::new(f));
            io::copy(&mut decoder, file.as_file_mut())
        });
        (compressed, result)
    } else {
        let result = std::fs::File::open(&raw)
            .and_then(|mut f| io::copy(&mut f, file.as_file_mut()));
        (raw, result)
    };
    result
        .and_then(|_| file.as_file_mut().flush())
        .map_err(|source_err| LaunchError::Image { path: source, source: source_err })?;
    Ok(file.into_temp_path())
}

async fn connect_console(port: u16, timing: &BootTiming) -> Result<TcpStream, LaunchError> {
    for _ in 0..timing.console_connect_attempts {
        tokio::time::sleep(timing.console_connect_interval()).await;
        if let Ok(stream) = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            return Ok(stream);
        }
    }
    Err(LaunchError::LaunchTimeout(BootStage::ConsoleConnect))
}

async fn wait_for_ready<R: AsyncRead + Unpin>(
    console: &mut R,
    timing: &BootTiming,
) -> Result<(), LaunchError> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    for _ in 0..timing.ready_attempts {
        tokio::time::sleep(timing.ready_interval()).await;
        match tokio::time::timeout(timing.ready_interval(), console.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => return Err(LaunchError::ConsoleClosed),
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(LaunchError::Console(e)),
        }
        if contains_ready_marker(&received) {
            return Ok(());
        }
        if received.len() > CONSOLE_TAIL {
            received.drain(..received.len() - CONSOLE_TAIL);
        }
    }
    Err(LaunchError::LaunchTimeout(BootStage::ReadyMarker))
}

fn still_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// SIGTERM, poll, then SIGKILL and poll again.
async fn stop_process(
    id: Uuid,
    mut child: Child,
    process: &'static str,
    timing: &BootTiming,
) -> Result<(), TeardownError> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    if !still_running(&mut child) {
        return Ok(());
    }
    send_sigterm(pid);
    if wait_for_exit(&mut child, timing).await {
        return Ok(());
    }
    tracing::warn!(emulator = %id, pid, process, "no exit after SIGTERM, sending SIGKILL");
    if let Err(e) = child.start_kill() {
        tracing::debug!(emulator = %id, pid, process, ?e, "SIGKILL failed");
    }
    if wait_for_exit(&mut child, timing).await {
        return Ok(());
    }
    Err(TeardownError::ProcessDidNotExit { process, pid })
}

async fn wait_for_exit(child: &mut Child, timing: &BootTiming) -> bool {
    for _ in 0..timing.exit_poll_attempts {
        tokio::time::sleep(timing.exit_poll_interval()).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(?status, "child exited");
                return true;
            }
            Ok(None) => {}
            // Already reaped elsewhere.
            Err(_) => return true,
        }
    }
    false
}

fn send_sigterm(pid: u32) {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

fn drain_output<R>(id: Uuid, process: &'static str, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    tracing::debug!(emulator = %id, process, stream, "{}", text.trim_end());
                }
                Err(e) => {
                    tracing::debug!(emulator = %id, process, stream, ?e, "output drain failed");
                    break;
                }
            }
        }
    })
}
