#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;

use qcon::allocator::PortAllocator;
use qcon::api::{self, AppState};
use qcon::config::{BootTiming, EmulatorSettings};
use qcon::platform::Platform;
use qcon::registry::EmulatorRegistry;

pub const SECRET: &str = "test-launch-secret";

/// Boot budgets small enough for tests: about a second per wait.
pub fn fast_timing() -> BootTiming {
    BootTiming {
        console_connect_attempts: 50,
        console_connect_interval_ms: 20,
        ready_attempts: 50,
        ready_interval_ms: 20,
        settle_ms: 0,
        exit_poll_attempts: 25,
        exit_poll_interval_ms: 20,
    }
}

/// A throwaway host layout: image root for every platform plus fake
/// emulator and runtime executables that record how they were started.
pub struct TestHost {
    pub dir: TempDir,
    pub settings: Arc<EmulatorSettings>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_timing(fast_timing())
    }

    pub fn with_timing(timing: BootTiming) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let images = root.join("images");
        for platform in Platform::ALL {
            let image_dir = images.join(platform.as_str()).join("qemu");
            std::fs::create_dir_all(&image_dir).unwrap();
            std::fs::write(image_dir.join("qemu_micro_flash.bin"), b"micro").unwrap();
            std::fs::write(image_dir.join("qemu_spi_flash.bin"), b"spi").unwrap();
        }
        let records = root.join("records");
        std::fs::create_dir_all(&records).unwrap();
        let records = records.display().to_string();

        // The monitor receives two lines on stdin; the second is the secret.
        let qemu = write_script(
            root,
            "fake-qemu",
            &format!(
                r#"read -r command
read -r secret
echo "$secret" > "{records}/qemu-monitor.$$"
printf '%s\n' "$@" > "{records}/qemu-args.$$.tmp"
mv "{records}/qemu-args.$$.tmp" "{records}/qemu-args.$$"
exec sleep 300"#
            ),
        );
        let pkjs = write_script(
            root,
            "fake-pkjs",
            &format!(
                r#"echo "${{TZ-unset}}" > "{records}/pkjs-tz.$$"
printf '%s\n' "$@" > "{records}/pkjs-args.$$.tmp"
mv "{records}/pkjs-args.$$.tmp" "{records}/pkjs-args.$$"
exec sleep 300"#
            ),
        );

        let settings = Arc::new(EmulatorSettings {
            qemu_bin: qemu,
            qemu_dir: root.to_path_buf(),
            image_root: images,
            pkjs_bin: pkjs,
            block_private_addresses: false,
            timing,
        });
        Self { dir, settings }
    }

    pub fn records_dir(&self) -> PathBuf {
        self.dir.path().join("records")
    }

    pub fn registry(&self, limit: usize) -> EmulatorRegistry {
        EmulatorRegistry::new(limit, PortAllocator::new(), Arc::clone(&self.settings))
    }

    pub fn app_state(&self, limit: usize) -> AppState {
        AppState::new(self.registry(limit), SECRET)
    }

    /// Serve the console of every fake emulator that starts, announcing
    /// readiness as soon as the supervisor connects.
    pub fn spawn_firmware(&self) -> JoinHandle<()> {
        let records = self.records_dir();
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            loop {
                for (pid, args) in read_records(&records, "qemu-args.") {
                    if seen.insert(pid) {
                        if let Some(port) = console_port(&args) {
                            tokio::spawn(serve_console(port));
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    }

    /// Pids and argument lists of every fake emulator started so far.
    pub fn emulators(&self) -> Vec<(i32, Vec<String>)> {
        read_records(&self.records_dir(), "qemu-args.")
    }

    pub fn runtimes(&self) -> Vec<(i32, Vec<String>)> {
        read_records(&self.records_dir(), "pkjs-args.")
    }

    /// Wait until `count` runtime records exist.
    pub async fn wait_for_runtimes(&self, count: usize) -> Vec<(i32, Vec<String>)> {
        for _ in 0..200 {
            let runtimes = self.runtimes();
            if runtimes.len() >= count {
                return runtimes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("runtime never started");
    }

    pub fn monitor_secret(&self, pid: i32) -> String {
        read_trimmed(&self.records_dir().join(format!("qemu-monitor.{pid}")))
    }

    pub fn runtime_tz(&self, pid: i32) -> String {
        read_trimmed(&self.records_dir().join(format!("pkjs-tz.{pid}")))
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn read_trimmed(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap().trim_end().to_string()
}

fn read_records(dir: &Path, prefix: &str) -> Vec<(i32, Vec<String>)> {
    let mut records = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return records;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(pid) = name.strip_prefix(prefix).and_then(|p| p.parse::<i32>().ok()) else {
            continue;
        };
        if let Ok(contents) = std::fs::read_to_string(entry.path()) {
            records.push((pid, contents.lines().map(str::to_string).collect()));
        }
    }
    records.sort_by_key(|(pid, _)| *pid);
    records
}

/// The console serial port is the TCP server without `nowait`.
pub fn console_port(args: &[String]) -> Option<u16> {
    args.iter().find_map(|arg| {
        arg.strip_prefix("tcp:127.0.0.1:")?
            .strip_suffix(",server")?
            .parse()
            .ok()
    })
}

/// Value following `flag` in an argument list.
pub fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).map(String::as_str)
}

async fn serve_console(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (mut stream, _) = listener.accept().await.unwrap();
    stream
        .write_all(b"PebbleOS booting\r\n<Launcher>\r\nReady for communication\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
}

pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    addr
}

pub async fn start_api(state: AppState) -> SocketAddr {
    start_server(api::router(state)).await
}

/// POST a launch form with the right secret.
pub async fn launch(
    client: &reqwest::Client,
    addr: SocketAddr,
    form: &[(&str, &str)],
) -> reqwest::Response {
    client
        .post(format!("http://{}/qemu/launch", addr))
        .header("authorization", SECRET)
        .form(form)
        .send()
        .await
        .unwrap()
}

/// Whether a process with `pid` still exists.
pub fn process_exists(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// What an internal echo endpoint observed.
pub struct EchoServer {
    /// Subprotocol the relay requested, if any.
    pub subprotocol: oneshot::Receiver<Option<String>>,
    /// Fires when the relay's connection ends.
    pub closed: oneshot::Receiver<()>,
    pub handle: JoinHandle<()>,
}

/// WebSocket server on `port` that echoes data frames back. With
/// `close_after` set it closes the connection after that many frames.
pub async fn spawn_echo_server(port: u16, close_after: Option<usize>) -> EchoServer {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (protocol_tx, subprotocol) = oneshot::channel();
    let (closed_tx, closed) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, mut resp: Response| {
            let requested = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(protocol) = &requested {
                resp.headers_mut()
                    .insert("sec-websocket-protocol", HeaderValue::from_str(protocol).unwrap());
            }
            let _ = protocol_tx.send(requested);
            Ok::<_, ErrorResponse>(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        let mut echoed = 0;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
            if msg.is_binary() || msg.is_text() {
                if ws.send(msg).await.is_err() {
                    break;
                }
                echoed += 1;
                if close_after == Some(echoed) {
                    let _ = ws.close(None).await;
                    break;
                }
            }
        }
        let _ = closed_tx.send(());
    });
    EchoServer {
        subprotocol,
        closed,
        handle,
    }
}
