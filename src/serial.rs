use crate::asyncfile::{baud_rate, AsyncFile};
use crate::notify::{Event, Notifier};
use crate::pipeline::PipelineTask;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const CONTROL_PREFIXES: [&str; 3] = ["CONFIG:", "CMD:", "WAITING"];
pub const STATUS_PREFIX: &str = "STATUS:";

/// how long the reader holds the port before letting a command in
const READ_SLICE: Duration = Duration::from_millis(100);
const CONFIG_DELAY_PAUSE: Duration = Duration::from_millis(100);
const CONFIG_ENTRY_PAUSE: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    pub fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum LineKind<'a> {
    Empty,
    /// echo of our own traffic or controller chatter
    Control(&'a str),
    Status(&'a str),
    Data(&'a str),
}

pub fn classify_line(line: &str) -> LineKind {
    let line = line.trim();
    if line.is_empty() {
        LineKind::Empty
    } else if line.starts_with(STATUS_PREFIX) {
        LineKind::Status(line)
    } else if CONTROL_PREFIXES.iter().any(|p| line.starts_with(p)) {
        LineKind::Control(line)
    } else {
        LineKind::Data(line)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Start,
    Stop,
}

impl Command {
    pub fn text(&self) -> &'static str {
        match self {
            Command::Start => "CMD:START",
            Command::Stop => "CMD:STOP",
        }
    }

    /// acknowledgement the controller sends back
    pub fn expected(&self) -> &'static str {
        match self {
            Command::Start => "STATUS:RUNNING",
            Command::Stop => "STATUS:STOPPED",
        }
    }
}

pub struct Link {
    device: AsyncFile,
}

impl Link {
    async fn write_line(&mut self, text: &str) -> std::io::Result<()> {
        self.device.write_all(format!("{}\n", text).as_bytes()).await?;
        self.device.flush().await
    }
}

pub struct Transport {
    pub name: String,
    pub device_path: Option<String>,
    pub baud: u32,
    pub command_timeout: Duration,
    pub reconnect_delay: Duration,
    pub link: Mutex<Option<Link>>,
    pub transmitter: std::sync::Mutex<Sender<PipelineTask>>,
    pub notifier: Notifier,
}

impl Transport {
    pub fn new(
        name: &str,
        device_path: Option<String>,
        baud: u32,
        command_timeout: Duration,
        reconnect_delay: Duration,
        transmitter: Sender<PipelineTask>,
        notifier: Notifier,
    ) -> Self {
        Self {
            name: name.to_string(),
            device_path,
            baud,
            command_timeout,
            reconnect_delay,
            link: Mutex::new(None),
            transmitter: std::sync::Mutex::new(transmitter),
            notifier,
        }
    }

    fn forward(&self, line: &str) {
        match self.transmitter.lock() {
            Ok(tx) => {
                if let Err(e) = tx.send(PipelineTask::Line(line.to_string())) {
                    error!("{}: cannot pass line to pipeline: {}", self.name, e);
                }
            }
            Err(e) => error!("{}: transmitter lock poisoned: {}", self.name, e),
        }
    }

    fn route(&self, line: &str) {
        match classify_line(line) {
            LineKind::Empty => (),
            LineKind::Control(l) | LineKind::Status(l) => debug!("{}: control: {}", self.name, l),
            LineKind::Data(l) => self.forward(l),
        }
    }

    fn set_status(&self, connected: bool, message: String) {
        self.notifier.broadcast(Event::Status { connected, message });
    }

    /// Sends a command and waits for its acknowledgement.
    /// Measurement lines arriving meanwhile still reach the pipeline in order.
    pub async fn command(&self, command: Command) -> CommandResult {
        let mut guard = self.link.lock().await;
        let link = match guard.as_mut() {
            Some(link) => link,
            None => return CommandResult::failed("serial port not connected"),
        };

        info!("{}: sending {}", self.name, command.text());
        if let Err(e) = link.write_line(command.text()).await {
            error!("{}: write error: {:?}", self.name, e);
            return CommandResult::failed(&format!("write error: {}", e));
        }

        let deadline = Instant::now() + self.command_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, link.device.read_line()).await {
                Err(_) => {
                    warn!(
                        "{}: no {} within {:?}",
                        self.name,
                        command.expected(),
                        self.command_timeout
                    );
                    return CommandResult::failed(&format!(
                        "timeout waiting for {}",
                        command.expected()
                    ));
                }
                Ok(Ok(line)) => match classify_line(&line) {
                    LineKind::Status(status) if status.contains(command.expected()) => {
                        info!("{}: {} acknowledged: {}", self.name, command.text(), status);
                        return CommandResult::ok(status);
                    }
                    LineKind::Data(data) => self.forward(data),
                    other => debug!("{}: ignoring while waiting: {:?}", self.name, other),
                },
                Ok(Err(e)) => {
                    error!("{}: read error: {:?}", self.name, e);
                    return CommandResult::failed(&format!("read error: {}", e));
                }
            }
        }
    }

    /// Sends the measurement layout to the controller
    pub async fn push_config(&self, lines: &[String]) -> CommandResult {
        let mut guard = self.link.lock().await;
        let link = match guard.as_mut() {
            Some(link) => link,
            None => return CommandResult::failed("serial port not connected"),
        };

        for (i, line) in lines.iter().enumerate() {
            if let Err(e) = link.write_line(line).await {
                error!("{}: config push failed at {:?}: {:?}", self.name, line, e);
                return CommandResult::failed(&format!("write error: {}", e));
            }
            debug!("{}: sent {}", self.name, line);
            //give the controller time to digest each line
            sleep(if i == 0 {
                CONFIG_DELAY_PAUSE
            } else {
                CONFIG_ENTRY_PAUSE
            })
            .await;
        }
        info!("{}: configuration sent ({} lines)", self.name, lines.len());
        CommandResult::ok(&format!("sent {} config lines", lines.len()))
    }

    async fn read_loop(&self, worker_cancel_flag: &AtomicBool) {
        loop {
            if worker_cancel_flag.load(Ordering::SeqCst) {
                return;
            }

            let mut guard = self.link.lock().await;
            let link = match guard.as_mut() {
                Some(link) => link,
                None => return,
            };
            match timeout(READ_SLICE, link.device.read_line()).await {
                Err(_) => continue,
                Ok(Ok(line)) => self.route(&line),
                Ok(Err(e)) => {
                    error!("{}: file read error: {}", self.name, e);
                    return;
                }
            }
        }
    }

    async fn pause(&self, worker_cancel_flag: &AtomicBool) {
        let until = Instant::now() + self.reconnect_delay;
        while Instant::now() < until && !worker_cancel_flag.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn worker(&self, worker_cancel_flag: Arc<AtomicBool>) -> Result<()> {
        info!("{}: Starting task", self.name);
        let device_path = match &self.device_path {
            Some(path) => path.clone(),
            None => {
                warn!("{}: no serial device configured, transport disabled", self.name);
                return Ok(());
            }
        };

        loop {
            if worker_cancel_flag.load(Ordering::SeqCst) {
                break;
            }

            info!("{}: opening device: {:?}", self.name, device_path);
            match AsyncFile::open(&device_path) {
                Ok(device) => {
                    match baud_rate(self.baud) {
                        Some(speed) => {
                            if let Err(e) = device.setup_tty(speed) {
                                warn!(
                                    "{}: cannot set raw mode at {} baud: {:?}",
                                    self.name, self.baud, e
                                );
                            }
                        }
                        None => warn!("{}: unsupported baud rate {}", self.name, self.baud),
                    }
                    *self.link.lock().await = Some(Link { device });
                    info!("{}: device opened", self.name);
                    self.set_status(true, format!("connected to {}", device_path));

                    self.read_loop(&worker_cancel_flag).await;

                    *self.link.lock().await = None;
                    if worker_cancel_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    self.set_status(false, format!("lost connection to {}", device_path));
                }
                Err(e) => {
                    error!("{}: error opening device: {:?}", self.name, e);
                    self.set_status(false, format!("cannot open {}: {}", device_path, e));
                }
            }
            self.pause(&worker_cancel_flag).await;
        }

        info!("{}: Stopping task", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use std::io::Write;
    use std::sync::mpsc;

    #[test]
    fn line_classification() {
        assert_eq!(classify_line("  "), LineKind::Empty);
        assert_eq!(classify_line("WAITING for config"), LineKind::Control("WAITING for config"));
        assert_eq!(classify_line("CONFIG:END"), LineKind::Control("CONFIG:END"));
        assert_eq!(classify_line("CMD:START\r"), LineKind::Control("CMD:START"));
        assert_eq!(classify_line("STATUS:RUNNING"), LineKind::Status("STATUS:RUNNING"));
        assert_eq!(
            classify_line(" 2025-06-01 12:00:00,1,2\r\n"),
            LineKind::Data("2025-06-01 12:00:00,1,2")
        );
    }

    #[test]
    fn command_tokens() {
        assert_eq!(Command::Start.text(), "CMD:START");
        assert_eq!(Command::Stop.expected(), "STATUS:STOPPED");
    }

    fn transport(tx: Sender<PipelineTask>) -> Transport {
        Transport::new(
            "serial",
            None,
            9600,
            Duration::from_millis(200),
            Duration::from_millis(10),
            tx,
            Notifier::new(4),
        )
    }

    #[tokio::test]
    async fn command_without_port_fails() {
        let (tx, _rx) = mpsc::channel();
        let t = transport(tx);
        let result = t.command(Command::Start).await;
        assert!(!result.success);
        assert_eq!(result.message, "serial port not connected");
        assert!(!t.push_config(&["CONFIG:END".to_string()]).await.success);
    }

    #[tokio::test]
    async fn worker_without_device_returns() {
        let (tx, _rx) = mpsc::channel();
        let t = transport(tx);
        assert!(t.worker(Arc::new(AtomicBool::new(false))).await.is_ok());
    }

    #[test]
    fn data_lines_reach_the_pipeline() {
        let (tx, rx) = mpsc::channel();
        let t = transport(tx);
        t.route("STATUS:RUNNING");
        t.route("");
        t.route("2025-06-01 12:00:00,1,2");
        match rx.try_recv() {
            Ok(PipelineTask::Line(line)) => assert_eq!(line, "2025-06-01 12:00:00,1,2"),
            _ => panic!("expected a data line"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn silent_device_does_not_hold_up_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ttyFAKE");
        mkfifo(&path, Mode::S_IRWXU).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut t = transport(tx);
        t.device_path = Some(path.to_string_lossy().into_owned());
        let t = Arc::new(t);
        let flag = Arc::new(AtomicBool::new(false));

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let worker = runtime.spawn({
            let t = t.clone();
            let flag = flag.clone();
            async move { t.worker(flag).await.is_ok() }
        });

        //blocks until the worker holds the read side
        let mut controller = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        controller.write_all(b"STATUS:RUNNING\n2025-06-01 12:00:00,1,2\n").unwrap();
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(PipelineTask::Line(line)) => assert_eq!(line, "2025-06-01 12:00:00,1,2"),
            _ => panic!("expected a data line"),
        }

        //now silent
        std::thread::sleep(Duration::from_millis(300));
        flag.store(true, Ordering::SeqCst);
        assert!(runtime.block_on(worker).unwrap());

        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            drop(runtime);
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
