use anyhow::{Context, Result};
use keel::{CommandQueue, Housekeeping, ResponseOutput, ScratchOutput, SliceSource};
use lazy_static::lazy_static;
use std::{env, os::unix::io::RawFd, path::PathBuf, sync::Mutex, time::Duration};
use testjig::{Jig, JigConfig};

struct SerialEmulator {
    master: RawFd,
    slave: RawFd,
}

impl SerialEmulator {
    fn new() -> Result<Self> {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        use nix::sys::termios::*;

        let ptys = nix::pty::openpty(None, &None::<Termios>).context("Could not allocate pty")?;
        let mut termios = tcgetattr(ptys.slave).context("Could not read pty attributes")?;
        cfmakeraw(&mut termios);
        tcsetattr(ptys.slave, SetArg::TCSANOW, &termios).context("Could not set raw mode")?;
        fcntl(ptys.master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .context("Could not make pty non-blocking")?;

        Ok(SerialEmulator {
            master: ptys.master,
            slave: ptys.slave,
        })
    }

    fn ttyname(&self) -> Result<PathBuf> {
        nix::unistd::ttyname(self.slave).context("Could not get TTY name")
    }

    fn master(&self) -> RawFd {
        self.master
    }
}

impl Drop for SerialEmulator {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.master);
        let _ = nix::unistd::close(self.slave);
    }
}

static TRANSPORT_OUTPUT_MUTEX: Mutex<Option<RawFd>> = Mutex::new(None);

/// Writes each response line to the pty
#[derive(Debug, Default)]
struct PtyOutput;

impl ResponseOutput for PtyOutput {
    type Output = ScratchOutput<256>;
    fn output(&self, f: impl FnOnce(&mut Self::Output)) {
        let Ok(fd) = TRANSPORT_OUTPUT_MUTEX.lock() else {
            return;
        };
        if let Some(fd) = fd.as_ref() {
            let mut scratch = ScratchOutput::new();
            f(&mut scratch);
            let mut line = scratch.result().to_vec();
            line.push(b'\n');
            match nix::unistd::write(*fd, &line) {
                Ok(n) if n == line.len() => {}
                Ok(n) => log::warn!("short write, {} of {} bytes", n, line.len()),
                Err(e) => log::warn!("write failed: {}", e),
            }
        }
    }
}

static OUTPUT: PtyOutput = PtyOutput;

/// Wall clock time since start-up
struct WallClock;

impl Housekeeping for WallClock {
    fn now_ms(&self) -> u64 {
        lazy_static! {
            static ref BEGIN: std::time::Instant = std::time::Instant::now();
        }
        BEGIN.elapsed().as_millis() as u64
    }
}

fn load_config() -> Result<JigConfig> {
    match env::var("KEEL_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Could not read config {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path))
        }
        Err(_) => Ok(JigConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let config = load_config()?;
    let replay = match env::var("KEEL_REPLAY") {
        Ok(path) => Some(std::fs::read(&path).with_context(|| format!("Could not read {}", path))?),
        Err(_) => None,
    };

    let serial = SerialEmulator::new()?;
    *TRANSPORT_OUTPUT_MUTEX
        .lock()
        .map_err(|_| anyhow::anyhow!("output lock poisoned"))? = Some(serial.master());
    println!("{}", serial.ttyname()?.display());
    log::info!("serving {:?}", config.machine.mechanism);

    let mut queue = CommandQueue::new();
    let mut jig = Jig::new(&config, WallClock, &OUTPUT, &mut queue);

    let mut source = replay.as_deref().map(SliceSource::new);
    if source.is_some() {
        jig.start_replay();
    }

    let mut recv = [0u8; 128];
    let mut rcvbuf: Vec<u8> = Vec::new();
    loop {
        match nix::unistd::read(serial.master(), &mut recv) {
            Err(nix::errno::Errno::EWOULDBLOCK) | Err(nix::errno::Errno::EIO) => {}
            Err(e) => return Err(e).context("read failed"),
            Ok(n) => rcvbuf.extend(&recv[..n]),
        };
        let taken = jig.feed(&rcvbuf);
        rcvbuf.drain(..taken);

        let mut busy = jig.poll();
        if let Some(src) = source.as_mut() {
            if jig.poll_replay(src) {
                busy = true;
            } else {
                log::info!("replay finished");
                source = None;
            }
        }
        if !busy {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
