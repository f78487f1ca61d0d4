//! Full-duplex byte relay between two connected streams.
//!
//! Two pumps run as independent tasks, each with its own buffer and a flush
//! after every write. The first pump to stop (EOF, I/O error or an explicit
//! `stop`) signals the other; once both have returned every half of both
//! streams has been dropped, which closes the sockets.

use crate::config::DEFAULT_RELAY_BUFFER_SIZE;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Direction of a pump, named from the perspective of the first stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// first stream in, second stream out
    Forward,
    /// second stream in, first stream out
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("OUTPUT_PIPE"),
            Direction::Backward => f.write_str("INPUT_PIPE"),
        }
    }
}

/// Why a pump stopped
#[derive(Debug)]
pub enum StopReason {
    Eof,
    Error(io::Error),
    /// told to stop by its sibling or the handle
    Stopped,
}

/// PumpStopped is handed to every stop listener when a pump returns
#[derive(Debug)]
pub struct PumpStopped<'a> {
    pub pipe: &'a str,
    pub direction: Direction,
    pub reason: &'a StopReason,
    pub bytes: u64,
}

pub type StopListener = Box<dyn Fn(&PumpStopped<'_>) + Send + Sync>;

/// RelayStats summarizes a finished relay
#[derive(Debug, Default)]
pub struct RelayStats {
    pub forward_bytes: u64,
    pub backward_bytes: u64,
    /// first I/O error either pump hit, if any
    pub error: Option<io::Error>,
}

/// RelayPipe binds two connected streams; `start` launches the pumps
pub struct RelayPipe<A, B> {
    first: A,
    second: B,
    name: String,
    buffer_size: usize,
    listeners: Vec<StopListener>,
}

impl<A, B> RelayPipe<A, B>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            name: "relay".to_string(),
            buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            listeners: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// add_listener registers a callback run as each pump stops
    pub fn add_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&PumpStopped<'_>) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
        self
    }

    /// start spawns both pumps
    pub fn start(self) -> RelayHandle {
        let (first_read, first_write) = split(self.first);
        let (second_read, second_write) = split(self.second);

        let (stop_tx, _) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let shared = Arc::new(Shared {
            name: self.name,
            listeners: self.listeners,
        });

        debug!("Pipe[{}] started", shared.name);

        let forward = tokio::spawn(pump(
            Direction::Forward,
            first_read,
            second_write,
            self.buffer_size,
            Arc::clone(&stop_tx),
            Arc::clone(&shared),
        ));
        let backward = tokio::spawn(pump(
            Direction::Backward,
            second_read,
            first_write,
            self.buffer_size,
            Arc::clone(&stop_tx),
            Arc::clone(&shared),
        ));

        RelayHandle {
            stop_tx,
            forward,
            backward,
        }
    }
}

struct Shared {
    name: String,
    listeners: Vec<StopListener>,
}

/// RelayHandle observes and controls a running relay
pub struct RelayHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    forward: JoinHandle<PumpOutcome>,
    backward: JoinHandle<PumpOutcome>,
}

impl RelayHandle {
    /// is_running is false as soon as either pump has stopped
    pub fn is_running(&self) -> bool {
        !*self.stop_tx.borrow()
    }

    /// stop asks both pumps to finish
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// wait blocks until both pumps have returned and both streams are closed
    pub async fn wait(self) -> RelayStats {
        let mut stats = RelayStats::default();

        for (direction, handle) in [
            (Direction::Forward, self.forward),
            (Direction::Backward, self.backward),
        ] {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => PumpOutcome {
                    bytes: 0,
                    reason: StopReason::Error(io::Error::other(e)),
                },
            };

            match direction {
                Direction::Forward => stats.forward_bytes = outcome.bytes,
                Direction::Backward => stats.backward_bytes = outcome.bytes,
            }
            if let StopReason::Error(e) = outcome.reason {
                stats.error.get_or_insert(e);
            }
        }

        stats
    }
}

struct PumpOutcome {
    bytes: u64,
    reason: StopReason,
}

async fn pump<R, W>(
    direction: Direction,
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    buffer_size: usize,
    stop_tx: Arc<watch::Sender<bool>>,
    shared: Arc<Shared>,
) -> PumpOutcome
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut stop_rx = stop_tx.subscribe();
    let mut buffer = vec![0u8; buffer_size];
    let mut bytes = 0u64;

    let reason = loop {
        tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => break StopReason::Stopped,
            transferred = transfer(&mut reader, &mut writer, &mut buffer) => match transferred {
                Ok(0) => break StopReason::Eof,
                Ok(n) => bytes += n as u64,
                Err(e) => break StopReason::Error(e),
            },
        }
    };

    // wake the sibling pump, then let the peer see EOF
    stop_tx.send_replace(true);
    let _ = writer.shutdown().await;

    trace!("Pipe[{}] {} stopped: {:?}", shared.name, direction, reason);
    let event = PumpStopped {
        pipe: &shared.name,
        direction,
        reason: &reason,
        bytes,
    };
    for listener in &shared.listeners {
        listener(&event);
    }

    PumpOutcome { bytes, reason }
}

/// transfer moves one buffer's worth of data; 0 means the source hit EOF
async fn transfer<R, W>(
    reader: &mut ReadHalf<R>,
    writer: &mut WriteHalf<W>,
    buffer: &mut [u8],
) -> io::Result<usize>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let n = reader.read(buffer).await?;
    if n > 0 {
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
    }
    Ok(n)
}
