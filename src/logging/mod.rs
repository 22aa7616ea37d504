//! Log sink that moves `env_logger` output off the request path.
//!
//! Formatted records are pushed through an unbounded channel and appended to
//! the configured file by a single-threaded pingora service.

use std::{
    io::{self, Write},
    path::Path,
};

use async_trait::async_trait;
use env_logger::Builder;
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::config;

/// `Write` half handed to `env_logger`; every write becomes one channel message.
pub struct ChannelWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver,
            config,
        }
    }

    pub fn writer(&self) -> ChannelWriter {
        ChannelWriter {
            sender: self.sender.clone(),
        }
    }

    /// Install the global logger. `RUST_LOG` still overrides the info default.
    pub fn init_env_logger(&self) {
        Builder::new()
            .filter_level(LevelFilter::Info)
            .parse_default_env()
            .target(env_logger::Target::Pipe(Box::new(self.writer())))
            .init();
    }

    async fn open(path: &str) -> io::Result<BufWriter<File>> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        Ok(BufWriter::new(file))
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match Self::open(&self.config.path).await {
            Ok(file) => file,
            Err(e) => {
                // The global logger points at this sink, so stderr is the only way out.
                eprintln!("Failed to open log file '{}': {e}", self.config.path);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
                data = self.receiver.recv() => {
                    let Some(data) = data else { break };
                    if let Err(e) = file.write_all(&data).await {
                        eprintln!("Failed to write log file: {e}");
                    }
                }
            }
        }

        // Drain whatever was logged while shutting down.
        while let Ok(data) = self.receiver.try_recv() {
            let _ = file.write_all(&data).await;
        }
        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "log writer"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
