//! Serial (USB/RS232) ELM327 link

use super::{SerialConfig, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::error::TransportError;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Serial transport backed by `tokio-serial`
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<WriteHalf<SerialStream>>,
    reader_task: Option<JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            reader_task: None,
        }
    }

    pub async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if self.writer.is_some() {
            self.close().await?;
        }

        info!(
            "Opening serial adapter {} at {} baud",
            self.config.path, self.config.baud_rate
        );
        let stream = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| map_serial_error(&self.config.path, e))?;

        let (mut reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let path = self.config.path.clone();

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!("Serial adapter {} reached EOF", path);
                        let _ = tx.send(TransportEvent::Closed).await;
                        break;
                    }
                    Ok(n) => {
                        if tx.send(TransportEvent::Data(buf[..n].to_vec())).await.is_err() {
                            // receiver dropped: driver unsubscribed
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Serial read on {} failed: {}", path, e);
                        let _ = tx.send(TransportEvent::Error(e.into())).await;
                        let _ = tx.send(TransportEvent::Closed).await;
                        break;
                    }
                }
            }
        });

        self.writer = Some(writer);
        self.reader_task = Some(task);
        Ok(rx)
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            info!("Closing serial adapter {}", self.config.path);
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

fn map_serial_error(path: &str, err: tokio_serial::Error) -> TransportError {
    match err.kind {
        tokio_serial::ErrorKind::NoDevice => TransportError::DeviceNotFound(path.to_string()),
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::DeviceNotFound(path.to_string())
        }
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::TimedOut) => {
            TransportError::ConnectTimeout(0)
        }
        _ => TransportError::ConnectFailed(format!("{}: {}", path, err.description)),
    }
}
