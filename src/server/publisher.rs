//! Publish port.
//!
//! Publications flow through the external fan-out proxy: one raw topic frame
//! followed by one binary-packed payload frame. A dedicated thread drains a
//! channel so a slow or absent proxy never stalls request handling; failed
//! sends are logged and dropped, ordering within the connection is preserved.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::wire::frame::FrameWriter;
use crate::wire::proto::{encode_publication, Publication};

const QUEUE_DEPTH: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct PublisherHandle {
    tx: Sender<Publication>,
}

impl PublisherHandle {
    /// Enqueue a publication; never blocks the caller. A full queue means
    /// the proxy has been gone for a while, so the message is dropped.
    pub fn publish(&self, publication: Publication) {
        if self.tx.try_send(publication).is_err() {
            tracing::warn!("publication queue full, dropping frame");
        }
    }
}

pub fn spawn(
    proxy_addr: String,
    stop: Arc<AtomicBool>,
) -> (PublisherHandle, JoinHandle<()>) {
    let (tx, rx) = bounded(QUEUE_DEPTH);
    let handle = std::thread::Builder::new()
        .name("publisher".to_string())
        .spawn(move || run_loop(&proxy_addr, rx, &stop))
        .expect("spawn publisher thread");
    (PublisherHandle { tx }, handle)
}

fn run_loop(proxy_addr: &str, rx: Receiver<Publication>, stop: &AtomicBool) {
    let mut stream: Option<TcpStream> = None;

    loop {
        let publication = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(publication) => publication,
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        if stream.is_none() {
            stream = connect(proxy_addr);
        }
        let Some(current) = stream.as_mut() else {
            tracing::warn!(topic = publication.topic(), "proxy unreachable, dropping publication");
            continue;
        };

        if let Err(err) = send(current, &publication) {
            tracing::warn!(topic = publication.topic(), "publication failed: {err}");
            stream = None;
        }
    }
}

fn connect(proxy_addr: &str) -> Option<TcpStream> {
    let addr = match super::resolve(proxy_addr) {
        Ok(addr) => addr,
        Err(err) => {
            tracing::warn!(addr = proxy_addr, "proxy address unresolvable: {err}");
            return None;
        }
    };
    match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
        Ok(stream) => {
            let _ = stream.set_write_timeout(Some(CONNECT_TIMEOUT));
            tracing::debug!(addr = proxy_addr, "connected to proxy");
            Some(stream)
        }
        Err(err) => {
            tracing::warn!(addr = proxy_addr, "proxy connect failed: {err}");
            None
        }
    }
}

fn send(stream: &mut TcpStream, publication: &Publication) -> std::io::Result<()> {
    let payload = encode_publication(publication)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
    let mut writer = FrameWriter::new(stream);
    writer
        .write_frame(publication.topic().as_bytes())
        .map_err(io_from_frame)?;
    writer.write_frame(&payload).map_err(io_from_frame)?;
    Ok(())
}

fn io_from_frame(err: crate::wire::frame::FrameError) -> std::io::Error {
    match err {
        crate::wire::frame::FrameError::Io(err) => err,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}
