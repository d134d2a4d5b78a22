use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver};
use http::StatusCode;

use crate::client_request::{read_client_header, ClientError, ClientResponse, Request};
use crate::engine::{HttpCache, ServeError};
use crate::http_headers::{error_header, response_header};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_address: SocketAddr,
    /// Number of connections served concurrently.
    pub num_workers: usize,
    /// An idle keep-alive connection is closed after this duration.
    pub keep_alive_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8996)),
            num_workers: 20,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
        }
    }
}

/// Serves connections accepted on a single listening socket with a fixed number of worker threads.
pub struct Server {
    cache: HttpCache,
    keep_alive_timeout: Duration,
    running: Arc<AtomicBool>,
}

/// Returned by [`Server::bind`]: The server runs until [`ServerHandle::stop`] is called.
pub struct ServerHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    acceptor: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections, lets the workers finish the requests they are currently serving and
    /// releases the socket. Returns once all threads have terminated.
    pub fn stop(self) {
        info!("Stopping server on {}", self.local_addr);
        self.running.store(false, Ordering::SeqCst);
        self.join();
    }

    /// Blocks until the server has stopped.
    pub fn join(self) {
        if self.acceptor.join().is_err() {
            error!("Acceptor thread panicked");
        }
    }
}

impl Server {
    pub fn bind(settings: ServerSettings, cache: HttpCache) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(settings.listen_address)?;
        // The acceptor polls, so that it notices when the server is stopped.
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let server = Arc::new(Server {
            cache,
            keep_alive_timeout: settings.keep_alive_timeout,
            running: running.clone(),
        });
        let num_workers = settings.num_workers.max(1);
        let (job_tx, job_rx) = bounded::<TcpStream>(num_workers);

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let server = server.clone();
            let job_rx = job_rx.clone();
            let worker = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || server.work(job_rx))?;
            workers.push(worker);
        }
        drop(job_rx);

        let acceptor_running = running.clone();
        let acceptor = thread::Builder::new()
            .name("acceptor".to_owned())
            .spawn(move || {
                while acceptor_running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            debug!("Established connection with client {}", addr);
                            if let Err(e) = stream.set_nonblocking(false) {
                                warn!("Unable to configure connection to {}: {:?}", addr, e);
                                continue;
                            }
                            // Blocks while all workers are busy and the queue is full.
                            if job_tx.send(stream).is_err() {
                                error!("All workers have terminated");
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                        Err(e) => {
                            warn!("Unable to accept connection: {:?}", e);
                            thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                    }
                }
                // Closing the queue terminates each worker once it is done with its current connection.
                drop(job_tx);
                for worker in workers {
                    if worker.join().is_err() {
                        error!("Worker thread panicked");
                    }
                }
                drop(listener);
                info!("Server on {} has stopped", local_addr);
            })?;

        info!("Listening on {}", local_addr);
        Ok(ServerHandle { local_addr, running, acceptor })
    }

    fn work(&self, job_rx: Receiver<TcpStream>) {
        for stream in job_rx.iter() {
            self.serve_connection(stream);
        }
    }

    fn serve_connection(&self, mut stream: TcpStream) {
        if let Err(e) = stream.set_read_timeout(Some(self.keep_alive_timeout)) {
            warn!("Unable to set read timeout: {:?}", e);
            return;
        }
        let mut pending = Vec::new();
        loop {
            let request = match read_client_header(&mut stream, &mut pending) {
                Ok(ClientResponse::Request(request)) => request,
                Ok(ClientResponse::SocketClosed) => {
                    debug!("Socket closed by client");
                    break;
                }
                Err(ClientError::TimedOut) => {
                    debug!("Connection idle for too long, closing it");
                    break;
                }
                Err(ClientError::InvalidHeader) => {
                    info!("Received malformed request header");
                    let _ = stream.write_all(error_header(StatusCode::BAD_REQUEST).as_bytes());
                    break;
                }
                Err(ClientError::BufferSizeExceeded) => {
                    info!("Request header too large");
                    let header = error_header(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
                    let _ = stream.write_all(header.as_bytes());
                    break;
                }
                Err(ClientError::Other(kind)) => {
                    debug!("Unable to read request header: {:?}", kind);
                    break;
                }
            };
            let keep_alive = request.keep_alive && self.running.load(Ordering::SeqCst);
            match self.serve_request(&request, &mut stream, keep_alive) {
                Ok(true) if keep_alive => {}
                Ok(_) => break,
                Err(e) => {
                    debug!("Connection to client lost: {:?}", e);
                    break;
                }
            }
        }
    }

    /// Returns `Ok(true)` if the response was sent completely, so that the connection can be reused.
    fn serve_request(&self, request: &Request, stream: &mut TcpStream, keep_alive: bool) -> std::io::Result<bool> {
        let cache_request = request.cache_request();
        let response = match self.cache.serve(&cache_request) {
            Ok(response) => response,
            Err(e) => {
                let status = status_for_error(&e);
                info!("{} {} -> {} ({})", request.method, request.target, status.as_u16(), e);
                stream.write_all(error_header(status).as_bytes())?;
                return Ok(false);
            }
        };
        info!("{} {} -> {} [{:?}]", request.method, request.target, response.status.as_u16(), response.origin);
        stream.write_all(response_header(&response, keep_alive).as_bytes())?;
        for chunk in response.body {
            match chunk {
                Ok(chunk) => stream.write_all(&chunk)?,
                Err(e) => {
                    // The header has already been sent: All we can do is to close the connection.
                    warn!("Unable to send the complete payload of {}: {:?}", request.target, e);
                    return Ok(false);
                }
            }
        }
        stream.flush()?;
        Ok(true)
    }
}

fn status_for_error(error: &ServeError) -> StatusCode {
    match error {
        ServeError::UnsupportedMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
        ServeError::UnknownMirror(_) => StatusCode::NOT_FOUND,
        ServeError::NotAFile(_) => StatusCode::NOT_FOUND,
        ServeError::Upstream(_) => StatusCode::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror_fetch::FetchError;
    use http::Method;
    use std::path::PathBuf;

    #[test]
    fn test_status_for_error() {
        assert_eq!(status_for_error(&ServeError::UnsupportedMethod(Method::PUT)), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(status_for_error(&ServeError::UnknownMirror("x".to_owned())), StatusCode::NOT_FOUND);
        assert_eq!(status_for_error(&ServeError::NotAFile(PathBuf::from("/c/pkgs"))), StatusCode::NOT_FOUND);
        let upstream = ServeError::Upstream(FetchError::Disconnected);
        assert_eq!(status_for_error(&upstream), StatusCode::BAD_GATEWAY);
    }
}
