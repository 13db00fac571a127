//! A module which contains the socket plumbing shared by every role: TCP
//! request/response exchanges, the parallel fan-out used by the proposer, and
//! UDP sockets for the learner side.
//!
//! Every blocking call carries a timeout, so the role loops can watch their
//! running flag instead of parking forever.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use net2::{TcpBuilder, UdpBuilder};
use serde::Serialize;

use crate::message::Address;
use crate::Result;

/// A read shorter than this chunk marks the end of an unframed message.
const RECV_CHUNK: usize = 1024;

/// Granularity of interruptible sleeps and idle accept polling.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drains one unframed message: reads until the peer closes or a short read.
pub fn recv_all(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; RECV_CHUNK];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if n < RECV_CHUNK {
            break;
        }
    }
    Ok(buffer)
}

fn resolve(target: &Address) -> Result<std::net::SocketAddr> {
    (target.host.as_str(), target.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("cannot resolve {}", target).into())
}

/// One request/response exchange over a short-lived connection: connect,
/// send, read the reply, close. Connect refused and timeouts both surface as
/// errors the caller counts as a non-reply.
pub fn request(target: &Address, payload: &str, timeout: Duration) -> Result<String> {
    let mut stream = TcpStream::connect_timeout(&resolve(target)?, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(payload.as_bytes())?;
    stream.shutdown(Shutdown::Write)?;
    let reply = recv_all(&mut stream)?;
    if reply.is_empty() {
        return Err(format!("empty reply from {}", target).into());
    }
    Ok(String::from_utf8(reply)?)
}

/// Sends the same payload to every target in parallel and collects whatever
/// replies arrive before the overall deadline. Slot `i` holds target `i`'s
/// reply, or `None` for peers that never answered.
pub fn broadcast(targets: &[Address], payload: &str, timeout: Duration) -> Vec<Option<String>> {
    let (tx, rx) = mpsc::channel();
    for (index, target) in targets.iter().cloned().enumerate() {
        let tx = tx.clone();
        let payload = payload.to_string();
        thread::spawn(move || {
            let reply = match request(&target, &payload, timeout) {
                Ok(reply) => Some(reply),
                Err(e) => {
                    debug!("no reply from {}: {}", target, e);
                    None
                }
            };
            let _ = tx.send((index, reply));
        });
    }
    drop(tx);

    let mut replies: Vec<Option<String>> = vec![None; targets.len()];
    let deadline = Instant::now() + timeout;
    let mut outstanding = targets.len();
    while outstanding > 0 {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) => remaining,
            None => break,
        };
        match rx.recv_timeout(remaining) {
            Ok((index, reply)) => {
                replies[index] = reply;
                outstanding -= 1;
            }
            Err(_) => break,
        }
    }
    replies
}

/// A listening socket with SO_REUSEADDR, non-blocking so the owning loop can
/// poll its running flag between accepts.
pub fn tcp_listener(address: &Address, backlog: i32) -> Result<TcpListener> {
    let listener = TcpBuilder::new_v4()?
        .reuse_address(true)?
        .bind((address.host.as_str(), address.port))?
        .listen(backlog)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Waits for the next inbound connection until the idle window elapses or the
/// running flag is cleared. Accepted sockets are switched back to blocking;
/// the handler sets its own timeouts.
pub fn accept_with_timeout(
    listener: &TcpListener,
    idle: Duration,
    running: &AtomicBool,
) -> Option<TcpStream> {
    let deadline = Instant::now() + idle;
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("cannot configure accepted socket: {}", e);
                    return None;
                }
                return Some(stream);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                return None;
            }
        }
    }
    None
}

/// A bound UDP socket with SO_REUSEADDR and the configured receive idle
/// timeout.
pub fn udp_listener(address: &Address, read_timeout: Duration) -> Result<UdpSocket> {
    let socket = UdpBuilder::new_v4()?
        .reuse_address(true)?
        .bind((address.host.as_str(), address.port))?;
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket)
}

/// Fire-and-forget JSON datagrams; losses are tolerated by the protocol.
pub fn udp_send<T: Serialize>(targets: &[Address], message: &T) {
    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => socket,
        Err(e) => {
            warn!("cannot open udp sender: {}", e);
            return;
        }
    };
    let encoded = match serde_json::to_string(message) {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!("cannot encode udp datagram: {}", e);
            return;
        }
    };
    for target in targets {
        if let Err(e) = socket.send_to(encoded.as_bytes(), (target.host.as_str(), target.port)) {
            warn!("udp send to {} failed: {}", target, e);
        }
    }
}

/// Sleeps in small slices so shutdown is not held up by a long delay.
/// Returns false when the running flag was cleared before the delay elapsed.
pub fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    while running.load(Ordering::SeqCst) {
        match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) => thread::sleep(remaining.min(POLL_INTERVAL)),
            None => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;

    fn echo_server(port: u16) -> Address {
        let address = Address::new("127.0.0.1", port, 0);
        let running = Arc::new(AtomicBool::new(true));
        let listener = tcp_listener(&address, 4).unwrap();
        thread::spawn(move || {
            if let Some(mut stream) = accept_with_timeout(&listener, Duration::from_secs(5), &running)
            {
                let payload = recv_all(&mut stream).unwrap();
                stream.write_all(&payload).unwrap();
            }
        });
        address
    }

    #[test]
    fn request_round_trips_through_a_socket() {
        let address = echo_server(18090);
        let reply = request(&address, "hello there", Duration::from_secs(3)).unwrap();
        assert_eq!(reply, "hello there");
    }

    #[test]
    fn request_longer_than_one_chunk_survives_the_drain_loop() {
        let address = echo_server(18091);
        let payload = "x".repeat(RECV_CHUNK * 3 + 17);
        let reply = request(&address, &payload, Duration::from_secs(3)).unwrap();
        assert_eq!(reply, payload);
    }

    #[test]
    fn broadcast_reports_unreachable_peers_as_none() {
        let up = echo_server(18092);
        let down = Address::new("127.0.0.1", 18093, 1);
        let replies = broadcast(&[up, down], "ping", Duration::from_millis(800));
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].as_deref(), Some("ping"));
        assert_eq!(replies[1], None);
    }

    #[test]
    fn sleep_while_running_stops_early() {
        let running = AtomicBool::new(false);
        let started = Instant::now();
        assert!(!sleep_while_running(&running, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
