//! Per-client request handling and the round-robin send phase.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{HEADER_SIZE, MAX_FRAME_SIZE, MAX_IDLE_SECS};
use crate::net::client::{Client, ClientTable};
use crate::ring::RingBuffer;

/// What the caller should do with a client after a readiness pass.
pub enum RequestOutcome {
    Kept,
    Evicted,
}

/// Request phase: applied once per client, in index order, every driver
/// iteration. `readable`/`errored` report whether this client's socket was
/// in the readiness read/error sets.
pub fn handle_client_request(
    client: &mut Client,
    readable: bool,
    errored: bool,
    now: Instant,
) -> RequestOutcome {
    if errored {
        info!("client {} socket error, evicting", client.peer);
        return RequestOutcome::Evicted;
    }

    let idle = now.saturating_duration_since(client.last_request);
    if idle >= Duration::from_secs(MAX_IDLE_SECS) {
        info!("client {} idle for {:?}, evicting", client.peer, idle);
        return RequestOutcome::Evicted;
    }

    if !readable {
        return RequestOutcome::Kept;
    }

    let mut header = [0u8; HEADER_SIZE];
    match client.socket.read(&mut header) {
        Ok(0) => {
            info!("client {} disconnected", client.peer);
            RequestOutcome::Evicted
        }
        Ok(n) if n < HEADER_SIZE => {
            info!(
                "client {} sent a short request ({} of {} bytes), evicting",
                client.peer, n, HEADER_SIZE
            );
            RequestOutcome::Evicted
        }
        Ok(_) => {
            let requested = u32::from_be_bytes(header);
            debug!("client {} requested {} bytes", client.peer, requested);
            if client.accept_request(requested, now) {
                RequestOutcome::Kept
            } else {
                warn!(
                    "client {} entropy_requested counter overflowed, evicting",
                    client.peer
                );
                RequestOutcome::Evicted
            }
        }
        Err(e)
            if e.kind() == ErrorKind::WouldBlock
                || e.raw_os_error() == Some(libc::EINPROGRESS) =>
        {
            RequestOutcome::Kept
        }
        Err(e) => {
            info!("client {} read error: {e}, evicting", client.peer);
            RequestOutcome::Evicted
        }
    }
}

/// Round-robin send phase: visits every client at most once per call,
/// starting at the table's current cursor, pulling bytes out of `pool` and
/// writing length-prefixed frames. Sockets not writable this iteration
/// (per `writable`) are skipped and re-checked next pass.
pub fn send_entropy(table: &mut ClientTable, pool: &mut RingBuffer, writable: impl Fn(usize) -> bool) {
    let n = table.len();
    if n == 0 {
        return;
    }

    let mut send_buf = [0u8; MAX_FRAME_SIZE];
    let mut checked = 0;

    while checked < n {
        checked += 1;
        let index = table.cursor();

        // Matches the original dispatcher's early skip exactly: a client
        // with a continuation in progress (header or payload pending)
        // still gets skipped here if the pool is currently empty and it
        // has no keep-alive queued, because write_size is about to be
        // re-read from the pool below regardless of entropy_pending.
        if !table.get(index).keepalive_pending && pool.is_empty() {
            table.advance_cursor();
            continue;
        }

        let (header_size, mut write_size) = {
            let client = table.get(index);
            if client.header_bytes_pending > 0 {
                (client.header_bytes_pending, client.entropy_pending)
            } else if client.entropy_pending > 0 {
                (0, client.entropy_pending)
            } else {
                let write_size = client.entropy_requested;
                if write_size == 0 && !client.keepalive_pending {
                    table.advance_cursor();
                    continue;
                }
                (HEADER_SIZE as u32, write_size)
            }
        };

        if !writable(index) {
            table.advance_cursor();
            continue;
        }

        if write_size + header_size > MAX_FRAME_SIZE as u32 {
            write_size = MAX_FRAME_SIZE as u32 - header_size;
        }
        write_size = write_size.min(pool.len() as u32);

        let header_size = header_size as usize;
        let write_size_usize = write_size as usize;
        let read_n = pool.read(&mut send_buf[header_size..header_size + write_size_usize]);
        debug_assert_eq!(read_n, write_size_usize);

        if header_size > 0 {
            let client = table.get(index);
            let full_header = if client.header_bytes_pending == 0 {
                write_size.to_be_bytes()
            } else {
                client.entropy_pending.to_be_bytes()
            };
            let offset = HEADER_SIZE - header_size;
            send_buf[..header_size].copy_from_slice(&full_header[offset..]);
        }

        let frame_len = header_size + write_size_usize;
        match table.get_mut(index).socket.write(&send_buf[..frame_len]) {
            Ok(sent) => {
                let client = table.get_mut(index);
                client.keepalive_pending = false;
                client.header_bytes_pending = 0;

                let entropy_sent;
                if sent < header_size {
                    entropy_sent = 0;
                    client.header_bytes_pending = (header_size - sent) as u32;

                    if client.entropy_pending > 0 {
                        // continuation of a previous frame; leave it.
                    } else if write_size == 0 {
                        client.keepalive_pending = true;
                    } else {
                        client.entropy_requested -= write_size;
                        client.entropy_pending = write_size;
                    }
                } else if header_size == HEADER_SIZE {
                    entropy_sent = (sent - header_size) as u32;
                    client.entropy_requested -= write_size;
                    client.entropy_pending = write_size - entropy_sent;
                } else {
                    entropy_sent = (sent - header_size) as u32;
                    client.entropy_pending -= entropy_sent;
                }

                if entropy_sent < write_size {
                    let unsent = (write_size - entropy_sent) as usize;
                    pool.unread(&send_buf[sent..sent + unsent]);
                }
            }
            Err(e) => {
                // Pushed back from the fixed header offset, not the
                // possibly-shorter `header_size` of a continuation frame —
                // matches the original's `send_buf + HEADER_SIZE` exactly.
                pool.unread(&send_buf[HEADER_SIZE..HEADER_SIZE + write_size_usize]);
                if e.kind() != ErrorKind::WouldBlock && e.kind() != ErrorKind::Interrupted {
                    warn!("send error to client {}: {e}", table.get(index).peer);
                }
            }
        }

        table.advance_cursor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn connected_pair() -> (Client, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_side = TcpStream::connect(addr).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        client_side.set_nonblocking(true).unwrap();
        (Client::new(server_side, peer, Instant::now()), client_side)
    }

    #[test]
    fn keepalive_emits_zero_length_frame() {
        let mut table = ClientTable::new();
        let (mut client, mut reader) = connected_pair();
        client.keepalive_pending = true;
        table.try_add(client);

        let mut pool = RingBuffer::new(8192);
        send_entropy(&mut table, &mut pool, |_| true);

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf), 0);
    }

    #[test]
    fn request_is_served_up_to_available_bytes() {
        let mut table = ClientTable::new();
        let (mut client, mut reader) = connected_pair();
        client.entropy_requested = 16;
        table.try_add(client);

        let mut pool = RingBuffer::new(8192);
        let data: Vec<u8> = (0..16u8).collect();
        pool.write(&data);

        send_entropy(&mut table, &mut pool, |_| true);

        let mut header = [0u8; 4];
        reader.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).unwrap();
        assert_eq!(payload, data[..len]);
        assert_eq!(table.get(0).entropy_requested, 16 - len as u32);
    }

    #[test]
    fn unwritable_client_is_skipped_without_consuming_pool() {
        let mut table = ClientTable::new();
        let (mut client, _reader) = connected_pair();
        client.entropy_requested = 16;
        table.try_add(client);

        let mut pool = RingBuffer::new(8192);
        pool.write(&[1, 2, 3, 4]);

        send_entropy(&mut table, &mut pool, |_| false);

        assert_eq!(pool.len(), 4);
        assert_eq!(table.get(0).entropy_requested, 16);
    }
}
