//! Integration-level exercise of the request/response framing and
//! round-robin fairness across several real client sockets, without any
//! USB hardware — `Driver` is not stood up here, only the pieces that
//! `driver::iterate` composes every pass.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Instant;

use quantisd::net::client::{Client, ClientTable};
use quantisd::net::dispatcher::send_entropy;
use quantisd::ring::RingBuffer;

fn connected_pair(listener: &TcpListener) -> (Client, TcpStream) {
    let addr = listener.local_addr().unwrap();
    let client_side = TcpStream::connect(addr).unwrap();
    let (server_side, peer) = listener.accept().unwrap();
    server_side.set_nonblocking(true).unwrap();
    client_side.set_nonblocking(true).unwrap();
    (Client::new(server_side, peer, Instant::now()), client_side)
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).unwrap();
    let len = u32::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).unwrap();
    }
    payload
}

#[test]
fn three_clients_share_pool_in_round_robin_order() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut table = ClientTable::new();
    let mut readers = Vec::new();

    for _ in 0..3 {
        let (mut client, reader) = connected_pair(&listener);
        client.entropy_requested = 4;
        table.try_add(client);
        readers.push(reader);
    }

    let mut pool = RingBuffer::new(8192);
    pool.write(&[0xAA; 4]);
    pool.write(&[0xBB; 4]);
    pool.write(&[0xCC; 4]);

    // One pass of send_entropy serves whoever is at the cursor first; drive
    // it until every client has received its 4 bytes.
    for _ in 0..3 {
        send_entropy(&mut table, &mut pool, |_| true);
    }

    for reader in readers.iter_mut() {
        let payload = read_frame(reader);
        assert_eq!(payload.len(), 4);
    }
    assert!(pool.is_empty());
}

#[test]
fn unwritable_client_does_not_starve_the_others() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut table = ClientTable::new();

    let (mut blocked, _blocked_reader) = connected_pair(&listener);
    blocked.entropy_requested = 4;
    table.try_add(blocked);

    let (mut live, mut live_reader) = connected_pair(&listener);
    live.entropy_requested = 4;
    table.try_add(live);

    let mut pool = RingBuffer::new(8192);
    pool.write(&[1, 2, 3, 4]);
    pool.write(&[5, 6, 7, 8]);

    send_entropy(&mut table, &mut pool, |i| i != 0);

    let payload = read_frame(&mut live_reader);
    assert_eq!(payload, vec![1, 2, 3, 4]);
    // the blocked client's share is still sitting in the pool, untouched
    assert_eq!(pool.len(), 4);
}

#[test]
fn request_then_response_round_trip_over_real_sockets() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut client, mut stream) = connected_pair(&listener);

    stream.write_all(&8u32.to_be_bytes()).unwrap();

    let mut header = [0u8; 4];
    loop {
        match client.socket.read(&mut header) {
            Ok(n) if n == 4 => break,
            Ok(_) => panic!("short header read"),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let requested = u32::from_be_bytes(header);
    assert!(client.accept_request(requested, Instant::now()));
    assert_eq!(client.entropy_requested, 8);

    let mut table = ClientTable::new();
    table.try_add(client);

    let mut pool = RingBuffer::new(8192);
    pool.write(&(0..8u8).collect::<Vec<_>>());
    send_entropy(&mut table, &mut pool, |_| true);

    let payload = read_frame(&mut stream);
    assert_eq!(payload, (0..8u8).collect::<Vec<_>>());
}
