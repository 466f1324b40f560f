// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;

use moira::tcp::{async_connect, Acceptor, Stream};
use moira::{Executor, IoContext, StopSource};

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn partial_read_reassembly() {
    // a fully-read of 64 bytes against a peer writing 16-byte chunks
    // delivers one callback carrying all 64 bytes
    const MSG_LEN: usize = 64;
    const CHUNK: usize = 16;

    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());

    let acceptor = Acceptor::bind(ex, localhost()).unwrap();
    let port = acceptor.port();

    let writer = thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_nodelay(true).unwrap();

        for i in 0..(MSG_LEN / CHUNK) {
            let chunk = [b'a' + i as u8; CHUNK];
            stream.write_all(&chunk).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(30));
        }

        stream
    });

    let callbacks = Arc::new(AtomicUsize::new(0));

    let callbacks2 = callbacks.clone();
    let source2 = source.clone();

    acceptor.async_accept(move |result| {
        let stream = result.unwrap();

        let keep = stream.clone();
        stream.async_read(vec![0_u8; MSG_LEN], move |result, buf| {
            let _keep = keep;

            assert_eq!(result.unwrap(), MSG_LEN);
            callbacks2.fetch_add(1, SeqCst);

            for (i, chunk) in buf.chunks(CHUNK).enumerate() {
                assert!(chunk.iter().all(|&b| b == b'a' + i as u8));
            }

            source2.request_stop();
        });
    });

    ioc.run(source.get_token()).unwrap();

    assert_eq!(callbacks.load(SeqCst), 1);
    writer.join().unwrap();
}

#[test]
fn eos_reports_no_message() {
    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());

    let acceptor = Acceptor::bind(ex, localhost()).unwrap();
    let port = acceptor.port();

    let client = thread::spawn(move || {
        let stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        drop(stream);
    });

    let callbacks = Arc::new(AtomicUsize::new(0));

    let callbacks2 = callbacks.clone();
    let source2 = source.clone();

    acceptor.async_accept(move |result| {
        let stream = result.unwrap();

        let keep = stream.clone();
        stream.async_read(vec![0_u8; 64], move |result, _buf| {
            let _keep = keep;

            assert_eq!(result.unwrap_err(), Errno::ENOMSG);
            callbacks2.fetch_add(1, SeqCst);

            source2.request_stop();
        });
    });

    ioc.run(source.get_token()).unwrap();

    assert_eq!(callbacks.load(SeqCst), 1);
    client.join().unwrap();
}

#[test]
fn connect_refused() {
    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());

    // grab a port that momentarily had a listener, then no longer does
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let source2 = source.clone();
    async_connect(&ex, addr, move |result| {
        assert_eq!(result.unwrap_err(), Errno::ECONNREFUSED);
        source2.request_stop();
    });

    ioc.run(source.get_token()).unwrap();
}

//-----------------------------------------------------------------------------

const CHAT_MSG_LEN: usize = 16;
const MAX_RECENT_MSGS: usize = 100;

struct Room {
    recent_msgs: VecDeque<Vec<u8>>,
    participants: Vec<(u64, Stream)>,
}

impl Room {
    fn new() -> Room {
        Room {
            recent_msgs: VecDeque::new(),
            participants: Vec::new(),
        }
    }

    fn join(&mut self, id: u64, stream: Stream) {
        self.participants.push((id, stream));
    }

    fn deliver(&mut self, from: u64, msg: &[u8]) {
        self.recent_msgs.push_back(msg.to_vec());
        while self.recent_msgs.len() > MAX_RECENT_MSGS {
            self.recent_msgs.pop_front();
        }

        for (id, participant) in &self.participants {
            if *id == from {
                continue;
            }

            let keep = participant.clone();
            participant.async_write(msg.to_vec(), move |result, _buf| {
                let _keep = keep;
                result.unwrap();
            });
        }
    }
}

fn chat_session(room: Arc<Mutex<Room>>, id: u64, stream: Stream) {
    let keep = stream.clone();

    stream.async_read(vec![0_u8; CHAT_MSG_LEN], move |result, buf| {
        if result.is_err() {
            // peer left
            return;
        }

        room.lock().unwrap().deliver(id, &buf);
        chat_session(room, id, keep);
    });
}

fn pad_msg(text: &str) -> Vec<u8> {
    let mut msg = text.as_bytes().to_vec();
    msg.resize(CHAT_MSG_LEN, b' ');
    msg
}

#[test]
fn chat_room() {
    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());

    let acceptor = Acceptor::bind(ex.clone(), localhost()).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let room = Arc::new(Mutex::new(Room::new()));

    // the scenario: once both clients are connected and both sessions
    // joined, client a speaks; client b must hear it and client a's own
    // pending receive must stay silent
    struct Scenario {
        ready: usize,
        client_a: Option<Stream>,
        client_b: Option<Stream>,
    }

    let scenario = Arc::new(Mutex::new(Scenario {
        ready: 0,
        client_a: None,
        client_b: None,
    }));

    let a_heard = Arc::new(AtomicBool::new(false));
    let b_heard = Arc::new(AtomicUsize::new(0));

    fn maybe_start(
        scenario: &Arc<Mutex<Scenario>>,
        a_heard: &Arc<AtomicBool>,
        b_heard: &Arc<AtomicUsize>,
        source: &Arc<StopSource>,
    ) {
        let mut locked = scenario.lock().unwrap();
        locked.ready += 1;
        if locked.ready != 4 {
            return;
        }

        let client_a = locked.client_a.take().unwrap();
        let client_b = locked.client_b.take().unwrap();
        drop(locked);

        // client a must never see its own message echoed back
        let a_heard = a_heard.clone();
        let keep_a = client_a.clone();
        client_a.async_read(vec![0_u8; CHAT_MSG_LEN], move |_result, _buf| {
            let _keep = keep_a;
            a_heard.store(true, SeqCst);
        });

        let b_heard = b_heard.clone();
        let source = source.clone();
        let keep_b = client_b.clone();
        client_b.async_read(vec![0_u8; CHAT_MSG_LEN], move |result, buf| {
            let _keep = keep_b;

            assert_eq!(result.unwrap(), CHAT_MSG_LEN);
            assert_eq!(buf, pad_msg("msg-A"));
            b_heard.fetch_add(1, SeqCst);

            source.request_stop();
        });

        let keep = client_a.clone();
        client_a.async_write(pad_msg("msg-A"), move |result, _buf| {
            let _keep = keep;
            result.unwrap();
        });
    }

    // two server sessions
    for id in 0..2_u64 {
        let room = room.clone();
        let scenario = scenario.clone();
        let a_heard = a_heard.clone();
        let b_heard = b_heard.clone();
        let source = source.clone();

        acceptor.async_accept(move |result| {
            let stream = result.unwrap();

            room.lock().unwrap().join(id, stream.clone());
            chat_session(room, id, stream);

            maybe_start(&scenario, &a_heard, &b_heard, &source);
        });
    }

    // two clients
    for is_a in [true, false] {
        let scenario = scenario.clone();
        let a_heard = a_heard.clone();
        let b_heard = b_heard.clone();
        let source = source.clone();

        async_connect(&ex, addr, move |result| {
            let stream = result.unwrap();

            {
                let mut locked = scenario.lock().unwrap();
                if is_a {
                    locked.client_a = Some(stream);
                } else {
                    locked.client_b = Some(stream);
                }
            }

            maybe_start(&scenario, &a_heard, &b_heard, &source);
        });
    }

    ioc.run(source.get_token()).unwrap();

    assert_eq!(b_heard.load(SeqCst), 1);
    assert!(!a_heard.load(SeqCst));

    let room = room.lock().unwrap();
    assert_eq!(room.recent_msgs.back().unwrap(), &pad_msg("msg-A"));
    assert!(room.recent_msgs.len() <= MAX_RECENT_MSGS);
}

#[test]
fn room_retains_last_100_messages() {
    let mut room = Room::new();

    for i in 0..150 {
        room.deliver(0, &pad_msg(&format!("m{i}")));
    }

    assert_eq!(room.recent_msgs.len(), MAX_RECENT_MSGS);
    assert_eq!(room.recent_msgs.front().unwrap(), &pad_msg("m50"));
    assert_eq!(room.recent_msgs.back().unwrap(), &pad_msg("m149"));
}

#[test]
fn connect_and_echo_through_loop_clients() {
    // both ends of the conversation run on the same loop
    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());

    let acceptor = Acceptor::bind(ex.clone(), localhost()).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let echoed = Arc::new(AtomicUsize::new(0));

    // server: read 8 bytes, write them back
    acceptor.async_accept(move |result| {
        let stream = result.unwrap();

        let keep = stream.clone();
        stream.async_read(vec![0_u8; 8], move |result, buf| {
            assert_eq!(result.unwrap(), 8);

            let keep2 = keep.clone();
            keep.async_write(buf, move |result, _buf| {
                let _keep = keep2;
                assert_eq!(result.unwrap(), 8);
            });
        });
    });

    let echoed2 = echoed.clone();
    let source2 = source.clone();

    async_connect(&ex, addr, move |result| {
        let stream = result.unwrap();

        let keep = stream.clone();
        stream.async_write(b"echo-me!".to_vec(), move |result, _buf| {
            assert_eq!(result.unwrap(), 8);

            let keep2 = keep.clone();
            keep.async_read(vec![0_u8; 8], move |result, buf| {
                let _keep = keep2;

                assert_eq!(result.unwrap(), 8);
                assert_eq!(&buf, b"echo-me!");

                echoed2.fetch_add(1, SeqCst);
                source2.request_stop();
            });
        });
    });

    ioc.run(source.get_token()).unwrap();

    assert_eq!(echoed.load(SeqCst), 1);
}

#[allow(dead_code)]
fn executor_is_send(ex: Executor) {
    fn check<T: Send>(_t: T) {}
    check(ex);
}
