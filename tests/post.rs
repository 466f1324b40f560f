// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use moira::{IoContext, StopSource};

#[test]
fn post_from_another_thread_runs_on_loop_thread() {
    let ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());
    let token = source.get_token();

    let handle = thread::spawn(move || {
        let mut ioc = ioc;
        ioc.run(token).unwrap();
    });
    let loop_thread = handle.thread().id();

    let (tx, rx) = mpsc::channel();

    let source2 = source.clone();
    ex.post(move || {
        tx.send(thread::current().id()).unwrap();
        source2.request_stop();
    });

    let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(ran_on, loop_thread);

    handle.join().unwrap();

    // exactly once
    assert!(rx.try_recv().is_err());
}

#[test]
fn posts_run_in_order() {
    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
        let order = order.clone();
        ex.post(move || {
            order.lock().unwrap().push(i);
        });
    }

    let source2 = source.clone();
    ex.post(move || {
        source2.request_stop();
    });

    ioc.run(source.get_token()).unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn post_from_continuation_runs_next_iteration() {
    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());
    let count = Arc::new(AtomicUsize::new(0));

    let ex2 = ex.clone();
    let source2 = source.clone();
    let count2 = count.clone();

    ex.post(move || {
        count2.fetch_add(1, SeqCst);

        let count3 = count2.clone();
        ex2.post(move || {
            count3.fetch_add(1, SeqCst);
            source2.request_stop();
        });
    });

    ioc.run(source.get_token()).unwrap();

    assert_eq!(count.load(SeqCst), 2);
}

#[test]
fn many_remote_posts_all_run() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 250;

    let ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());
    let token = source.get_token();

    let handle = thread::spawn(move || {
        let mut ioc = ioc;
        ioc.run(token).unwrap();
    });

    let count = Arc::new(AtomicUsize::new(0));

    let posters: Vec<_> = (0..THREADS)
        .map(|_| {
            let ex = ex.clone();
            let count = count.clone();
            let source = source.clone();

            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    let count = count.clone();
                    let source = source.clone();

                    ex.post(move || {
                        if count.fetch_add(1, SeqCst) + 1 == THREADS * PER_THREAD {
                            source.request_stop();
                        }
                    });
                }
            })
        })
        .collect();

    for poster in posters {
        poster.join().unwrap();
    }

    handle.join().unwrap();
    assert_eq!(count.load(SeqCst), THREADS * PER_THREAD);
}
