// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;

use moira::file::{Mode, OFlag, RandomAccessFile, StreamFile};
use moira::{IoContext, StopSource};

fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("moira-test-{}-{}", std::process::id(), name));
    path
}

fn fill_pseudo_random(buf: &mut [u8]) {
    let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
    for chunk in buf.chunks_mut(8) {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        for (b, v) in chunk.iter_mut().zip(x.to_le_bytes()) {
            *b = v;
        }
    }
}

fn copy_chunk(
    from: RandomAccessFile,
    to: RandomAccessFile,
    offset: i64,
    source: Arc<StopSource>,
) {
    let from2 = from.clone();
    let to2 = to.clone();

    from.async_read_some_at(offset, vec![0_u8; 4096], move |result, buf| {
        match result {
            Err(err) => {
                // end of the source file
                assert_eq!(err, Errno::ENOMSG);
                source.request_stop();
            }
            Ok(bytes_read) => {
                let from3 = from2.clone();
                let to3 = to2.clone();

                to2.async_write_some_at(offset, buf[..bytes_read].to_vec(), move |result, _buf| {
                    let bytes_written = result.unwrap();

                    // a short write re-reads the remainder from the
                    // source at the advanced offset
                    copy_chunk(from3, to3, offset + bytes_written as i64, source);
                });
            }
        }
    });
}

#[test]
fn random_file_copy() {
    const FILE_LEN: usize = 5 * 1024 * 1024;

    let src_path = temp_path("copy-src");
    let dst_path = temp_path("copy-dst");

    let mut contents = vec![0_u8; FILE_LEN];
    fill_pseudo_random(&mut contents);

    std::fs::write(&src_path, &contents).unwrap();
    std::fs::set_permissions(&src_path, std::fs::Permissions::from_mode(0o640)).unwrap();

    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());

    let from = RandomAccessFile::open(ex.clone(), &src_path, OFlag::O_RDONLY, Mode::empty())
        .unwrap();

    let to = RandomAccessFile::open(
        ex,
        &dst_path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o600),
    )
    .unwrap();

    // the destination inherits the source's permissions up front
    let src_perms = std::fs::metadata(&src_path).unwrap().permissions();
    std::fs::set_permissions(&dst_path, src_perms).unwrap();

    copy_chunk(from, to, 0, source.clone());

    ioc.run(source.get_token()).unwrap();

    let copied = std::fs::read(&dst_path).unwrap();
    assert_eq!(copied.len(), contents.len());
    assert!(copied == contents);

    let src_mode = std::fs::metadata(&src_path).unwrap().permissions().mode() & 0o777;
    let dst_mode = std::fs::metadata(&dst_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(src_mode, dst_mode);

    std::fs::remove_file(&src_path).unwrap();
    std::fs::remove_file(&dst_path).unwrap();
}

fn read_chunks(file: StreamFile, collected: Arc<Mutex<Vec<u8>>>, source: Arc<StopSource>) {
    let file2 = file.clone();

    file.async_read(vec![0_u8; 1024], move |result, buf| {
        match result {
            Err(err) => {
                assert_eq!(err, Errno::ENOMSG);
                source.request_stop();
            }
            Ok(bytes) => {
                collected.lock().unwrap().extend_from_slice(&buf[..bytes]);
                read_chunks(file2, collected, source);
            }
        }
    });
}

#[test]
fn stream_file_reads_sequentially() {
    const FILE_LEN: usize = 3 * 1024;

    let path = temp_path("stream-read");

    let mut contents = vec![0_u8; FILE_LEN];
    fill_pseudo_random(&mut contents);
    std::fs::write(&path, &contents).unwrap();

    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());

    let file = StreamFile::open(ex, &path, OFlag::O_RDONLY, Mode::empty()).unwrap();
    let collected = Arc::new(Mutex::new(Vec::new()));

    read_chunks(file.clone(), collected.clone(), source.clone());

    ioc.run(source.get_token()).unwrap();

    assert_eq!(file.offset(), FILE_LEN as i64);
    assert_eq!(*collected.lock().unwrap(), contents);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn stream_file_writes_advance_the_offset() {
    let path = temp_path("stream-write");

    let mut ioc = IoContext::new().unwrap();
    let ex = ioc.get_executor();

    let source = Arc::new(StopSource::new());

    let file = StreamFile::open(
        ex,
        &path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o644),
    )
    .unwrap();

    let mut first = vec![0_u8; 1024];
    let mut second = vec![0_u8; 1024];
    fill_pseudo_random(&mut first);
    second.copy_from_slice(&first);
    second.reverse();

    let expected: Vec<u8> = first.iter().chain(second.iter()).copied().collect();

    let file2 = file.clone();
    let source2 = source.clone();
    let second2 = second.clone();

    file.async_write(first, move |result, _buf| {
        result.unwrap();
        assert_eq!(file2.offset(), 1024);

        let file3 = file2.clone();
        file2.async_write(second2, move |result, _buf| {
            result.unwrap();
            assert_eq!(file3.offset(), 2048);
            source2.request_stop();
        });
    });

    ioc.run(source.get_token()).unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written, expected);

    std::fs::remove_file(&path).unwrap();
}
