//
// Copyright (c) 2017, 2020 ADLINK Technology Inc.
//
// This program and the accompanying materials are made available under the
// terms of the Eclipse Public License 2.0 which is available at
// http://www.eclipse.org/legal/epl-2.0, or the Apache License, Version 2.0
// which is available at https://www.apache.org/licenses/LICENSE-2.0.
//
// SPDX-License-Identifier: EPL-2.0 OR Apache-2.0
//
// Contributors:
//   ADLINK zenoh team, <zenoh@adlink-labs.tech>
//
use dsm::{DsmClient, DsmConfig, DsmServer, ServerState};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(10);
const SLEEP: Duration = Duration::from_millis(10);

fn test_config() -> DsmConfig {
    let _ = env_logger::try_init();
    let mut config = DsmConfig::default();
    config.arena_prefix = format!("dsmtest{}_", &Uuid::new_v4().to_simple().to_string()[..12]);
    config.request_base_port = rand::thread_rng().gen_range(20_000..40_000);
    config.wait_for_client = false;
    config.serve_remote = false;
    config
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(SLEEP);
    }
    true
}

#[test]
fn end_to_end_scenario() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    assert!(server.arena_name().ends_with('0'));

    let a = DsmClient::new(config.clone(), 1, true).unwrap();
    let b = DsmClient::new(config, 2, true).unwrap();

    assert!(a.register_local_buffer("temp", 4, false));
    // Not visible before the server drains its queue
    assert!(!b.does_local_exist("temp"));
    server.process_pending();

    assert!(a.does_local_exist("temp"));
    assert!(b.does_local_exist("temp"));
    assert!(a.set_local_buffer_contents("temp", &[1, 2, 3, 4]));
    assert_eq!(b.get_local_buffer_contents("temp"), Some(vec![1, 2, 3, 4]));

    let mut dst = [0u8; 4];
    assert!(b.read_local_buffer("temp", &mut dst));
    assert_eq!(dst, [1, 2, 3, 4]);
}

#[test]
fn duplicate_registration() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let a = DsmClient::new(config.clone(), 1, false).unwrap();
    let b = DsmClient::new(config, 2, false).unwrap();

    assert!(a.register_local_buffer("dup", 8, false));
    assert!(!a.register_local_buffer("dup", 8, false));
    assert_eq!(a.pending_messages(), 1);
    // Another client does not know about it yet
    assert!(b.register_local_buffer("dup", 16, false));
    server.process_pending();

    let buffers = server.local_buffers();
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].1.len, 8);
    assert_eq!(buffers[0].1.owner, 1);

    // Already asked for by this client
    assert!(!b.register_local_buffer("dup", 16, false));
    assert!(b.register_local_buffer("other", 16, false));
    server.process_pending();
    assert_eq!(server.local_buffers().len(), 2);
    assert_eq!(b.local_buffer_len("dup"), Some(8));
    assert_eq!(b.local_buffer_len("other"), Some(16));
}

#[test]
fn contents_are_clamped_to_the_buffer_length() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let client = DsmClient::new(config, 1, false).unwrap();

    assert!(client.register_local_buffer("word", 4, false));
    server.process_pending();

    assert!(client.set_local_buffer_contents("word", b"abcdef"));
    assert_eq!(client.get_local_buffer_string("word"), Some("abcd".to_string()));

    assert!(client.set_local_buffer_contents("word", b"x"));
    assert_eq!(client.get_local_buffer_contents("word"), Some(vec![b'x', 0, 0, 0]));

    let mut short = [0u8; 3];
    assert!(!client.read_local_buffer("word", &mut short));
    let mut long = [0xffu8; 6];
    assert!(client.read_local_buffer("word", &mut long));
    assert_eq!(long, [b'x', 0, 0, 0, 0xff, 0xff]);

    assert!(!client.set_local_buffer_contents("missing", b"abc"));
    assert_eq!(client.get_local_buffer_contents("missing"), None);
}

#[test]
fn disconnect_removes_the_buffer() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let client = DsmClient::new(config, 1, false).unwrap();

    assert!(client.register_local_buffer("gone", 64, false));
    server.process_pending();
    assert!(client.does_local_exist("gone"));

    assert!(client.disconnect_from_local_buffer("gone"));
    server.process_pending();
    assert!(!client.does_local_exist("gone"));
    assert!(server.local_buffers().is_empty());

    // A definition followed by its disconnection in the same batch
    assert!(client.register_local_buffer("brief", 64, false));
    assert!(client.disconnect_from_local_buffer("brief"));
    server.process_pending();
    assert!(!client.does_local_exist("brief"));
}

#[test]
fn invalid_requests_send_nothing() {
    let config = test_config();
    let _server = DsmServer::new(config.clone()).unwrap();
    let client = DsmClient::new(config.clone(), 1, false).unwrap();

    let long_name = "n".repeat(27);
    assert!(!client.register_local_buffer(&long_name, 4, false));
    assert!(!client.disconnect_from_local_buffer(&long_name));
    assert!(!client.register_remote_buffer(&long_name, "127.0.0.1", 0));
    assert!(!client.disconnect_from_remote_buffer(&long_name, "127.0.0.1", 0));
    assert!(!client.register_local_buffer("", 4, false));

    assert!(!client.register_local_buffer("zero", 0, false));
    let too_big = config.max_buffer_size as usize + 1;
    assert!(!client.register_local_buffer("big", too_big, false));

    assert!(!client.register_remote_buffer("remote", "127.0.0", 0));
    assert!(!client.register_remote_buffer("remote", "not an address", 0));
    assert!(!client.register_remote_buffer("remote", "127.0.0.1", 16));
    assert!(!client.refetch_remote_buffer("remote", "127.0.0.1", 16));

    assert!(!client.does_local_exist(&long_name));
    assert!(!client.does_remote_exist("remote", "127.0.0.1", 16));
    assert_eq!(client.pending_messages(), 0);
}

#[test]
fn concurrent_readers_and_writer() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let client = Arc::new(DsmClient::new(config, 1, false).unwrap());

    assert!(client.register_local_buffer("shared", 1024, false));
    server.process_pending();
    assert!(client.set_local_buffer_contents("shared", &[0u8; 1024]));

    let mut readers = vec![];
    for _ in 0..8 {
        let c_client = client.clone();
        readers.push(thread::spawn(move || {
            for _ in 0..200 {
                let data = c_client.get_local_buffer_contents("shared").unwrap();
                assert_eq!(data.len(), 1024);
                // A write is never observed half done
                assert!(data.iter().all(|b| *b == data[0]));
            }
        }));
    }
    let c_client = client.clone();
    let writer = thread::spawn(move || {
        for i in 0..100u8 {
            assert!(c_client.set_local_buffer_contents("shared", &[i; 1024]));
        }
    });

    for r in readers {
        r.join().unwrap();
    }
    writer.join().unwrap();
    assert_eq!(client.get_local_buffer_contents("shared"), Some(vec![99u8; 1024]));
}

#[test]
fn reset_clears_a_crashed_client() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();

    let crashed = DsmClient::new(config.clone(), 7, false).unwrap();
    assert!(crashed.register_local_buffer("stale", 32, false));
    assert!(crashed.register_local_buffer("stale2", 32, true));
    server.process_pending();
    assert_eq!(server.local_buffers().len(), 2);
    // Vanishes without saying goodbye
    std::mem::forget(crashed);

    let other = DsmClient::new(config.clone(), 8, false).unwrap();
    assert!(other.register_local_buffer("kept", 32, false));
    server.process_pending();

    assert_eq!(server.local_buffers().len(), 3);
    let revived = DsmClient::new(config, 7, true).unwrap();
    server.process_pending();
    assert!(!revived.does_local_exist("stale"));
    assert!(!revived.does_local_exist("stale2"));
    assert!(revived.does_local_exist("kept"));
}

#[test]
fn dropped_client_releases_its_buffers() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let observer = DsmClient::new(config.clone(), 2, false).unwrap();
    {
        let client = DsmClient::new(config, 1, false).unwrap();
        assert!(client.register_local_buffer("owned", 32, false));
        server.process_pending();
        assert!(observer.does_local_exist("owned"));
    }
    server.process_pending();
    assert!(!observer.does_local_exist("owned"));

    // Gone before the server got to its request
    {
        let client = DsmClient::new(server.config().clone(), 3, false).unwrap();
        assert!(client.register_local_buffer("orphan", 32, false));
    }
    server.process_pending();
    assert!(!observer.does_local_exist("orphan"));
    assert!(server.local_buffers().is_empty());
}

#[test]
fn register_again_after_a_foreign_disconnect() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let a = DsmClient::new(config.clone(), 1, false).unwrap();
    let b = DsmClient::new(config, 2, false).unwrap();

    assert!(a.register_local_buffer("x", 4, false));
    server.process_pending();
    assert!(b.disconnect_from_local_buffer("x"));
    // Not consumed yet: the buffer is about to go away
    assert!(a.register_local_buffer("x", 4, false));
    assert!(!a.register_local_buffer("x", 4, false));
    server.process_pending();
    assert!(a.does_local_exist("x"));

    assert!(b.disconnect_from_local_buffer("x"));
    server.process_pending();
    assert!(!a.does_local_exist("x"));
    assert!(a.register_local_buffer("x", 4, false));
    server.process_pending();
    assert!(a.does_local_exist("x"));
    assert!(!a.register_local_buffer("x", 4, false));
}

#[test]
fn register_again_after_a_rejection() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let client = DsmClient::new(config.clone(), 1, false).unwrap();
    let size = config.max_buffer_size as usize;

    // More than the arena holds, in batches the queue can take
    let names: Vec<String> = (0..20).map(|i| format!("big{}", i)).collect();
    for batch in names.chunks(5) {
        for name in batch {
            assert!(client.register_local_buffer(name, size, false));
        }
        server.process_pending();
    }
    let rejected: Vec<&String> = names
        .iter()
        .filter(|name| !client.does_local_exist(name))
        .collect();
    assert!(!rejected.is_empty());

    for name in names.iter().filter(|name| client.does_local_exist(name)) {
        assert!(!client.register_local_buffer(name, size, false));
        assert!(client.disconnect_from_local_buffer(name));
        server.process_pending();
    }
    assert!(server.local_buffers().is_empty());

    assert!(client.register_local_buffer(rejected[0], size, false));
    server.process_pending();
    assert!(client.does_local_exist(rejected[0]));
}

#[test]
fn freed_space_is_reused() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let client = DsmClient::new(config.clone(), 1, false).unwrap();
    let size = config.max_buffer_size as usize;

    // Far more buffers than the arena can hold, in batches the queue can take
    let mut registered = 0;
    for batch in 0..4 {
        for i in 0..8 {
            assert!(client.register_local_buffer(&format!("b{}_{}", batch, i), size, false));
        }
        server.process_pending();
        registered += 8;
    }
    let held = server.local_buffers().len();
    assert!(held > 0);
    assert!(held < registered);

    assert!(client.disconnect_from_local_buffer("b0_0"));
    assert!(client.register_local_buffer("late", size, false));
    server.process_pending();
    assert!(client.does_local_exist("late"));
    assert_eq!(server.local_buffers().len(), held);
}

#[test]
fn token_is_enforced() {
    let mut config = test_config();
    config.token = Some("secret".to_string());
    let server = DsmServer::new(config.clone()).unwrap();

    let mut wrong = config.clone();
    wrong.token = Some("guess".to_string());
    let intruder = DsmClient::new(wrong, 1, false).unwrap();
    assert!(intruder.register_local_buffer("forbidden", 8, false));

    let trusted = DsmClient::new(config, 2, false).unwrap();
    assert!(trusted.register_local_buffer("allowed", 8, false));
    server.process_pending();

    assert!(!trusted.does_local_exist("forbidden"));
    assert!(trusted.does_local_exist("allowed"));
}

#[test]
fn second_server_with_the_same_id_fails() {
    let config = test_config();
    let _server = DsmServer::new(config.clone()).unwrap();
    assert!(DsmServer::new(config).is_err());
}

#[test]
fn client_without_server_fails() {
    let config = test_config();
    assert!(DsmClient::new(config, 1, false).is_err());
}

#[test]
fn rendezvous_with_the_first_client() {
    let mut config = test_config();
    config.wait_for_client = true;
    let mut server = DsmServer::new(config.clone()).unwrap();
    assert_eq!(server.state(), ServerState::Created);

    let handle = thread::spawn(move || {
        let started = server.start().unwrap();
        (server, started)
    });
    let client = DsmClient::new(config.clone(), 1, false).unwrap();
    let (server, started) = handle.join().unwrap();
    assert!(started);
    assert_eq!(server.state(), ServerState::Running);

    // Later clients go straight through
    let late = DsmClient::new(config, 2, false).unwrap();
    assert!(client.register_local_buffer("after", 4, false));
    server.process_pending();
    assert!(late.does_local_exist("after"));
}

#[test]
fn run_until_shutdown() {
    let config = test_config();
    let mut server = DsmServer::new(config.clone()).unwrap();
    let shutdown = server.shutdown_handle();
    let handle = thread::spawn(move || {
        server.run().unwrap();
        server
    });

    let client = DsmClient::new(config, 1, false).unwrap();
    assert!(client.register_local_buffer("live", 4, false));
    assert!(wait_until(|| client.does_local_exist("live")));
    assert!(client.set_local_buffer_contents("live", b"ping"));
    assert!(client.disconnect_from_local_buffer("live"));
    assert!(wait_until(|| !client.does_local_exist("live")));

    shutdown.shutdown();
    let server = handle.join().unwrap();
    assert_eq!(server.state(), ServerState::ShuttingDown);
}

#[test]
fn dump_lists_buffers() {
    let config = test_config();
    let server = DsmServer::new(config.clone()).unwrap();
    let client = DsmClient::new(config, 1, false).unwrap();

    assert!(client.register_local_buffer("temp", 4, false));
    server.process_pending();
    assert!(client.set_local_buffer_contents("temp", &[1, 2, 3, 4]));
    assert!(client.register_local_buffer("queued", 4, true));

    let dump = server.dump();
    assert!(dump.contains("temp"));
    assert!(dump.contains("01020304"));
    assert!(dump.contains("Local buffers: 1"));
    assert!(dump.contains("Clients: [1]"));
    // Still in the control queue, not yet pending
    assert!(dump.contains("Pending definitions: 0"));
}
