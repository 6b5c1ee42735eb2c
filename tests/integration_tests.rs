//! Spindle Integration Tests
//!
//! End-to-end checks of the resolution protocol:
//! - Client resolvers against an in-process server handler
//! - The socket server with the Unix transport
//! - The shared cache across independent mappings of one segment file

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use spindle::adapters::{HandlerTransport, SystemEnv};
use spindle::server::{QueryHandler, ServerConfig};
use spindle::shmcache::{CachedValue, Lookup, ShmCache, ShmCacheConfig};

/// Global tree with a couple of library directories
struct World {
    root: TempDir,
}

impl World {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let base = root.path();
        fs::create_dir_all(base.join("global/lib")).unwrap();
        fs::create_dir_all(base.join("global/usr/lib")).unwrap();
        fs::create_dir_all(base.join("global/empty")).unwrap();
        fs::write(base.join("global/lib/libc.so.6"), b"libc contents").unwrap();
        fs::write(base.join("global/usr/lib/libm.so.6"), b"libm contents").unwrap();
        fs::write(base.join("global/usr/lib/libz.so.1"), vec![0x5a; 256 * 1024]).unwrap();
        Self { root }
    }

    fn path(&self, rel: &str) -> String {
        self.root.path().join(rel).to_str().unwrap().to_string()
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            socket_path: self.root.path().join("spindle.sock"),
            store_dir: self.root.path().join("store"),
            search_path: vec![self.path("global/lib"), self.path("global/usr/lib")],
            python_prefixes: vec![self.path("global/usr")],
            ..Default::default()
        }
    }

    fn handler(&self) -> Arc<Mutex<QueryHandler<SystemEnv>>> {
        Arc::new(Mutex::new(
            QueryHandler::new(&self.server_config(), SystemEnv).unwrap(),
        ))
    }

    fn segment_config(&self) -> ShmCacheConfig {
        ShmCacheConfig {
            segment_path: Some(self.root.path().join("segment")),
            ..Default::default()
        }
    }
}

fn requests(handler: &Arc<Mutex<QueryHandler<SystemEnv>>>) -> u64 {
    handler.lock().stats().requests
}

// =============================================================================
// Resolution Protocol Tests
// =============================================================================

mod protocol_tests {
    use super::*;
    use spindle::dircache::DirRecord;
    use spindle::{Resolution, Resolver};

    #[tokio::test]
    async fn test_search_path_resolution_copies_content() {
        let world = World::new();
        let handler = world.handler();
        let cache = Arc::new(ShmCache::open(world.segment_config()).unwrap());
        let mut resolver = Resolver::new(HandlerTransport::new(handler.clone()), SystemEnv, cache);

        let libm = resolver.resolve("libm.so.6").await.unwrap();
        let local = libm.local_path().unwrap().to_string();
        assert!(local.starts_with(&world.path("store")));
        assert_eq!(fs::read(&local).unwrap(), b"libm contents");

        let missing = resolver.resolve("libnope.so").await.unwrap();
        assert!(matches!(missing, Resolution::NotFound { .. }));

        // Large files are still relocated, just not held inline
        let libz = resolver.resolve("libz.so.1").await.unwrap();
        assert_eq!(
            fs::metadata(libz.local_path().unwrap()).unwrap().len(),
            256 * 1024
        );
    }

    #[tokio::test]
    async fn test_processes_share_one_server_query() {
        let world = World::new();
        let handler = world.handler();

        // Each resolver maps the segment file separately, like distinct processes
        let mut resolvers = Vec::new();
        for _ in 0..4 {
            let cache = Arc::new(ShmCache::open(world.segment_config()).unwrap());
            resolvers.push(Resolver::new(
                HandlerTransport::new(handler.clone()),
                SystemEnv,
                cache,
            ));
        }

        let mut answers = Vec::new();
        for resolver in &mut resolvers {
            answers.push(resolver.resolve("libc.so.6").await.unwrap());
        }
        assert!(answers.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(requests(&handler), 1);
        assert_eq!(
            resolvers.iter().map(|r| r.server_queries()).sum::<u64>(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_directory_is_remembered_on_node() {
        let world = World::new();
        let handler = world.handler();
        let cache = Arc::new(ShmCache::open(world.segment_config()).unwrap());
        let mut resolver =
            Resolver::new(HandlerTransport::new(handler.clone()), SystemEnv, cache.clone());

        let gone = world.path("global/opt/app");
        let first = resolver
            .resolve_exact(&format!("{}/liba.so", gone))
            .await
            .unwrap();
        assert!(matches!(first, Resolution::NotFound { .. }));
        assert_eq!(requests(&handler), 1);

        for name in ["libb.so", "libc.so", "libd.so"] {
            let answer = resolver
                .resolve_exact(&format!("{}/{}", gone, name))
                .await
                .unwrap();
            assert!(matches!(answer, Resolution::NotFound { .. }));
        }
        assert!(!resolver.exists(&format!("{}/x", gone)).await.unwrap());
        assert_eq!(requests(&handler), 1);
    }

    #[tokio::test]
    async fn test_stat_exists_and_orig_path() {
        let world = World::new();
        let handler = world.handler();
        let cache = Arc::new(ShmCache::open(world.segment_config()).unwrap());
        let mut resolver = Resolver::new(HandlerTransport::new(handler.clone()), SystemEnv, cache);

        let libc = world.path("global/lib/libc.so.6");
        let record = resolver.stat(&libc, false).await.unwrap().unwrap();
        assert_eq!(record.size, b"libc contents".len() as u64);
        assert_eq!(record.path, libc);
        assert!(resolver.stat(&world.path("global/lib/none"), true).await.unwrap().is_none());

        assert!(resolver.exists(&libc).await.unwrap());
        assert!(resolver.exists(&world.path("global/empty")).await.unwrap());
        assert!(!resolver.exists(&world.path("global/lib/none")).await.unwrap());

        let local = resolver.resolve_exact(&libc).await.unwrap();
        let orig = resolver
            .orig_path(local.local_path().unwrap())
            .await
            .unwrap();
        assert_eq!(orig.as_deref(), Some(libc.as_str()));
    }

    #[tokio::test]
    async fn test_python_prefixes_and_scan() {
        let world = World::new();
        let handler = world.handler();
        let cache = Arc::new(ShmCache::open(world.segment_config()).unwrap());
        let mut resolver = Resolver::new(HandlerTransport::new(handler.clone()), SystemEnv, cache);

        assert_eq!(
            resolver.python_prefixes().await.unwrap(),
            vec![world.path("global/usr")]
        );

        let mut records = resolver.scan(&world.path("global/usr/lib")).await.unwrap();
        records.sort_by(|a, b| format!("{:?}", a).cmp(&format!("{:?}", b)));
        let names: Vec<&str> = records
            .iter()
            .filter_map(|r| match r {
                DirRecord::File { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["libm.so.6", "libz.so.1"]);

        let empty = resolver.scan(&world.path("global/empty")).await.unwrap();
        assert!(matches!(empty.as_slice(), [DirRecord::EmptyDirectory { .. }]));

        let missing = resolver.scan(&world.path("global/nowhere")).await.unwrap();
        assert!(matches!(missing.as_slice(), [DirRecord::MissingDirectory { .. }]));
    }

    #[tokio::test]
    async fn test_disabled_cache_falls_back_to_server() {
        let world = World::new();
        let handler = world.handler();
        let config = ShmCacheConfig {
            heap_limit: 0,
            ..world.segment_config()
        };
        let cache = Arc::new(ShmCache::open(config).unwrap());
        assert!(!cache.is_enabled());
        let mut resolver = Resolver::new(HandlerTransport::new(handler.clone()), SystemEnv, cache);

        let a = resolver.resolve("libc.so.6").await.unwrap();
        let b = resolver.resolve("libc.so.6").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(requests(&handler), 2);
        // Second request is answered from the directory cache
        assert_eq!(handler.lock().stats().relocations, 1);
    }
}

// =============================================================================
// Socket Server Tests
// =============================================================================

mod socket_tests {
    use super::*;
    use spindle::adapters::UnixTransport;
    use spindle::server::Server;
    use spindle::{ClientConfig, Resolution, Resolver};
    use tokio::sync::oneshot;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resolve_over_unix_socket() {
        let world = World::new();
        let config = world.server_config();
        let handler = QueryHandler::new(&config, SystemEnv).unwrap();
        let server = Server::bind(&config, handler).unwrap();
        let socket = server.socket_path().to_path_buf();

        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));

        let cache = Arc::new(ShmCache::open(world.segment_config()).unwrap());
        for _ in 0..2 {
            let transport = UnixTransport::connect(&socket).await.unwrap();
            let mut resolver = Resolver::new(transport, SystemEnv, cache.clone());
            let answer = resolver.resolve("libc.so.6").await.unwrap();
            assert!(matches!(answer, Resolution::Found(_)));
            assert!(resolver.exists(&world.path("global/lib/libc.so.6")).await.unwrap());
            resolver.close().await.unwrap();
        }

        stop.send(()).unwrap();
        let stats = running.await.unwrap().unwrap();
        // libc resolved once, exists asked once; the rest came from the shared cache
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, 0);
        assert!(!Path::new(&socket).exists());
    }

    /// Serves every connection, answering the very first query late
    async fn slow_first_answer(listener: tokio::net::UnixListener, delay: std::time::Duration) {
        use spindle::adapters::unix_socket::{message_codec, recv_frame, send_frame};
        use spindle::domain::{FileAnswer, Message};
        use std::sync::atomic::{AtomicBool, Ordering};
        use tokio_util::codec::Framed;

        let stalled = Arc::new(AtomicBool::new(false));
        while let Ok((stream, _)) = listener.accept().await {
            let stalled = stalled.clone();
            tokio::spawn(async move {
                let mut frames = Framed::new(stream, message_codec());
                while let Ok(Some(message)) = recv_frame(&mut frames).await {
                    let Message::FileQuery { path } = message else {
                        continue;
                    };
                    if !stalled.swap(true, Ordering::SeqCst) {
                        tokio::time::sleep(delay).await;
                    }
                    let answer = Message::FileQueryAnswer {
                        answer: FileAnswer::Found {
                            path: format!("/local/{}", path),
                        },
                    };
                    if send_frame(&mut frames, &answer).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_answer_does_not_leak_into_cache() {
        let world = World::new();
        let socket = world.root.path().join("slow.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(slow_first_answer(
            listener,
            std::time::Duration::from_millis(300),
        ));

        let cache = Arc::new(ShmCache::open(world.segment_config()).unwrap());
        let config = ClientConfig {
            request_timeout_ms: 100,
            ..Default::default()
        };
        let transport = UnixTransport::connect(&socket).await.unwrap();
        let mut resolver = Resolver::with_config(transport, SystemEnv, cache.clone(), config);

        assert!(resolver.resolve("liba.so").await.unwrap_err().is_bypassable());
        // Give the late answer time to arrive on the old connection
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(resolver.resolve("libb.so").await.is_err());
        assert_ne!(
            cache.lookup("libb.so").unwrap(),
            Some(CachedValue::Resolved("/local/liba.so".into()))
        );

        resolver.reconnect(UnixTransport::connect(&socket).await.unwrap());
        assert_eq!(
            resolver.resolve("libb.so").await.unwrap(),
            Resolution::Found("/local/libb.so".into())
        );
        assert_eq!(
            cache.lookup("libb.so").unwrap(),
            Some(CachedValue::Resolved("/local/libb.so".into()))
        );
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_server_is_bypassable() {
        let world = World::new();
        let err = UnixTransport::connect(world.root.path().join("absent.sock"))
            .await
            .err()
            .unwrap();
        assert!(err.is_bypassable());
    }
}

// =============================================================================
// Shared Cache Tests
// =============================================================================

mod shared_cache_tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_single_owner_across_mappings() {
        let world = World::new();
        let config = world.segment_config();
        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let config = config.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let cache = ShmCache::open(config).unwrap();
                    barrier.wait();
                    match cache.lookup_or_add("/usr/lib/libshared.so").unwrap() {
                        Lookup::NotFound => {
                            cache
                                .update("/usr/lib/libshared.so", Some("/local/libshared.so"))
                                .unwrap();
                            (true, CachedValue::Resolved("/local/libshared.so".into()))
                        }
                        Lookup::Found(CachedValue::InProgress) => {
                            (false, cache.wait_for_update("/usr/lib/libshared.so").unwrap())
                        }
                        Lookup::Found(value) => (false, value),
                        Lookup::Bypass => panic!("cache unexpectedly disabled"),
                    }
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(owner, _)| *owner).count(), 1);
        assert!(results
            .iter()
            .all(|(_, v)| *v == CachedValue::Resolved("/local/libshared.so".into())));
    }

    #[test]
    fn test_entries_survive_reattach() {
        let world = World::new();
        {
            let cache = ShmCache::open(world.segment_config()).unwrap();
            cache.add("&/etc/hosts", Some("y")).unwrap();
            cache.add("^/opt/gone", Some("NODR")).unwrap();
        }
        let cache = ShmCache::open(world.segment_config()).unwrap();
        assert_eq!(
            cache.lookup("&/etc/hosts").unwrap(),
            Some(CachedValue::Resolved("y".into()))
        );
        assert_eq!(cache.stats().entries, 2);
        assert!(cache.check_heap().is_ok());
    }
}
