#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use retrieve_endpoint::{EndpointRegistry, RegistryConfig, RowShape};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Anonymous registry with its own segment directory, removed on drop.
pub struct TestRegistry {
    pub registry: EndpointRegistry,
    dir: PathBuf,
}

impl TestRegistry {
    pub fn new(name: &str, max_endpoints: u32) -> Self {
        init_tracing();
        let dir = std::env::temp_dir().join(format!(
            "retrieve-endpoint-test-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let config = RegistryConfig::default()
            .with_max_endpoints(max_endpoints)
            .with_queue_capacity(4096)
            .with_wait_tick(Duration::from_millis(20))
            .with_segment_dir(&dir);
        let registry = EndpointRegistry::anonymous(config).unwrap();
        Self { registry, dir }
    }

    /// Queue segment files still on disk.
    pub fn segment_files(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl std::ops::Deref for TestRegistry {
    type Target = EndpointRegistry;

    fn deref(&self) -> &EndpointRegistry {
        &self.registry
    }
}

impl Drop for TestRegistry {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

pub fn shape() -> RowShape {
    RowShape::default().column("id", 23).column("payload", 17)
}

/// Poll `cond` until it holds or five seconds pass.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
