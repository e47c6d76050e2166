//! Shared fixtures for the end-to-end tests.
#![allow(dead_code)]

use std::sync::Arc;

use streambus::ZmqSocketFactory;
use tempfile::TempDir;

/// Wire messages used by the scenarios.
pub mod contract {
    /// Command setting a property on a named element.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SetterCommand {
        #[prost(string, tag = "1")]
        pub element_name: String,
        #[prost(string, tag = "2")]
        pub property_name: String,
        #[prost(bytes = "vec", tag = "3")]
        pub value_data: Vec<u8>,
    }

    /// Event announcing a property change.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PropertyChangedEvent {
        #[prost(string, tag = "1")]
        pub element_name: String,
        #[prost(string, tag = "2")]
        pub property_name: String,
        #[prost(bytes = "vec", tag = "3")]
        pub value_data: Vec<u8>,
    }

    /// Typed error detail.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ErrorDetail {
        #[prost(string, tag = "1")]
        pub detail: String,
    }

    pub const SETTER: u32 = 1;
    pub const PROPERTY_CHANGED: u32 = 1;
    pub const ERROR_DETAIL: u32 = 999;
}

/// One IPC root per test, removed when the guard drops.
pub fn ipc_factory() -> (TempDir, Arc<ZmqSocketFactory>) {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let root = format!("ipc://{}", dir.path().join("bus").display());
    let factory = ZmqSocketFactory::new(root).expect("socket factory");
    (dir, Arc::new(factory))
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
