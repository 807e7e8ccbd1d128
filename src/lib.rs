//! # enclosure-dl
//!
//! Bounded-concurrency download engine for podcast enclosures and similar media.
//!
//! ## Design Philosophy
//!
//! enclosure-dl is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding in a feed reader
//! - **Bounded** - A fixed number of transfers run at once, the rest wait in FIFO order
//! - **Resumable** - Paused transfers keep their partial file and continue with a range request
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use enclosure_dl::{Config, DownloadManager, Event, QueueRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.download.max_concurrent_downloads = 3;
//!
//!     let manager = DownloadManager::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let Event::Stopped { id, state, .. } = event {
//!                 println!("item {} finished as {}", id, state);
//!             }
//!         }
//!     });
//!
//!     manager.queue(QueueRequest::new(1, "https://feeds.example.com/ep1.mp3"))?;
//!     manager.wait_idle().await;
//!     manager.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Serialized command execution with a single consumer
pub mod command_queue;
/// Configuration types
pub mod config;
/// Item-keyed download manager
pub mod downloader;
/// Error types
pub mod error;
/// Bounded-concurrency task scheduling
pub mod group;
/// URL validation and destination paths
pub mod paths;
/// Download tasks and their transfers
pub mod task;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use command_queue::{CommandQueue, QueueEvent};
pub use config::{Config, DownloadConfig, HttpConfig};
pub use downloader::DownloadManager;
pub use error::{Error, Result};
pub use group::{TaskEvent, TaskGroup, TaskListener};
pub use task::{Body, ByteStream, DownloadTask, HttpTransport, Progress, TaskSnapshot, Transport};
pub use types::{Event, GroupStats, ItemId, Payload, QueueRequest, TaskId, TaskState};
