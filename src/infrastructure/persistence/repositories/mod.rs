pub mod snapshot_repository;

pub use snapshot_repository::SqliteSnapshotRepository;
