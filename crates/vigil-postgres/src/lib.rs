mod anomaly_repository;
mod client;
mod device_repository;
mod point_repository;

pub use anomaly_repository::PostgresAnomalyRepository;
pub use client::{PostgresClient, PostgresConfig};
pub use device_repository::PostgresDeviceRepository;
pub use point_repository::PostgresPointRepository;
