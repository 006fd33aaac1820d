mod detector;
mod error;
mod event;
mod repository;
mod types;

pub use detector::{Detector, DetectorFactory, Scored};
pub use error::{DomainError, DomainResult};
pub use event::BusEvent;
pub use repository::{
    AnomalyQuery, AnomalyRepository, CreateDeviceInput, DeviceRepository, PointQuery,
    PointRepository, StoreHealth, StoreStats, UpsertDeviceInput,
};
pub use types::{Anomaly, Device, DeviceWithCounts, DetectorKind, EntityCounts, Point};

#[cfg(any(test, feature = "mocks"))]
pub use repository::{
    MockAnomalyRepository, MockDeviceRepository, MockPointRepository, MockStoreHealth,
};
