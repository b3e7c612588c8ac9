// Repository layer for database operations

pub mod dispatch;
pub mod queries;
pub mod subscription;

pub use dispatch::DispatchRepository;
pub use subscription::SubscriptionRepository;
