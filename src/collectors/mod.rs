pub mod gc;
pub mod repository;
pub mod system;

pub use gc::GcHistory;
pub use repository::RepositoryCollector;
pub use system::SystemCollector;
