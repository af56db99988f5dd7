#![deny(clippy::all)]

mod clock;
pub mod error_kind;
mod sync;

pub use clock::now_millis;
pub use error_kind::ErrorKind;
pub use sync::mutex_lock_or_recover;
pub use sync::poison_recovery_count;
pub use sync::rwlock_read_or_recover;
pub use sync::rwlock_write_or_recover;
