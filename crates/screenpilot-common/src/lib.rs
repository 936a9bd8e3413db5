#![deny(clippy::all)]

mod sync;
mod text;

pub use sync::mutex_lock_or_recover;
pub use text::truncate_payload;
