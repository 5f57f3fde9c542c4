//! The two producers of block-number work: the live head syncer and the gap
//! sweeping janitor. Both submit to the same [`WorkerPool`](crate::pool::WorkerPool)
//! and run until their shutdown token is cancelled.

pub mod head;
pub mod janitor;
