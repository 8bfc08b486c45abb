//! Asynchronous synchronization primitives between tasks on the same
//! scheduler: single-use ([`oneshot_notify`], [`oneshot_channel`]) and
//! multi-use ([`notify`], [`channel`]) building blocks, all `Rc`-based and
//! therefore `!Send`/`!Sync` like everything else in this runtime (§5).

pub mod channel;
pub mod notify;
pub mod oneshot_channel;
pub mod oneshot_notify;
