//! Event loop helpers
//!
//! Transports are single-threaded: they live on a tokio current-thread
//! runtime inside a [`LocalSet`] and share state through `Rc`/`RefCell`.
//! Every transport constructor and method must be called from within such a
//! `LocalSet` (for example under [`block_on`]).

use std::future::Future;
use std::io;

use tokio::runtime::Builder;
use tokio::task::LocalSet;

/// Run `future` to completion on a fresh current-thread runtime with a
/// `LocalSet`, so transports can be created inside it.
pub fn block_on<F: Future>(future: F) -> io::Result<F::Output> {
    let runtime = Builder::new_current_thread().enable_all().build()?;
    Ok(LocalSet::new().block_on(&runtime, future))
}

/// Run `callback` on a later turn of the loop.
///
/// Panics outside a `LocalSet`.
pub fn call_soon<F>(callback: F)
where
    F: FnOnce() + 'static,
{
    tokio::task::spawn_local(async move { callback() });
}
