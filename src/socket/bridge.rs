//! Dispatch from stack callbacks to the handle that issued the connect.
//!
//! The stack only knows an opaque callback argument. Here that argument is a
//! `Weak<HandleCore>` captured by the closures registered in
//! [`ClientHandle`](crate::socket::client::ClientHandle)'s connect path. These
//! functions recover the handle and forward to it; a handle that no longer
//! exists gets its connection aborted.

use crate::socket::client::HandleCore;
use crate::stack::{RawConn, StackStatus};
use std::rc::Weak;

/// Connected callback for a blocking connect: attach, then resume the caller.
pub(crate) fn connected(arg: &Weak<HandleCore>, pcb: RawConn, status: StackStatus) -> StackStatus {
    let Some(core) = arg.upgrade() else { return abandon(pcb) };
    match core.attach(pcb, status) {
        Ok(pending) => {
            pending.resume();
            StackStatus::Ok
        }
        Err(status) => status,
    }
}

/// Connected callback for a non-blocking connect: attach only.
pub(crate) fn connected_nonblocking(
    arg: &Weak<HandleCore>,
    pcb: RawConn,
    status: StackStatus,
) -> StackStatus {
    let Some(core) = arg.upgrade() else { return abandon(pcb) };
    match core.attach(pcb, status) {
        Ok(_) => StackStatus::Ok,
        Err(status) => status,
    }
}

/// Error callback for a connect attempt. The stack has freed the connection.
pub(crate) fn error(arg: &Weak<HandleCore>, status: StackStatus) {
    if let Some(core) = arg.upgrade() {
        if let Some(pending) = core.fail(status) {
            pending.resume();
        }
    }
}

fn abandon(pcb: RawConn) -> StackStatus {
    tracing::debug!(conn = %pcb.id(), "connect completed for a dropped handle");
    pcb.clear_callbacks();
    pcb.abort();
    StackStatus::Abrt
}
