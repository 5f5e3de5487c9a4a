//! Pieces of the entry-point injection protocol that are pure byte and
//! address manipulation. The live-process driver sits in the windows
//! spawner; everything here runs and tests anywhere.

pub(crate) mod exports;
pub(crate) mod payload;

use std::time::Duration;

/// `jmp $`. Written over the target's entry point so the loader parks the
/// initial thread there while the payload is staged.
pub(crate) const ENTRY_TRAP: [u8; 2] = [0xeb, 0xfe];

/// Interval between instruction-pointer polls while the target works its
/// way through its own loader.
pub(crate) const ENTRY_POLL_INTERVAL: Duration = Duration::from_millis(10);
