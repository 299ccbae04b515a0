// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level copy-on-write fork for the exokernel
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Process<K>: per-environment runtime (fork, sfork, set_pgfault_handler)
//!   - cow::handle_cow_fault(): the default page-fault handler
//!   - duppage(): share one page with a child
//!   - Syscalls / PageTableView / EnvTable / UserMemory / Kernel: kernel surface
//!   - Fatal: reasons the runtime terminates an environment
//!   - host (feature `std`): in-process kernel model used by the tests
//!
//! SECURITY INVARIANTS:
//!   - Permissions handed to the kernel never carry bits outside `PteFlags::SYSCALL`
//!   - A page is downgraded in the child before it is downgraded in the parent
//!   - The exception stack is private to each environment and never COW
//!
//! ERROR CONDITIONS:
//!   - Every kernel failure is fatal; the environment is destroyed and the
//!     reason is logged at `error` level
//!
//! DEPENDENCIES:
//!   - exo-abi: ids, PTE flags, layout, errno
//!   - thiserror: `Fatal`, host `Trap`
//!   - log: "pgfault", "cow", "fork", "host" targets
//!   - parking_lot (std): host machine lock
//!
//! FEATURES:
//!   - std (default): host backend

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod cow;
mod duppage;
mod fatal;
mod fork;
mod pgfault;
mod process;
mod sys;
mod vpt;

#[cfg(test)]
mod mock;

#[cfg(feature = "std")]
pub mod host;

pub use duppage::{duppage, Sharing};
pub use fatal::Fatal;
pub use fork::{ForkOutcome, ForkReport};
pub use pgfault::{FaultRecord, PgfaultHandler, PgfaultState};
pub use process::Process;
pub use sys::{EnvInfo, EnvTable, Kernel, PageTableView, Syscalls, UserMemory};
pub use vpt::Mappings;
