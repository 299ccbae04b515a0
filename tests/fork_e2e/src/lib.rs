//! CONTEXT: exo-fork end-to-end test harness library
//! INTENT: Multi-generation fork scenarios on the host exokernel model
//! DEPS: exo-fork (host backend), exo-abi
//! READINESS: Host machine spawned; root environment has its data pages mapped
//! TESTS: Three-generation isolation, binary fork tree, frame reclamation
// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use exo_abi::{AbiError, EnvId, PteFlags, VirtAddr};
use exo_fork::host::{Exit, HostEnv, HostMachine};
use exo_fork::{Fatal, ForkOutcome, Process, Syscalls};
use log::info;

/// Page every scenario writes its marker into.
pub const SCRATCH: VirtAddr = VirtAddr::new(0x0080_0000);

/// Spawns a root environment with a zeroed writable page at [`SCRATCH`].
pub fn boot(machine: &HostMachine) -> Result<Process<HostEnv>, AbiError> {
    let proc = Process::new(machine.spawn()?);
    proc.kernel().page_alloc(EnvId::SELF, SCRATCH, PteFlags::USER_RW)?;
    Ok(proc)
}

/// Forks `parent` and runs the child up to its return from `fork`.
pub fn fork_child(
    machine: &HostMachine,
    parent: &mut Process<HostEnv>,
) -> Result<Process<HostEnv>, Fatal> {
    let ForkOutcome::Parent(id) = parent.fork()? else {
        unreachable!("exofork returned the child side to its creator");
    };
    let kernel = machine.resume(id).map_err(|source| Fatal::Kernel { op: "resume", source })?;
    let mut child = parent.resume_child(kernel);
    child.fork()?;
    Ok(child)
}

/// Writes `name` (NUL-terminated) into the scratch page.
pub fn label(proc: &Process<HostEnv>, name: &str) -> Result<(), Exit> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    proc.write(SCRATCH, &bytes)
}

/// Reads the NUL-terminated label from the scratch page.
pub fn read_label(proc: &Process<HostEnv>) -> Result<String, Exit> {
    let mut buf = [0u8; 16];
    proc.read(SCRATCH, &mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Binary fork tree: every node labels itself, then forks a `0` and a `1`
/// child until names reach `depth` characters. Returns every node with its
/// name, root first.
pub fn forktree(
    machine: &HostMachine,
    root: Process<HostEnv>,
    depth: usize,
) -> Result<Vec<(String, Process<HostEnv>)>, Exit> {
    let mut done = Vec::new();
    let mut pending = vec![(String::new(), root)];
    while let Some((name, mut proc)) = pending.pop() {
        label(&proc, &name)?;
        if name.len() < depth {
            for branch in ['0', '1'] {
                let child = fork_child(machine, &mut proc)?;
                let child_name = format!("{name}{branch}");
                info!("{}: I am '{child_name}'", child.kernel().id());
                pending.push((child_name, child));
            }
        }
        done.push((name, proc));
    }
    Ok(done)
}
