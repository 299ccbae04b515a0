//! CONTEXT: exo-fork end-to-end scenarios across several generations
//! INTENT: Isolation holds transitively and every frame is reclaimed afterwards
//! DEPS: exo-fork-e2e harness
//! TESTS: Three-generation isolation, fork tree labels, teardown accounting

use exo_abi::{EnvId, PteFlags};
use exo_fork::host::{HostConfig, HostMachine};
use exo_fork::Syscalls;
use exo_fork_e2e::{boot, fork_child, forktree, label, read_label, SCRATCH};

#[test]
fn three_generations_stay_isolated() {
    let machine = HostMachine::default();
    let mut a = boot(&machine).unwrap();
    a.write_u32(SCRATCH, 0xA).unwrap();

    let mut b = fork_child(&machine, &mut a).unwrap();
    b.write_u32(SCRATCH, 0xB).unwrap();
    let c = fork_child(&machine, &mut b).unwrap();

    assert_eq!(c.read_u32(SCRATCH).unwrap(), 0xB);
    c.write_u32(SCRATCH, 0xC).unwrap();

    assert_eq!(a.read_u32(SCRATCH).unwrap(), 0xA);
    assert_eq!(b.read_u32(SCRATCH).unwrap(), 0xB);
    assert_eq!(c.read_u32(SCRATCH).unwrap(), 0xC);

    let frames: Vec<_> = [&a, &b, &c]
        .iter()
        .map(|p| machine.frame_of(p.kernel().id(), SCRATCH).unwrap())
        .collect();
    assert_ne!(frames[0], frames[1]);
    assert_ne!(frames[1], frames[2]);
    assert_ne!(frames[0], frames[2]);
}

#[test]
fn grandchild_sees_cow_of_cow() {
    let machine = HostMachine::default();
    let mut a = boot(&machine).unwrap();
    let mut b = fork_child(&machine, &mut a).unwrap();
    let c = fork_child(&machine, &mut b).unwrap();

    let cow = PteFlags::USER_PRESENT | PteFlags::COW;
    let frame = machine.frame_of(a.kernel().id(), SCRATCH).unwrap();
    for proc in [&a, &b, &c] {
        assert_eq!(machine.flags_of(proc.kernel().id(), SCRATCH), Some(cow));
        assert_eq!(machine.frame_of(proc.kernel().id(), SCRATCH), Some(frame));
    }
    assert_eq!(machine.refcount(frame), 3);
    assert_eq!(b.last_fork_report().unwrap().cow_pages, 1);
}

#[test]
fn forktree_nodes_keep_their_own_label() {
    let machine = HostMachine::new(HostConfig { frames: 256, max_envs: 16 });
    let nodes = forktree(&machine, boot(&machine).unwrap(), 3).unwrap();
    assert_eq!(nodes.len(), 15);
    assert_eq!(machine.env_count(), 15);
    for (name, proc) in &nodes {
        assert_eq!(&read_label(proc).unwrap(), name);
    }
}

#[test]
fn teardown_returns_every_frame() {
    let machine = HostMachine::new(HostConfig { frames: 256, max_envs: 16 });
    let nodes = forktree(&machine, boot(&machine).unwrap(), 2).unwrap();
    assert!(machine.free_frames() < 256);

    for (_, proc) in nodes.iter().rev() {
        proc.kernel().env_destroy(EnvId::SELF).unwrap();
    }
    assert_eq!(machine.env_count(), 0);
    assert_eq!(machine.free_frames(), 256);
}

#[test]
fn relabel_after_fork_is_private() {
    let machine = HostMachine::default();
    let mut root = boot(&machine).unwrap();
    label(&root, "root").unwrap();
    let child = fork_child(&machine, &mut root).unwrap();
    label(&child, "kid").unwrap();
    assert_eq!(read_label(&root).unwrap(), "root");
    assert_eq!(read_label(&child).unwrap(), "kid");
}
