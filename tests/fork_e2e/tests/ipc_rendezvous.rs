// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rendezvous IPC between environments
//! INTENT: Sends before a receive are refused; concurrent senders race fairly for one receiver
//! DEPS: cortex (kernel model, KernelLock), cortex-user (ipc wrappers)
//! TESTS: send-before-receive then value 42, threaded winner-takes-all race

use std::sync::{Arc, Barrier};
use std::thread;

use cortex::KernelLock;
use cortex_abi::layout::UTOP;
use cortex_abi::{EnvId, PteFlags, SysError, Syscalls, VirtAddr};
use cortex_user::ipc;
use fork_e2e::{boot, run, ROOT_ENTRY};

const NO_PAGE: VirtAddr = VirtAddr::new(UTOP);

#[test]
fn send_before_receive_is_refused_then_delivered() {
    let (mut kernel, sender) = boot(64);
    let target = kernel.create_env(ROOT_ENTRY).unwrap();

    let early = run(&mut kernel, sender, |ctx| {
        ctx.ipc_try_send(target, 42, NO_PAGE, PteFlags::empty())
    });
    assert_eq!(early, Err(SysError::TargetNotReceiving));

    let blocked = run(&mut kernel, target, |ctx| ipc::recv(ctx, None).unwrap());
    let sent = run(&mut kernel, sender, |ctx| {
        ctx.ipc_try_send(target, 42, NO_PAGE, PteFlags::empty())
    });
    assert_eq!(sent, Ok(()));

    let got = run(&mut kernel, target, |ctx| blocked.complete(&*ctx)).unwrap();
    assert_eq!(got.from, sender);
    assert_eq!(got.value, 42);
    assert!(got.perm.is_empty());
}

#[test]
fn concurrent_senders_have_exactly_one_winner() {
    const SENDERS: usize = 6;

    let (mut kernel, receiver) = boot(128);
    let senders: Vec<EnvId> =
        (0..SENDERS).map(|_| kernel.create_env(ROOT_ENTRY).unwrap()).collect();
    let blocked = run(&mut kernel, receiver, |ctx| ipc::recv(ctx, None).unwrap());

    let lock = Arc::new(KernelLock::new(kernel));
    let barrier = Arc::new(Barrier::new(SENDERS));
    let handles: Vec<_> = senders
        .iter()
        .enumerate()
        .map(|(i, &sender)| {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let value = 100 + i as u32;
                let result = lock.with(|kernel| {
                    let mut ctx = kernel.enter(sender).expect("sender runnable");
                    ctx.ipc_try_send(receiver, value, NO_PAGE, PteFlags::empty())
                });
                (sender, value, result)
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().expect("sender thread")).collect();

    let winners: Vec<_> = outcomes.iter().filter(|(_, _, r)| r.is_ok()).collect();
    assert_eq!(winners.len(), 1, "outcomes: {outcomes:?}");
    for (_, _, result) in outcomes.iter().filter(|(_, _, r)| r.is_err()) {
        assert_eq!(*result, Err(SysError::TargetNotReceiving));
    }

    let (winner, value, _) = *winners[0];
    let mut kernel = Arc::try_unwrap(lock).ok().expect("threads joined").into_inner();
    let got = run(&mut kernel, receiver, |ctx| blocked.complete(&*ctx)).unwrap();
    assert_eq!(got.from, winner);
    assert_eq!(got.value, value);
}
