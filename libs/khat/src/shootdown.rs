// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-CPU translation cache invalidation.
//!
//! After editing a context's tables the editing CPU invalidates its own caches and asks every
//! other CPU that may have cached the old translations to do the same. Those requests are
//! delivered in one of three ways:
//!
//! - **locally** when the editing CPU itself runs the context,
//! - by **deferral** when the target CPU is idle: the request is recorded in the CPU's
//!   [`IdleState`] and the CPU flushes everything itself before it leaves the idle loop,
//! - by a synchronous **cross-call** otherwise.
//!
//! A PTE write always happens-before the cross-call that covers it is sent, and the remote
//! invalidation happens-before the cross-call returns.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::Arch;
use crate::context::Context;
use crate::cpu_set::{CpuId, CpuSet};
use crate::flush::Flush;
use crate::frame_alloc::FrameAllocator;
use crate::hat::Hat;
use crate::page::PageDirectory;

const RUNNING: u8 = 0;
const IDLE: u8 = 1;
const IDLE_PENDING: u8 = 2;

/// Idle bookkeeping of one CPU.
///
/// ```text
///            enter               try_defer
/// RUNNING ──────────▶ IDLE ─────────────────▶ IDLE_PENDING
///    ▲                  │                          │
///    └──────────────────┴──────────────────────────┘
///                        leave
/// ```
#[derive(Debug)]
pub(crate) struct IdleState(AtomicU8);

impl IdleState {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(RUNNING))
    }

    pub(crate) fn enter(&self) {
        self.0.store(IDLE, Ordering::SeqCst);
    }

    /// Marks the CPU as running again, returning whether an invalidation was deferred to it.
    pub(crate) fn leave(&self) -> bool {
        self.0.swap(RUNNING, Ordering::SeqCst) == IDLE_PENDING
    }

    /// Attempts to hand an invalidation to an idle CPU instead of interrupting it.
    pub(crate) fn try_defer(&self) -> bool {
        match self
            .0
            .compare_exchange(IDLE, IDLE_PENDING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(state) => state == IDLE_PENDING,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.0.load(Ordering::SeqCst) != RUNNING
    }
}

impl<A, F, P> Hat<A, F, P>
where
    A: Arch,
    F: FrameAllocator,
    P: PageDirectory,
{
    /// Invalidates `flush` on every CPU that may cache translations of `ctx`.
    ///
    /// If `refresh` is set, CPUs running `ctx` on a shadow root recopy its top-level entries
    /// before invalidating.
    pub(crate) fn shootdown(&self, ctx: &Context, flush: &Flush, refresh: bool) {
        if ctx.shares_tables() {
            // Other contexts may translate through our tables at addresses we don't know.
            self.shootdown_everywhere(ctx, refresh);
            return;
        }

        let (targets, global) = if ctx.is_kernel() {
            (&self.online, true)
        } else {
            (ctx.cpus(), false)
        };

        if targets.is_empty() {
            log::trace!("{:?} has no observers, skipping shootdown", ctx.id());
            return;
        }

        let cpus = &self.cpus;
        let arch = &self.arch;
        let threshold = self.config.full_flush_threshold;
        self.deliver(targets, &|cpu| {
            let state = &cpus[cpu.get()];
            if refresh && state.runs(ctx.id()) {
                state.refresh(arch, ctx);
            }
            flush.apply(arch, threshold, global);
        });
    }

    /// Flushes every non-global translation on every online CPU.
    pub(crate) fn shootdown_everywhere(&self, ctx: &Context, refresh: bool) {
        log::trace!("invalidating everywhere on behalf of {:?}", ctx.id());

        let cpus = &self.cpus;
        let arch = &self.arch;
        self.deliver(&self.online, &|cpu| {
            let state = &cpus[cpu.get()];
            if refresh && state.runs(ctx.id()) {
                state.refresh(arch, ctx);
            }
            arch.fence_all();
        });
    }

    fn deliver(&self, targets: &CpuSet, handler: &(dyn Fn(CpuId) + Sync)) {
        let me = self.arch.current_cpu();

        let remote = CpuSet::new();
        for cpu in targets.iter() {
            if cpu == me {
                continue;
            }

            if self.cpus[cpu.get()].idle.try_defer() {
                log::trace!("deferring invalidation to idle {cpu:?}");
                continue;
            }

            remote.insert(cpu);
        }

        if targets.contains(me) {
            handler(me);
        }

        if !remote.is_empty() {
            log::trace!("cross-calling {remote:?}");
            self.arch.cross_call(&remote, handler);
        }
    }

    /// Called by the idle loop before the current CPU halts.
    pub fn enter_idle(&self) {
        let cpu = self.arch.current_cpu();
        self.cpus[cpu.get()].idle.enter();
    }

    /// Called by the idle loop once the current CPU has woken up and before it touches any
    /// non-kernel address. Applies invalidations deferred while the CPU was idle.
    pub fn leave_idle(&self) {
        let cpu = self.arch.current_cpu();
        let state = &self.cpus[cpu.get()];

        if state.idle.leave() {
            log::trace!("{cpu:?} applying deferred invalidation");
            if let Some(ctx) = state.current()
                && ctx.uses_shadow_copy()
            {
                state.refresh(&self.arch, &ctx);
            }
            self.arch.fence_global();
        }
    }

    /// Returns `true` if `cpu` is in the idle loop.
    pub fn is_idle(&self, cpu: CpuId) -> bool {
        self.cpus[cpu.get()].idle.is_idle()
    }
}
